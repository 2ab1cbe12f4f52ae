//! Ordered fallback chain of providers, each behind its own breaker.
//!
//! Every backend gets the same treatment: skip it if its breaker refuses,
//! otherwise call it with a deadline and feed the outcome back to the
//! breaker. When the list is exhausted the inert fallback answers, so a
//! caller only ever sees an error if it cancelled the call itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use super::offline::{NoopProvider, DEGRADED_CONTENT};
use super::provider::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use crate::error::RuntimeError;

/// Maximum number of fallback events to keep in the ring buffer.
const MAX_FALLBACK_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    /// Deadline for a single backend call.
    pub call_timeout: Duration,
    /// How long a cancelled call may keep running before it is abandoned.
    pub cancel_grace: Duration,
    pub breaker: BreakerConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_millis(2000),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Why the chain moved past a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    BreakerOpen,
    Timeout,
    RateLimited,
    Error,
}

impl From<&ProviderError> for FallbackReason {
    fn from(e: &ProviderError) -> Self {
        match e {
            ProviderError::Timeout(_) => Self::Timeout,
            ProviderError::RateLimited(_) => Self::RateLimited,
            _ => Self::Error,
        }
    }
}

/// A single fallback: the chain gave up on one provider and moved on.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub from_provider: String,
    pub reason: FallbackReason,
    pub detail: String,
    /// Provider that finally answered (None if the call was cancelled).
    pub to_provider: Option<String>,
    /// 1-indexed position of `from_provider` in the chain.
    pub attempt_number: u32,
    /// Total number of entries in the chain, including the inert fallback.
    pub chain_length: u32,
}

struct ChainLink {
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
}

enum CallOutcome {
    Completed(Result<String, ProviderError>),
    /// Cancelled, and either gave up within the grace period or ran past it.
    Abandoned,
}

pub struct ProviderChain {
    links: Vec<ChainLink>,
    fallback: Arc<dyn Provider>,
    config: ChainConfig,
    events: RwLock<VecDeque<FallbackEvent>>,
}

impl ProviderChain {
    /// Build a chain over `providers`, tried in order, ending in a
    /// [`NoopProvider`].
    pub fn new(providers: Vec<Arc<dyn Provider>>, config: ChainConfig) -> Self {
        let links = providers
            .into_iter()
            .map(|provider| ChainLink {
                breaker: CircuitBreaker::new(provider.id(), config.breaker),
                provider,
            })
            .collect();
        Self {
            links,
            fallback: Arc::new(NoopProvider::new()),
            config,
            events: RwLock::new(VecDeque::new()),
        }
    }

    /// Replace the inert last-resort backend.
    pub fn with_fallback(mut self, fallback: Arc<dyn Provider>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Provider ids in call order, inert fallback last.
    pub fn provider_ids(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|l| l.provider.id().to_string())
            .chain(std::iter::once(self.fallback.id().to_string()))
            .collect()
    }

    pub fn breaker(&self, provider_id: &str) -> Option<&CircuitBreaker> {
        self.links
            .iter()
            .find(|l| l.provider.id() == provider_id)
            .map(|l| &l.breaker)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.links.iter().map(|l| l.breaker.snapshot()).collect()
    }

    /// Most recent fallback events, oldest first.
    pub async fn recent_fallbacks(&self, limit: usize) -> Vec<FallbackEvent> {
        let events = self.events.read().await;
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Ask the chain for a completion.
    ///
    /// Never fails because a backend is down; the only error is
    /// `Cancelled`, when `cancel` fires.
    pub async fn invoke(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, RuntimeError> {
        let chain_length = self.links.len() as u32 + 1;
        let mut skipped: Vec<FallbackEvent> = Vec::new();

        for (idx, link) in self.links.iter().enumerate() {
            let provider_id = link.provider.id();
            let attempt = idx as u32 + 1;
            if cancel.is_cancelled() {
                self.record(skipped, None).await;
                return Err(RuntimeError::Cancelled(
                    "provider call cancelled before dispatch".to_string(),
                ));
            }

            let permit = match link.breaker.acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::debug!(provider = %provider_id, "Skipping provider: {}", e);
                    skipped.push(fallback_event(
                        provider_id,
                        FallbackReason::BreakerOpen,
                        e.to_string(),
                        attempt,
                        chain_length,
                    ));
                    continue;
                }
            };

            let started = Instant::now();
            match self.call(link.provider.as_ref(), request, cancel).await {
                CallOutcome::Completed(Ok(content)) => {
                    permit.success();
                    let latency_ms = started.elapsed().as_millis() as u64;
                    if !skipped.is_empty() {
                        tracing::info!(
                            provider = %provider_id,
                            attempt,
                            "Provider answered after fallback"
                        );
                    }
                    self.record(skipped, Some(provider_id)).await;
                    return Ok(ProviderResponse {
                        provider: provider_id.to_string(),
                        content,
                        degraded: false,
                        latency_ms,
                        attempt,
                    });
                }
                CallOutcome::Completed(Err(ProviderError::Cancelled)) | CallOutcome::Abandoned => {
                    drop(permit);
                    self.record(skipped, None).await;
                    return Err(RuntimeError::Cancelled(format!(
                        "call to {} cancelled",
                        provider_id
                    )));
                }
                CallOutcome::Completed(Err(e)) => {
                    permit.failure();
                    tracing::warn!(
                        provider = %provider_id,
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Provider call failed, falling back: {}",
                        e
                    );
                    skipped.push(fallback_event(
                        provider_id,
                        FallbackReason::from(&e),
                        e.to_string(),
                        attempt,
                        chain_length,
                    ));
                }
            }
        }

        let started = Instant::now();
        let content = match self.fallback.invoke(request, cancel).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(provider = %self.fallback.id(), "Inert fallback failed: {}", e);
                DEGRADED_CONTENT.to_string()
            }
        };
        tracing::warn!(
            providers = self.links.len(),
            "All providers unavailable, answering from inert fallback"
        );
        self.record(skipped, Some(self.fallback.id())).await;
        Ok(ProviderResponse {
            provider: self.fallback.id().to_string(),
            content,
            degraded: true,
            latency_ms: started.elapsed().as_millis() as u64,
            attempt: chain_length,
        })
    }

    /// Call one backend with the configured deadline.
    ///
    /// Cancellation is cooperative: the backend sees the token and gets
    /// `cancel_grace` to wind down before the call is dropped.
    async fn call(
        &self,
        provider: &dyn Provider,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        let call = provider.invoke(request, cancel);
        tokio::pin!(call);

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.config.call_timeout, &mut call) => Some(result),
        };

        match first {
            Some(Ok(result)) => CallOutcome::Completed(result),
            Some(Err(_)) => CallOutcome::Completed(Err(ProviderError::Timeout(self.config.call_timeout))),
            None => match tokio::time::timeout(self.config.cancel_grace, &mut call).await {
                Ok(Ok(content)) => CallOutcome::Completed(Ok(content)),
                Ok(Err(_)) => CallOutcome::Abandoned,
                Err(_) => {
                    tracing::warn!(
                        provider = %provider.id(),
                        grace_ms = self.config.cancel_grace.as_millis() as u64,
                        "Provider ignored cancellation, abandoning call"
                    );
                    CallOutcome::Abandoned
                }
            },
        }
    }

    async fn record(&self, mut skipped: Vec<FallbackEvent>, answered_by: Option<&str>) {
        if skipped.is_empty() {
            return;
        }
        let mut events = self.events.write().await;
        for mut event in skipped.drain(..) {
            event.to_provider = answered_by.map(str::to_string);
            events.push_back(event);
        }
        while events.len() > MAX_FALLBACK_EVENTS {
            events.pop_front();
        }
    }
}

fn fallback_event(
    provider: &str,
    reason: FallbackReason,
    detail: String,
    attempt: u32,
    chain_length: u32,
) -> FallbackEvent {
    FallbackEvent {
        timestamp: chrono::Utc::now(),
        from_provider: provider.to_string(),
        reason,
        detail,
        to_provider: None,
        attempt_number: attempt,
        chain_length,
    }
}
