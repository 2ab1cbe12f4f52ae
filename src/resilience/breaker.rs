//! Per-provider circuit breaker.
//!
//! ```text
//! CLOSED --(threshold consecutive failures)--> OPEN
//! OPEN --(cooldown elapsed, next call)--> HALF_OPEN (one trial call)
//! HALF_OPEN --(trial succeeds)--> CLOSED
//! HALF_OPEN --(trial fails)--> OPEN (fresh cooldown)
//! ```
//!
//! A call is never let through while the breaker is open and inside its
//! cooldown, and at most one trial is in flight while half-open.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Normal,
    /// The single half-open trial.
    Trial,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_transition: Instant,
    last_transition_at: chrono::DateTime<chrono::Utc>,
    trial_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn transition(&mut self, to: BreakerState) {
        self.state = to;
        self.last_transition = Instant::now();
        self.last_transition_at = chrono::Utc::now();
    }
}

/// Serializable view of a breaker for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub cooldown_secs: f64,
    pub cooldown_remaining_secs: Option<f64>,
    pub last_transition_at: chrono::DateTime<chrono::Utc>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config: BreakerConfig {
                threshold: config.threshold.max(1),
                cooldown: config.cooldown,
            },
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                last_transition_at: chrono::Utc::now(),
                trial_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to make a call.
    ///
    /// Fails with `BreakerOpen` while open inside the cooldown, or while a
    /// half-open trial is already running. The first call after the cooldown
    /// becomes the trial.
    pub fn try_acquire(&self) -> Result<Admission, RuntimeError> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner.last_transition.elapsed();
                if elapsed >= self.config.cooldown {
                    inner.transition(BreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    tracing::info!(provider = %self.provider, "Circuit breaker half-open, allowing trial call");
                    Ok(Admission::Trial)
                } else {
                    inner.total_rejections += 1;
                    Err(RuntimeError::BreakerOpen {
                        provider: self.provider.clone(),
                        remaining_ms: (self.config.cooldown - elapsed).as_millis() as u64,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    Err(RuntimeError::BreakerOpen {
                        provider: self.provider.clone(),
                        remaining_ms: 0,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but the admission is given
    /// back when the returned permit is dropped without a verdict.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, RuntimeError> {
        let admission = self.try_acquire()?;
        Ok(BreakerPermit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != BreakerState::Closed {
            inner.transition(BreakerState::Closed);
            tracing::info!(provider = %self.provider, "Circuit breaker closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        let state = inner.state;
        match state {
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.transition(BreakerState::Open);
                tracing::warn!(
                    provider = %self.provider,
                    cooldown_secs = self.config.cooldown.as_secs_f64(),
                    "Trial call failed, circuit breaker re-opened"
                );
            }
            BreakerState::Closed if inner.consecutive_failures >= self.config.threshold => {
                inner.transition(BreakerState::Open);
                tracing::warn!(
                    provider = %self.provider,
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs_f64(),
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Give back an admission whose call was abandoned without a verdict.
    ///
    /// Counts as neither success nor failure. A released trial lets the next
    /// caller try.
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let cooldown_remaining_secs = match inner.state {
            BreakerState::Open => {
                let elapsed = inner.last_transition.elapsed();
                self.config
                    .cooldown
                    .checked_sub(elapsed)
                    .map(|d| d.as_secs_f64())
            }
            _ => None,
        };
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            threshold: self.config.threshold,
            cooldown_secs: self.config.cooldown.as_secs_f64(),
            cooldown_remaining_secs,
            last_transition_at: inner.last_transition_at,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
        }
    }
}

/// An admitted call. Report its verdict with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it instead releases the admission,
/// so an abandoned half-open trial frees the slot for the next caller.
#[must_use = "dropping a permit releases the admission"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}
