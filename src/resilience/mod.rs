//! Resilience layer: circuit breakers and the provider fallback chain.
//!
//! Agents never talk to a backend directly. They go through a
//! [`ProviderChain`], which tries each configured backend in order behind its
//! own [`CircuitBreaker`] and ends in an inert backend that always answers.

mod breaker;
mod chain;
mod http;
mod offline;
mod provider;

pub use breaker::{Admission, BreakerConfig, BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use chain::{ChainConfig, FallbackEvent, FallbackReason, ProviderChain};
pub use http::HttpProvider;
pub use offline::{NoopProvider, TemplateProvider, DEGRADED_CONTENT, NOOP_PROVIDER, TEMPLATE_PROVIDER};
pub use provider::{Provider, ProviderError, ProviderRequest, ProviderResponse};
