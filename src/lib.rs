//! # Mission Kernel
//!
//! Runtime that lets an operator agent drive a multi-phase delivery mission by
//! delegating work to specialist agents. Every action is scheduled by a FIFO
//! kernel, recorded in an append-only ledger, and shielded from backend
//! outages by circuit-breaker-gated provider chains.
//!
//! ## Architecture
//!
//! ```text
//!   Orchestrator ──submit──▶ Kernel ──resolve──▶ AgentRegistry
//!        │                    │  ▲
//!        │ manifest           │  └── delegate_task (bound after boot)
//!        ▼                    ▼
//!   ManifestStore           Ledger        agents ──▶ ProviderChain ──▶ backends
//! ```
//!
//! ## Task Flow
//! 1. The orchestrator submits the current phase's task
//! 2. The kernel logs `SUBMITTED`, `STARTED`, runs the agent, logs the outcome
//! 3. The operator delegates to a specialist; the child runs after it (FIFO)
//! 4. The orchestrator gates the reported artifacts and moves the phase
//!
//! ## Modules
//! - `kernel`: scheduler, worker pool, cancellation
//! - `ledger`: durable event log (memory, JSONL, SQLite)
//! - `registry`: agents and tools
//! - `delegation`: the `delegate_task` tool
//! - `resilience`: circuit breakers and provider chain
//! - `mission`: phases, manifests, gates, orchestrator
//! - `runtime`: two-phase boot

pub mod agents;
pub mod config;
pub mod delegation;
pub mod error;
pub mod kernel;
pub mod ledger;
pub mod mission;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod task;
pub mod util;

pub use config::Config;
pub use error::{Result, RuntimeError};
pub use kernel::Kernel;
pub use runtime::{ExecutionMode, Runtime};
