//! Configuration management for the mission kernel.
//!
//! Configuration can be set via environment variables:
//! - `MISSION_DATA_DIR` - Optional. Root for the ledger and manifests. Defaults to `./.mission-kernel`.
//! - `MISSION_LEDGER_BACKEND` - Optional. `memory`, `file` or `sqlite`. Defaults to `sqlite`.
//! - `MISSION_BREAKER_THRESHOLD` - Optional. Consecutive failures that open a breaker. Defaults to `5`.
//! - `MISSION_BREAKER_COOLDOWN_SECS` - Optional. Open-state cooldown. Defaults to `30`.
//! - `MISSION_CALL_TIMEOUT_SECS` - Optional. Deadline per backend call. Defaults to `60`.
//! - `MISSION_CANCEL_GRACE_MS` - Optional. Grace period for cancelled calls. Defaults to `2000`.
//! - `MISSION_WORKERS` - Optional. Kernel workers. Defaults to `1`.
//! - `MISSION_PROVIDER_URL` - Optional. Enables the HTTP backend; required in live mode.
//! - `MISSION_PROVIDER_API_KEY` - Optional. Bearer token for the HTTP backend.
//! - `MISSION_PROVIDER_MODEL` - Optional. Model sent to the HTTP backend. Defaults to `default`.
//! - `MISSION_PHASE_PLAN` - Optional. YAML file overriding phase to agent bindings.
//! - `MISSION_AUTO_APPROVE` - Optional. Approve gates that ask for sign-off. Defaults to `false`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ledger::LedgerBackend;
use crate::resilience::{BreakerConfig, ChainConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// HTTP backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Chat-completions endpoint; `None` leaves the backend out of the chain
    pub url: Option<String>,

    pub api_key: Option<String>,

    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            model: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the ledger and mission manifests
    pub data_dir: PathBuf,

    pub ledger_backend: LedgerBackend,

    /// Timeouts, cancellation grace and breaker settings
    pub chain: ChainConfig,

    /// Number of kernel workers
    pub workers: usize,

    pub provider: ProviderConfig,

    /// YAML phase plan overriding the default bindings
    pub phase_plan_path: Option<PathBuf>,

    pub auto_approve: bool,
}

impl Config {
    /// Defaults rooted at `data_dir`, with an in-memory ledger.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ledger_backend: LedgerBackend::Memory,
            chain: ChainConfig::default(),
            workers: 1,
            provider: ProviderConfig::default(),
            phase_plan_path: None,
            auto_approve: false,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("MISSION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".mission-kernel"));

        let ledger_backend = match lookup("MISSION_LEDGER_BACKEND") {
            Some(raw) => LedgerBackend::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "MISSION_LEDGER_BACKEND".to_string(),
                    format!("unknown backend '{}' (expected memory, file or sqlite)", raw),
                )
            })?,
            None => LedgerBackend::default(),
        };

        let threshold: u32 = parse_or(&lookup, "MISSION_BREAKER_THRESHOLD", 5)?;
        if threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "MISSION_BREAKER_THRESHOLD".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let cooldown_secs: u64 = parse_or(&lookup, "MISSION_BREAKER_COOLDOWN_SECS", 30)?;
        let timeout_secs: u64 = parse_or(&lookup, "MISSION_CALL_TIMEOUT_SECS", 60)?;
        let grace_ms: u64 = parse_or(&lookup, "MISSION_CANCEL_GRACE_MS", 2000)?;

        let workers: usize = parse_or(&lookup, "MISSION_WORKERS", 1)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue(
                "MISSION_WORKERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let provider = ProviderConfig {
            url: lookup("MISSION_PROVIDER_URL").filter(|s| !s.trim().is_empty()),
            api_key: lookup("MISSION_PROVIDER_API_KEY").filter(|s| !s.trim().is_empty()),
            model: lookup("MISSION_PROVIDER_MODEL").unwrap_or_else(|| "default".to_string()),
        };

        let auto_approve = match lookup("MISSION_AUTO_APPROVE") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("MISSION_AUTO_APPROVE".to_string(), raw.clone())
            })?,
            None => false,
        };

        Ok(Self {
            data_dir,
            ledger_backend,
            chain: ChainConfig {
                call_timeout: Duration::from_secs(timeout_secs),
                cancel_grace: Duration::from_millis(grace_ms),
                breaker: BreakerConfig {
                    threshold,
                    cooldown: Duration::from_secs(cooldown_secs),
                },
            },
            workers,
            provider,
            phase_plan_path: lookup("MISSION_PHASE_PLAN").map(PathBuf::from),
            auto_approve,
        })
    }

    /// The HTTP endpoint, which live mode cannot run without.
    pub fn require_provider_url(&self) -> Result<&str, ConfigError> {
        self.provider
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("MISSION_PROVIDER_URL".to_string()))
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
