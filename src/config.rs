//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - stratalog.toml (base configuration)
//! - stratalog.local.toml (git-ignored local overrides)
//! - Environment variables (STRATALOG_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # stratalog.toml
//! [limits]
//! max_tuples_per_predicate = 1000000
//! rule_error_threshold = 64
//!
//! [query]
//! default_deadline_ms = 5000
//! trace = false
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! STRATALOG_LIMITS__MAX_TUPLES_PER_PREDICATE=100000
//! STRATALOG_QUERY__TRACE=true
//! ```

use crate::eval::EvalLimits;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resource limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Cap on materialised tuples per predicate (stored or derived).
    #[serde(default = "default_max_tuples")]
    pub max_tuples_per_predicate: usize,

    /// Local errors tolerated per rule before it is quarantined.
    #[serde(default = "default_error_threshold")]
    pub rule_error_threshold: u32,
}

/// Query defaults, overridable per call via `QueryOptions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default operation deadline in milliseconds (absent = unbounded).
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,

    /// Capture derivation provenance by default.
    #[serde(default)]
    pub trace: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_tuples() -> usize {
    1_000_000
}
fn default_error_threshold() -> u32 {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_tuples_per_predicate: default_max_tuples(),
            rule_error_threshold: default_error_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. stratalog.toml (base configuration)
    /// 2. stratalog.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (STRATALOG_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("stratalog.toml"))
            .merge(Toml::file("stratalog.local.toml"))
            .merge(Env::prefixed("STRATALOG_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("STRATALOG_").split("__"))
            .extract()
    }

    /// Evaluator-facing view of the limits.
    pub fn eval_limits(&self) -> EvalLimits {
        EvalLimits {
            max_tuples_per_predicate: self.limits.max_tuples_per_predicate,
            rule_error_threshold: self.limits.rule_error_threshold,
        }
    }

    /// Default deadline as a `Duration`.
    pub fn default_deadline(&self) -> Option<Duration> {
        self.query.default_deadline_ms.map(Duration::from_millis)
    }
}
