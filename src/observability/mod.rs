// src/observability/mod.rs
//! Logging setup
//!
//! The library only emits `tracing` events and `metrics` counters. Hosts
//! that want them printed call [`init_tracing`]; hosts that want the
//! counters install their own `metrics` recorder.

use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable overriding the filter directive
pub const LOG_ENV: &str = "LUMEN_LOG";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Default filter directive when `LUMEN_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

/// Resolve the default directive; debug mode lifts the agent to `debug`.
pub fn default_directive(logging: &LoggingConfig, debug: bool) -> String {
    if debug {
        format!("{},lumen_agent=debug", logging.level)
    } else {
        logging.level.clone()
    }
}

/// Install the global subscriber
pub fn init_tracing(logging: &LoggingConfig, debug: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_directive(logging, debug)))
        .map_err(|e| AgentError::Config(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if logging.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    installed.map_err(|e| AgentError::Config(format!("Tracing already initialized: {}", e)))
}
