// src/utils/errors.rs
//! Agent error type
//!
//! Only construction surfaces errors to the host. Everything raised after
//! `Agent::build` is absorbed and logged at the component boundary.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors produced by the agent core
#[derive(Error, Debug)]
pub enum AgentError {
    /// Missing or malformed configuration; the agent refuses to operate
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity or session persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A send failed at the network layer or returned a non-2xx status
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors (config files, stdin in the binary)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether this error describes a lost send rather than a local fault
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}
