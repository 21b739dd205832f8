// src/utils/mod.rs
//! Common utilities shared by every component
//!
//! - **config**: Layered agent configuration with explicit defaults
//! - **errors**: Crate error type and `Result` alias
//! - **clock**: Injectable wall-clock source

pub mod clock;
pub mod config;
pub mod errors;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AgentConfig;
pub use errors::{AgentError, Result};
