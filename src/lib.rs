// src/lib.rs
//! Lumen telemetry agent core
//!
//! Buffers and ships client-side telemetry to a remote collector while the
//! host page navigates, backgrounds and closes underneath it.
//!
//! # Architecture
//!
//! - **agent**: owned facade, context stamping, page signal routing
//! - **delivery**: batching queue and network egress
//! - **session**: session lifecycle and identity persistence
//! - **recording**: session replay stream with snapshot-first ordering
//! - **interception**: reporting adapter for the host's network calls
//! - **observability**: tracing setup
//! - **utils**: configuration, errors, clocks
//!
//! ```text
//! collectors ─→ Agent ─→ DeliveryQueue ─→ Transport
//!                 │            ↑
//! capture feed ─→ RecordingStreamManager (immediate path)
//! ```

pub mod agent;
pub mod delivery;
pub mod interception;
pub mod observability;
pub mod recording;
pub mod session;
pub mod utils;

pub use agent::{Agent, AgentBuilder, AgentStats, Ingest, PageSignal};
pub use delivery::{EgressMode, ItemKind, Transport};
pub use recording::{CapturedEvent, RecordingFeed, SnapshotSource};
pub use session::{KeyValueStore, SessionContext};
pub use utils::config::AgentConfig;
pub use utils::errors::{AgentError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
