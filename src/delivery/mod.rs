// src/delivery/mod.rs
//! Payload delivery
//!
//! This module buffers collector payloads and ships them to the collector:
//!
//! - **Batch**: Item kinds, endpoint classes and the request envelope
//! - **Queue**: In-memory buffer, per-kind batching and flush triggers
//! - **Transport**: Normal (awaited POST) and best-effort (beacon) egress
//!
//! # Architecture
//!
//! ```text
//! enqueue(kind, payload) → Buffer ──┬─ 50 items ──────┐
//!                                   ├─ every 5s ──────┤
//!                                   ├─ hidden ────────┤→ partition by kind
//!                                   └─ unload ────────┘        ↓
//!                                                     before_send hook
//!                                                              ↓
//! send_immediate(class, payload) ─────────────────────→ Normal | Beacon
//! ```
//!
//! Unload-class triggers always select the beacon; everything else goes
//! through the awaited POST. Failures are logged (debug mode) and dropped.

pub mod batch;
pub mod queue;
pub mod transport;

// Re-export commonly used types
pub use batch::{partition, Batch, Channel, EndpointClass, Envelope, ItemKind, QueuedItem};
pub use queue::{BeforeSend, DeliveryQueue, QueueConfig, QueueStats};
pub use transport::{
    CapturingTransport, EgressMode, FlushTrigger, HyperTransport, OutboundRequest, SentRequest,
    Transport,
};
