// src/recording/mod.rs
//! Session recording
//!
//! - **Events**: captured and emitted event shapes
//! - **Feed**: bounded lock-free queue between capture and processing
//! - **Pacer**: pointer-move throttling
//! - **Manager**: snapshot gating, relative timestamps, chunked delivery
//!
//! # Architecture
//!
//! ```text
//! capture callback → RecordingFeed → RecordingStreamManager
//!                                         │ pace, rebase timestamps
//!                                         ↓
//!                              buffer (held until first snapshot)
//!                                         ↓
//!                      chunks of ≤ max_batch_events → /recordings
//! ```

pub mod event_queue;
pub mod events;
pub mod manager;
pub mod pacer;

pub use event_queue::{FeedStats, RecordingFeed};
pub use events::{CaptureKind, CapturedEvent, IncrementalSource, RecordingEvent, RecordingEventKind};
pub use manager::{RecordingConfig, RecordingStats, RecordingStreamManager, SnapshotSource, WatchdogOutcome};
pub use pacer::PointerPacer;
