// src/recording/manager.rs
//! Recording stream manager
//!
//! Turns the raw capture feed into a replayable stream:
//! - timestamps are rewritten relative to session start, and never go back
//! - nothing is delivered before a full snapshot, except when the watchdog
//!   gives up waiting for one
//! - pointer moves are paced, everything else passes untouched
//! - chunks go out through the queue's immediate path, never the batched one

use crate::delivery::batch::EndpointClass;
use crate::delivery::queue::DeliveryQueue;
use crate::delivery::transport::EgressMode;
use crate::recording::event_queue::RecordingFeed;
use crate::recording::events::{CaptureKind, CapturedEvent, RecordingEvent};
use crate::recording::pacer::PointerPacer;
use crate::session::controller::SessionController;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Record at all
    pub enabled: bool,

    /// Fraction of new sessions picked for replay (0.0 - 1.0)
    pub sample_rate: f64,

    /// Minimum gap between admitted pointer moves (milliseconds)
    pub pointer_sample_ms: u64,

    /// Periodic flush interval (milliseconds)
    pub flush_interval_ms: u64,

    /// Maximum events per delivered chunk
    pub max_batch_events: usize,

    /// Delay before the watchdog chases a missing snapshot (milliseconds)
    pub snapshot_watchdog_ms: u64,

    /// Capacity of the capture feed
    pub feed_capacity: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            pointer_sample_ms: 50,
            flush_interval_ms: 2_000,
            max_batch_events: 20,
            snapshot_watchdog_ms: 2_000,
            feed_capacity: 10_000,
        }
    }
}

impl RecordingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn snapshot_watchdog(&self) -> Duration {
        Duration::from_millis(self.snapshot_watchdog_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(format!(
                "recording.sample_rate must be within 0.0..=1.0, got {}",
                self.sample_rate
            ));
        }
        if self.max_batch_events == 0 {
            return Err("recording.max_batch_events must be at least 1".to_string());
        }
        if self.feed_capacity == 0 {
            return Err("recording.feed_capacity must be at least 1".to_string());
        }
        if self.flush_interval_ms == 0 || self.snapshot_watchdog_ms == 0 {
            return Err("recording intervals must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Control side of the capture feed
pub trait SnapshotSource: Send + Sync {
    /// Ask the capture layer to emit a full snapshot into the feed
    fn request_full_snapshot(&self);
}

/// Result of a watchdog expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Snapshot already seen, or not recording
    Idle,

    /// Asked the source for a snapshot; the watchdog re-arms
    SnapshotRequested,

    /// Gave up waiting and flushed what was buffered
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchdogStage {
    Armed,
    SnapshotRequested,
    Disarmed,
}

struct Buffered {
    capture: CaptureKind,
    event: RecordingEvent,
}

struct StreamState {
    running: bool,
    snapshot_sent: bool,
    watchdog: WatchdogStage,
    buffer: Vec<Buffered>,
    pacer: PointerPacer,
    last_relative: u64,
    sequence: u64,
    stats: RecordingStats,
}

/// Recording stream manager
pub struct RecordingStreamManager {
    config: RecordingConfig,
    stream_id: String,
    feed: RecordingFeed,
    session: Arc<SessionController>,
    queue: Arc<DeliveryQueue>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    state: Mutex<StreamState>,
}

impl RecordingStreamManager {
    pub fn new(
        config: RecordingConfig,
        session: Arc<SessionController>,
        queue: Arc<DeliveryQueue>,
    ) -> Self {
        let feed = RecordingFeed::new(config.feed_capacity);
        let pacer = PointerPacer::new(config.pointer_sample_ms);

        Self {
            config,
            stream_id: Ulid::new().to_string(),
            feed,
            session,
            queue,
            snapshot_source: None,
            state: Mutex::new(StreamState {
                running: false,
                snapshot_sent: false,
                watchdog: WatchdogStage::Disarmed,
                buffer: Vec::new(),
                pacer,
                last_relative: 0,
                sequence: 0,
                stats: RecordingStats::default(),
            }),
        }
    }

    pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot_source = Some(source);
        self
    }

    /// Producer handle for capture callbacks
    pub fn feed(&self) -> RecordingFeed {
        self.feed.clone()
    }

    /// Identifies this page load's stream within the session
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Begin recording for the current session.
    ///
    /// Stays idle without an active session, when disabled, or when the
    /// session was not sampled for replay.
    pub fn start(&self) -> bool {
        let Some(context) = self.session.current() else {
            debug!("No active session, recording stays idle");
            return false;
        };

        if !self.config.enabled {
            return false;
        }
        if !context.replay_sampled {
            info!("Session {} not sampled for replay", context.session_id);
            return false;
        }

        let mut state = self.state.lock();
        if !state.running {
            state.running = true;
            state.watchdog = WatchdogStage::Armed;
            info!("Recording stream {} started", self.stream_id);
        }
        true
    }

    /// Process one captured event. Returns whether it entered the buffer.
    ///
    /// Once the snapshot is out, a full buffer is flushed right away.
    pub fn ingest(&self, event: CapturedEvent) -> bool {
        match self.accept(event) {
            Some(flush_now) => {
                if flush_now {
                    self.flush_buffer(EgressMode::Normal, false);
                }
                true
            }
            None => false,
        }
    }

    /// Drain the capture feed, flushing early as chunks fill up
    pub fn pump(&self) -> usize {
        let mut drained = 0;
        while let Some(event) = self.feed.try_pop() {
            self.ingest(event);
            drained += 1;
        }
        drained
    }

    /// Flush buffered events, if a snapshot has gone out.
    ///
    /// The feed is drained first without early flushes, so everything leaves
    /// in `mode`. Returns the number of chunks handed to the queue.
    pub fn flush(&self, mode: EgressMode) -> usize {
        self.drain();
        self.flush_buffer(mode, false)
    }

    /// Buffer an event. `None` when rejected, otherwise whether the buffer
    /// reached the chunk cap after the snapshot.
    fn accept(&self, event: CapturedEvent) -> Option<bool> {
        let Some(context) = self.session.current() else {
            self.state.lock().stats.dropped += 1;
            return None;
        };

        let mut state = self.state.lock();

        if !state.running {
            state.stats.dropped += 1;
            return None;
        }

        if event.is_pointer_move() && !state.pacer.admit(event.timestamp_ms) {
            state.stats.paced += 1;
            return None;
        }

        let relative = ((event.timestamp_ms - context.started_at).max(0) as u64)
            .max(state.last_relative);
        state.stats.accepted += 1;

        let capture = event.kind;
        let event = RecordingEvent::from_captured(event, relative);

        if !state.snapshot_sent {
            if capture == CaptureKind::FullSnapshot {
                state.last_relative = relative;
                Self::promote_first_snapshot(&mut state, event, relative);
                return Some(true);
            }
            // Held back until a snapshot decides whether it is kept
            state.buffer.push(Buffered { capture, event });
            return Some(false);
        }

        state.last_relative = relative;
        state.buffer.push(Buffered { capture, event });
        Some(
            capture == CaptureKind::FullSnapshot
                || state.buffer.len() >= self.config.max_batch_events,
        )
    }

    fn drain(&self) {
        while let Some(event) = self.feed.try_pop() {
            self.accept(event);
        }
    }

    /// Handle a watchdog expiry
    pub fn watchdog_fire(&self) -> WatchdogOutcome {
        self.pump();

        let stage = {
            let mut state = self.state.lock();
            if !state.running || state.snapshot_sent {
                state.watchdog = WatchdogStage::Disarmed;
                return WatchdogOutcome::Idle;
            }
            state.watchdog
        };

        match stage {
            WatchdogStage::Armed => {
                self.state.lock().watchdog = WatchdogStage::SnapshotRequested;
                debug!("No snapshot yet, requesting one");
                self.request_snapshot();
                self.pump();
                WatchdogOutcome::SnapshotRequested
            }
            WatchdogStage::SnapshotRequested => {
                Self::force_open(&mut self.state.lock());
                warn!(
                    "No snapshot arrived for stream {}, flushing without one",
                    self.stream_id
                );
                self.flush_buffer(EgressMode::Normal, true);
                WatchdogOutcome::Forced
            }
            WatchdogStage::Disarmed => WatchdogOutcome::Idle,
        }
    }

    /// Stop recording and flush everything that remains.
    ///
    /// Idempotent and safe without a prior `start()`. A stream that never saw
    /// a snapshot asks for one first and otherwise takes the watchdog's
    /// last-resort path.
    pub fn stop(&self, mode: EgressMode) -> usize {
        if !self.state.lock().running {
            return 0;
        }

        self.drain();
        if !self.state.lock().snapshot_sent {
            self.request_snapshot();
            self.drain();
        }

        {
            let mut state = self.state.lock();
            if !state.running {
                return 0;
            }
            state.running = false;
            state.watchdog = WatchdogStage::Disarmed;
            if !state.snapshot_sent {
                Self::force_open(&mut state);
            }
        }

        info!("Recording stream {} stopped", self.stream_id);
        self.flush_buffer(mode, true)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn snapshot_sent(&self) -> bool {
        self.state.lock().snapshot_sent
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn stats(&self) -> RecordingStats {
        self.state.lock().stats.clone()
    }

    /// Spawn the consumer loop: feed wakeups, periodic flush and watchdog
    pub fn spawn_driver(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.flush_interval();
        let watchdog_delay = self.config.snapshot_watchdog();
        let feed = self.feed.clone();

        tokio::spawn(async move {
            let mut flush_interval = tokio::time::interval_at(Instant::now() + period, period);
            let watchdog = tokio::time::sleep(watchdog_delay);
            tokio::pin!(watchdog);
            let mut watchdog_armed = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = feed.notified() => {
                        self.pump();
                    }
                    _ = flush_interval.tick() => {
                        self.flush(EgressMode::Normal);
                    }
                    _ = &mut watchdog, if watchdog_armed => {
                        match self.watchdog_fire() {
                            WatchdogOutcome::SnapshotRequested => {
                                watchdog.as_mut().reset(Instant::now() + watchdog_delay);
                            }
                            WatchdogOutcome::Idle | WatchdogOutcome::Forced => {
                                watchdog_armed = false;
                            }
                        }
                    }
                }
            }

            trace!("Recording driver stopped");
        })
    }

    /// First snapshot of the stream: it leads the buffer. Meta events
    /// captured before it follow it; earlier incrementals are superseded.
    fn promote_first_snapshot(state: &mut StreamState, snapshot: RecordingEvent, relative: u64) {
        let pending = std::mem::take(&mut state.buffer);

        state.buffer.push(Buffered {
            capture: CaptureKind::FullSnapshot,
            event: snapshot,
        });

        for mut buffered in pending {
            if buffered.capture == CaptureKind::Meta {
                buffered.event.relative_timestamp = relative;
                state.buffer.push(buffered);
            } else {
                state.stats.superseded += 1;
            }
        }

        state.snapshot_sent = true;
        state.watchdog = WatchdogStage::Disarmed;
    }

    /// Open the gate without a snapshot. Held-back events keep their order
    /// and get clamped into a non-decreasing run.
    fn force_open(state: &mut StreamState) {
        let mut floor = state.last_relative;
        for buffered in state.buffer.iter_mut() {
            floor = floor.max(buffered.event.relative_timestamp);
            buffered.event.relative_timestamp = floor;
        }
        state.last_relative = floor;

        state.snapshot_sent = true;
        state.watchdog = WatchdogStage::Disarmed;
        state.stats.forced = true;
    }

    fn request_snapshot(&self) {
        match &self.snapshot_source {
            Some(source) => source.request_full_snapshot(),
            None => debug!("No snapshot source registered"),
        }
    }

    fn flush_buffer(&self, mode: EgressMode, force: bool) -> usize {
        let cap = self.config.max_batch_events.max(1);

        let (events, first_sequence) = {
            let mut state = self.state.lock();
            if (!state.snapshot_sent && !force) || state.buffer.is_empty() {
                return 0;
            }

            let events: Vec<RecordingEvent> =
                std::mem::take(&mut state.buffer).into_iter().map(|b| b.event).collect();

            let first_sequence = state.sequence;
            state.sequence += events.len().div_ceil(cap) as u64;
            state.stats.flushed_events += events.len() as u64;
            (events, first_sequence)
        };

        let Some(context) = self.session.current() else {
            debug!("Session gone, dropping {} recording events", events.len());
            return 0;
        };

        let mut sent = 0;
        for (offset, chunk) in events.chunks(cap).enumerate() {
            let payload = json!({
                "sessionId": context.session_id,
                "anonymousId": context.anonymous_id,
                "userId": context.user_id,
                "streamId": self.stream_id,
                "sequence": first_sequence + offset as u64,
                "events": chunk,
            });

            if self
                .queue
                .send_immediate(EndpointClass::Recording, payload, mode)
            {
                sent += 1;
            }
        }

        debug!(
            "Flushed {} recording events in {} chunks ({:?})",
            events.len(),
            sent,
            mode
        );
        self.state.lock().stats.chunks_sent += sent as u64;
        sent
    }
}

/// Recording statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Events admitted to the buffer
    pub accepted: u64,

    /// Pointer moves dropped by the pacer
    pub paced: u64,

    /// Pre-snapshot incrementals replaced by the first snapshot
    pub superseded: u64,

    /// Events arriving while not recording
    pub dropped: u64,

    /// Events taken out of the buffer for delivery
    pub flushed_events: u64,

    /// Chunks handed to the queue
    pub chunks_sent: u64,

    /// Whether the stream went out without a snapshot
    pub forced: bool,
}
