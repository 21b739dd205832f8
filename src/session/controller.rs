// src/session/controller.rs
//! Session lifecycle
//!
//! ```text
//! NoSession ──start()──→ Active ──end()──→ Ending
//!               │          ↺ heartbeat()
//!               └─ record in tab scope? resume, no start payload
//! ```
//!
//! `end()` is advisory. Tab close and same-tab navigation look identical from
//! here, so the persisted record is flagged but never deleted; the next page
//! load in the same tab resumes the same session.

use crate::delivery::batch::EndpointClass;
use crate::delivery::queue::DeliveryQueue;
use crate::delivery::transport::EgressMode;
use crate::session::identity::{IdentityStore, SessionRecord};
use crate::utils::clock::{to_rfc3339, Clock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat period (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Prefix for every storage key
    pub storage_prefix: String,
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            storage_prefix: "lumen".to_string(),
        }
    }
}

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Active,
    Ending,
}

/// Session context stamped onto payloads.
///
/// Build a fresh one per payload; a resume on the next page load can change
/// every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub started_at: i64,
    pub anonymous_id: String,
    pub user_id: Option<String>,
    pub replay_sampled: bool,
}

enum Phase {
    NoSession,
    Active(SessionRecord),
    Ending(SessionRecord),
}

/// Session controller
pub struct SessionController {
    config: SessionConfig,
    identity: Arc<IdentityStore>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
    replay_sample_rate: f64,
    phase: Mutex<Phase>,
    transition: Mutex<()>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        identity: Arc<IdentityStore>,
        queue: Arc<DeliveryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            identity,
            queue,
            clock,
            replay_sample_rate: 1.0,
            phase: Mutex::new(Phase::NoSession),
            transition: Mutex::new(()),
        }
    }

    /// Probability that a new session is picked for replay
    pub fn with_replay_sample_rate(mut self, rate: f64) -> Self {
        self.replay_sample_rate = rate;
        self
    }

    /// Resume the tab's session or create one.
    ///
    /// A new session's start payload is handed to the transport before this
    /// returns. Calling `start()` on a running controller is a no-op.
    pub fn start(&self) -> SessionContext {
        let _transition = self.transition.lock();

        if let Some(context) = self.current() {
            return context;
        }

        let now = self.clock.now_ms();

        if let Some(mut record) = self.identity.load_session() {
            record.ended = false;
            record.last_activity_at = now;
            self.persist(&record);

            info!("Resumed session {}", record.session_id);
            let context = self.context_for(&record);
            *self.phase.lock() = Phase::Active(record);
            return context;
        }

        let record = SessionRecord {
            session_id: Ulid::new().to_string(),
            started_at: now,
            last_activity_at: now,
            ended: false,
            replay_sampled: rand::random::<f64>() < self.replay_sample_rate,
        };
        self.persist(&record);

        let payload = self.upsert_payload(&record, "start");
        self.queue
            .send_immediate(EndpointClass::Session, payload, EgressMode::Normal);

        info!(
            "Started session {} (replay sampled: {})",
            record.session_id, record.replay_sampled
        );
        let context = self.context_for(&record);
        *self.phase.lock() = Phase::Active(record);
        context
    }

    /// Refresh activity and re-send the idempotent session upsert
    pub fn heartbeat(&self) -> bool {
        let record = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                Phase::Active(record) => {
                    record.last_activity_at = self.clock.now_ms();
                    record.clone()
                }
                _ => return false,
            }
        };

        self.persist(&record);
        trace!("Heartbeat for session {}", record.session_id);

        let payload = self.upsert_payload(&record, "heartbeat");
        self.queue
            .send_immediate(EndpointClass::Session, payload, EgressMode::Normal)
    }

    /// Send the final duration on an unload-class signal. Idempotent.
    pub fn end(&self) -> bool {
        let record = {
            let mut phase = self.phase.lock();
            let mut record = match &*phase {
                Phase::Active(record) => record.clone(),
                _ => return false,
            };
            record.last_activity_at = self.clock.now_ms();
            record.ended = true;
            *phase = Phase::Ending(record.clone());
            record
        };

        self.persist(&record);
        debug!("Session {} ending", record.session_id);

        let mut payload = self.upsert_payload(&record, "end");
        payload["ending"] = Value::Bool(true);
        self.queue
            .send_immediate(EndpointClass::Session, payload, EgressMode::BestEffort)
    }

    /// Current context, read fresh
    pub fn current(&self) -> Option<SessionContext> {
        match &*self.phase.lock() {
            Phase::Active(record) | Phase::Ending(record) => Some(self.context_for(record)),
            Phase::NoSession => None,
        }
    }

    pub fn state(&self) -> SessionState {
        match &*self.phase.lock() {
            Phase::NoSession => SessionState::NoSession,
            Phase::Active(_) => SessionState::Active,
            Phase::Ending(_) => SessionState::Ending,
        }
    }

    /// Attach a user id to the visitor and report it
    pub fn identify(&self, user_id: &str, traits: Value) -> bool {
        if let Err(e) = self.identity.set_user_id(Some(user_id)) {
            warn!("Failed to persist user id: {}", e);
        }

        let session_id = self.current().map(|context| context.session_id);
        let payload = json!({
            "anonymousId": self.identity.anonymous_id(),
            "userId": user_id,
            "sessionId": session_id,
            "traits": traits,
            "timestamp": to_rfc3339(self.clock.now_ms()),
        });

        self.queue
            .send_immediate(EndpointClass::Identify, payload, EgressMode::Normal)
    }

    /// Forget the identified user; the anonymous id stays
    pub fn reset_identity(&self) {
        if let Err(e) = self.identity.set_user_id(None) {
            warn!("Failed to clear user id: {}", e);
        }
    }

    /// Spawn the heartbeat loop
    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.heartbeat();
                    }
                }
            }

            trace!("Heartbeat loop stopped");
        })
    }

    fn persist(&self, record: &SessionRecord) {
        if let Err(e) = self.identity.save_session(record) {
            warn!("Failed to persist session {}: {}", record.session_id, e);
        }
    }

    fn context_for(&self, record: &SessionRecord) -> SessionContext {
        let identity = self.identity.identity();
        SessionContext {
            session_id: record.session_id.clone(),
            started_at: record.started_at,
            anonymous_id: identity.anonymous_id,
            user_id: identity.user_id,
            replay_sampled: record.replay_sampled,
        }
    }

    fn upsert_payload(&self, record: &SessionRecord, event: &str) -> Value {
        let identity = self.identity.identity();
        let duration_secs = (record.last_activity_at - record.started_at).max(0) / 1_000;

        json!({
            "event": event,
            "sessionId": record.session_id,
            "anonymousId": identity.anonymous_id,
            "userId": identity.user_id,
            "startedAt": to_rfc3339(record.started_at),
            "lastActivityAt": to_rfc3339(record.last_activity_at),
            "duration": duration_secs,
            "ending": false,
        })
    }
}
