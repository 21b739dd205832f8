// src/agent.rs
//! Agent facade
//!
//! Owns the queue, the session controller and the recording manager, wires
//! them together and drives their timers on the ambient tokio runtime:
//! - stamps session context onto every collector payload
//! - routes page lifecycle signals to the right flush and teardown paths
//! - hands out the recording feed and the network interception adapter

use crate::delivery::batch::ItemKind;
use crate::delivery::queue::{BeforeSend, DeliveryQueue, QueueStats};
use crate::delivery::transport::{EgressMode, FlushTrigger, HyperTransport, Transport};
use crate::interception::http_interceptor::{InterceptingPrimitive, NetworkPrimitive};
use crate::recording::event_queue::{FeedStats, RecordingFeed};
use crate::recording::manager::{RecordingStats, RecordingStreamManager, SnapshotSource};
use crate::session::controller::{SessionContext, SessionController, SessionState};
use crate::session::identity::IdentityStore;
use crate::session::storage::{KeyValueStore, MemoryStore};
use crate::utils::clock::{to_rfc3339, Clock, SystemClock};
use crate::utils::config::AgentConfig;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination for collector payloads
pub trait Ingest: Send + Sync {
    fn ingest(&self, kind: ItemKind, payload: Value);
}

/// Page lifecycle signal delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSignal {
    VisibilityHidden,
    VisibilityVisible,
    PageHide,
    BeforeUnload,
}

/// Stamps session context onto payloads before they reach the queue
struct ContextStamper {
    session: Arc<SessionController>,
    queue: Arc<DeliveryQueue>,
    clock: Arc<dyn Clock>,
}

impl Ingest for ContextStamper {
    fn ingest(&self, kind: ItemKind, payload: Value) {
        let mut body = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        let context = self.session.current();
        let (session_id, anonymous_id, user_id) = match context {
            Some(context) => (
                Value::from(context.session_id),
                Value::from(context.anonymous_id),
                context.user_id.map(Value::from).unwrap_or(Value::Null),
            ),
            None => (Value::Null, Value::Null, Value::Null),
        };

        // Identity always reflects the controller, whatever the collector sent
        body.insert("sessionId".to_string(), session_id);
        body.insert("anonymousId".to_string(), anonymous_id);
        body.insert("userId".to_string(), user_id);
        body.entry("timestamp")
            .or_insert_with(|| Value::from(to_rfc3339(self.clock.now_ms())));

        self.queue.enqueue(kind, Value::Object(body));
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    config: AgentConfig,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn KeyValueStore>>,
    tab: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    snapshot_source: Option<Arc<dyn SnapshotSource>>,
    before_send: Option<BeforeSend>,
}

impl AgentBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Origin-scoped store holding the anonymous and user ids
    pub fn durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Tab-scoped store holding the session record
    pub fn tab_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.tab = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot_source = Some(source);
        self
    }

    pub fn before_send(mut self, hook: BeforeSend) -> Self {
        self.before_send = Some(hook);
        self
    }

    /// Validate the configuration and assemble the agent
    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let durable = self.durable.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let tab = self.tab.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let mut queue = DeliveryQueue::new(&config, transport, Arc::clone(&clock));
        if let Some(hook) = self.before_send {
            queue = queue.with_before_send(hook);
        }
        let queue = Arc::new(queue);

        let identity = Arc::new(IdentityStore::new(
            durable,
            tab,
            &config.session.storage_prefix,
        ));

        let session = Arc::new(
            SessionController::new(
                config.session.clone(),
                identity,
                Arc::clone(&queue),
                Arc::clone(&clock),
            )
            .with_replay_sample_rate(config.recording.sample_rate),
        );

        let mut recording = RecordingStreamManager::new(
            config.recording.clone(),
            Arc::clone(&session),
            Arc::clone(&queue),
        );
        if let Some(source) = self.snapshot_source {
            recording = recording.with_snapshot_source(source);
        }

        let stamper = Arc::new(ContextStamper {
            session: Arc::clone(&session),
            queue: Arc::clone(&queue),
            clock,
        });

        debug!("Agent assembled for app {}", config.app_id);

        Ok(Agent {
            config,
            queue,
            session,
            recording: Arc::new(recording),
            stamper,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Telemetry agent
pub struct Agent {
    config: AgentConfig,
    queue: Arc<DeliveryQueue>,
    session: Arc<SessionController>,
    recording: Arc<RecordingStreamManager>,
    stamper: Arc<ContextStamper>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            transport: None,
            durable: None,
            tab: None,
            clock: None,
            snapshot_source: None,
            before_send: None,
        }
    }

    /// Start the session and recording, then spawn the timer tasks.
    ///
    /// Repeated calls return the current context without respawning.
    pub fn start(&self) -> SessionContext {
        let context = self.session.start();

        if self.started.swap(true, Ordering::SeqCst) {
            return context;
        }

        self.recording.start();

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                let mut tasks = self.tasks.lock();
                tasks.push(Arc::clone(&self.queue).spawn_flush_loop(self.cancel.child_token()));
                tasks.push(Arc::clone(&self.session).spawn_heartbeat(self.cancel.child_token()));
                tasks.push(Arc::clone(&self.recording).spawn_driver(self.cancel.child_token()));
            }
            Err(_) => warn!("No tokio runtime, interval flush and heartbeats are disabled"),
        }

        info!(
            "Agent started for app {} (session {})",
            self.config.app_id, context.session_id
        );
        context
    }

    /// Stamp and buffer a collector payload
    pub fn enqueue(&self, kind: ItemKind, payload: Value) {
        self.stamper.ingest(kind, payload);
    }

    /// Record a named custom event
    pub fn track(&self, name: &str, properties: Value) {
        self.enqueue(
            ItemKind::Event,
            json!({
                "name": name,
                "properties": properties,
            }),
        );
    }

    pub fn capture_error(&self, message: &str, stack: Option<&str>) {
        self.enqueue(
            ItemKind::Error,
            json!({
                "message": message,
                "stack": stack,
            }),
        );
    }

    pub fn identify(&self, user_id: &str, traits: Value) -> bool {
        self.session.identify(user_id, traits)
    }

    pub fn reset_identity(&self) {
        self.session.reset_identity();
    }

    /// Producer handle for the capture layer
    pub fn recording_feed(&self) -> RecordingFeed {
        self.recording.feed()
    }

    /// Route a page lifecycle signal
    pub fn handle_signal(&self, signal: PageSignal) {
        debug!("Page signal {:?}", signal);

        match signal {
            PageSignal::VisibilityVisible => {}
            PageSignal::VisibilityHidden => {
                self.queue.flush_for(FlushTrigger::VisibilityHidden);
                self.recording.flush(EgressMode::BestEffort);
            }
            PageSignal::PageHide | PageSignal::BeforeUnload => {
                self.queue.flush_for(FlushTrigger::Unload);
                self.recording.stop(EgressMode::BestEffort);
                self.session.end();
            }
        }
    }

    /// Unload-class teardown, then stop the timer tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.handle_signal(PageSignal::PageHide);
        self.cancel.cancel();
        info!("Agent shut down");
    }

    /// Wait for the timer tasks to finish after `shutdown()`
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Agent task ended abnormally: {}", e);
            }
        }
    }

    /// Wrap the host's request primitive so its traffic is reported
    pub fn intercept<P: NetworkPrimitive>(&self, primitive: P) -> InterceptingPrimitive<P> {
        let sink: Arc<dyn Ingest> = self.stamper.clone();
        InterceptingPrimitive::new(
            primitive,
            sink,
            &self.config.interception,
            self.queue.api_url(),
        )
    }

    pub fn session_context(&self) -> Option<SessionContext> {
        self.session.current()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            session: self.session.state(),
            queue: self.queue.stats(),
            recording: self.recording.stats(),
            feed: self.recording.feed().stats(),
        }
    }
}

impl Ingest for Agent {
    fn ingest(&self, kind: ItemKind, payload: Value) {
        self.enqueue(kind, payload);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Snapshot of agent statistics
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub session: SessionState,
    pub queue: QueueStats,
    pub recording: RecordingStats,
    pub feed: FeedStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::batch::{Channel, EndpointClass};
    use crate::delivery::transport::CapturingTransport;
    use crate::interception::http_interceptor::{NetworkRequest, NetworkResponse};
    use crate::recording::events::{CapturedEvent, IncrementalSource};
    use crate::utils::clock::ManualClock;
    use crate::utils::errors::AgentError;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    fn test_config() -> AgentConfig {
        AgentConfig {
            api_url: "http://collector.test".to_string(),
            api_key: "key_123".to_string(),
            app_id: "app_abc".to_string(),
            ..Default::default()
        }
    }

    fn create_agent() -> (Agent, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::new());
        let agent = Agent::builder(test_config())
            .transport(transport.clone())
            .clock(Arc::new(ManualClock::new(NOW)))
            .build()
            .unwrap();
        (agent, transport)
    }

    #[test]
    fn test_build_rejects_missing_key() {
        let mut config = test_config();
        config.api_key.clear();

        let result = Agent::builder(config).build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_enqueue_stamps_context() {
        let (agent, transport) = create_agent();
        let context = agent.start();
        agent.track("checkout", json!({ "total": 42 }));
        agent.capture_error("boom", None);

        agent.handle_signal(PageSignal::VisibilityHidden);

        let sent = transport.sent();
        let events = sent.iter().find(|r| r.path_is("/events")).unwrap();
        assert_eq!(events.mode, EgressMode::BestEffort);

        let event = &events.body["events"][0];
        assert_eq!(event["name"], "checkout");
        assert_eq!(event["sessionId"], context.session_id.as_str());
        assert_eq!(event["anonymousId"], context.anonymous_id.as_str());
        assert!(event["userId"].is_null());
        assert_eq!(event["timestamp"], to_rfc3339(NOW).as_str());
        assert_eq!(events.body["appId"], "app_abc");

        let errors = sent.iter().find(|r| r.path_is("/errors")).unwrap();
        assert_eq!(errors.body["errors"][0]["message"], "boom");
    }

    #[test]
    fn test_visible_signal_is_noop() {
        let (agent, transport) = create_agent();
        agent.start();
        transport.take();

        agent.track("x", Value::Null);
        agent.handle_signal(PageSignal::VisibilityVisible);
        assert!(transport.sent().is_empty());
        assert_eq!(agent.stats().queue.buffered, 1);
    }

    #[test]
    fn test_page_hide_twice_ends_session_once() {
        let (agent, transport) = create_agent();
        agent.start();

        agent.handle_signal(PageSignal::PageHide);
        agent.handle_signal(PageSignal::BeforeUnload);

        let endings = transport
            .sent()
            .into_iter()
            .filter(|r| r.path_is("/sessions") && r.body["ending"] == true)
            .count();
        assert_eq!(endings, 1);
        assert_eq!(agent.stats().session, SessionState::Ending);
    }

    #[test]
    fn test_unload_delivers_recording_by_beacon() {
        let (agent, transport) = create_agent();
        agent.start();

        let feed = agent.recording_feed();
        feed.push(CapturedEvent::full_snapshot(NOW + 5, json!({}))).unwrap();
        feed.push(CapturedEvent::incremental(IncrementalSource::Scroll, NOW + 9, json!({})))
            .unwrap();

        agent.handle_signal(PageSignal::PageHide);

        let recordings: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|r| r.path_is("/recordings"))
            .collect();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0].mode, EgressMode::BestEffort);
        assert_eq!(recordings[0].body["events"].as_array().unwrap().len(), 2);
        assert_eq!(recordings[0].body["events"][0]["kind"], "fullSnapshot");
    }

    #[test]
    fn test_before_send_can_veto_recordings() {
        let transport = Arc::new(CapturingTransport::new());
        let hook: BeforeSend = Arc::new(|channel: Channel, body: Value| match channel {
            Channel::Immediate(EndpointClass::Recording) => None,
            _ => Some(body),
        });
        let agent = Agent::builder(test_config())
            .transport(transport.clone())
            .clock(Arc::new(ManualClock::new(NOW)))
            .before_send(hook)
            .build()
            .unwrap();
        agent.start();

        agent
            .recording_feed()
            .push(CapturedEvent::full_snapshot(NOW + 1, json!({})))
            .unwrap();
        agent.shutdown();

        assert_eq!(transport.count_for("/recordings"), 0);
        assert_eq!(transport.count_for("/sessions"), 2);
        assert_eq!(agent.stats().queue.vetoed, 1);
    }

    #[test]
    fn test_identify_flows_into_stamps() {
        let (agent, transport) = create_agent();
        agent.start();

        assert!(agent.identify("user_7", json!({})));
        agent.track("after", Value::Null);
        agent.shutdown();

        let events = transport.sent().into_iter().find(|r| r.path_is("/events")).unwrap();
        assert_eq!(events.body["events"][0]["userId"], "user_7");
        assert_eq!(transport.count_for("/identify"), 1);
    }

    #[test]
    fn test_payload_cannot_override_identity() {
        let (agent, transport) = create_agent();
        let context = agent.start();
        agent.identify("user_7", json!({}));

        agent.enqueue(
            ItemKind::Performance,
            json!({
                "lcp": 1200,
                "sessionId": "forged_session",
                "anonymousId": "forged_visitor",
                "userId": "someone_else",
                "timestamp": "2020-01-01T00:00:00.000Z",
            }),
        );
        agent.shutdown();

        let sent = transport.sent();
        let batch = sent.iter().find(|r| r.path_is("/performances")).unwrap();
        let item = &batch.body["performances"][0];
        assert_eq!(item["lcp"], 1200);
        assert_eq!(item["sessionId"], context.session_id.as_str());
        assert_eq!(item["anonymousId"], context.anonymous_id.as_str());
        assert_eq!(item["userId"], "user_7");
        assert_eq!(item["timestamp"], "2020-01-01T00:00:00.000Z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_tasks_and_shutdown() {
        let (agent, transport) = create_agent();
        agent.start();
        agent.track("tick", Value::Null);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        let flushed = transport.sent().into_iter().find(|r| r.path_is("/events")).unwrap();
        assert_eq!(flushed.mode, EgressMode::Normal);

        agent.shutdown();
        agent.shutdown();
        agent.join().await;

        let endings = transport
            .sent()
            .into_iter()
            .filter(|r| r.body["ending"] == true)
            .count();
        assert_eq!(endings, 1);
    }

    struct StaticNetwork;

    impl NetworkPrimitive for StaticNetwork {
        fn fetch(&self, _request: NetworkRequest) -> BoxFuture<'static, Result<NetworkResponse>> {
            Box::pin(async {
                Ok(NetworkResponse {
                    status: 201,
                    headers: Vec::new(),
                    body: Bytes::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_intercepted_traffic_is_stamped() {
        let (agent, transport) = create_agent();
        let context = agent.start();
        let fetch = agent.intercept(StaticNetwork);

        fetch
            .fetch(NetworkRequest::new("POST", "https://shop.test/orders"))
            .await
            .unwrap();
        fetch
            .fetch(NetworkRequest::new("POST", "http://collector.test/events"))
            .await
            .unwrap();

        let stats = agent.stats();
        assert_eq!(stats.queue.buffered, 1);
        assert_eq!(stats.queue.enqueued, 1);

        agent.handle_signal(PageSignal::VisibilityHidden);
        let sent = transport.sent();
        let networks = sent.iter().find(|r| r.path_is("/networks")).unwrap();
        assert_eq!(networks.body["networks"][0]["status"], 201);
        assert_eq!(networks.body["networks"][0]["sessionId"], context.session_id.as_str());
    }
}
