// src/delivery/queue.rs
//! In-memory delivery queue
//!
//! Buffers collector payloads, groups them by kind and ships one request per
//! kind. The buffer is never persisted; whatever is unflushed when the host
//! dies is lost.

use crate::delivery::batch::{partition, Channel, EndpointClass, Envelope, ItemKind, QueuedItem};
use crate::delivery::transport::{EgressMode, FlushTrigger, OutboundRequest, Transport};
use crate::utils::clock::Clock;
use crate::utils::config::AgentConfig;
use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Hook applied to every outgoing body. Returning `None` drops the send.
pub type BeforeSend = Arc<dyn Fn(Channel, Value) -> Option<Value> + Send + Sync>;

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Buffer length that forces an immediate flush
    pub max_batch_size: usize,

    /// Interval flush period (milliseconds)
    pub flush_interval_ms: u64,
}

impl QueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    sends: AtomicU64,
    beacons: AtomicU64,
    vetoed: AtomicU64,
    failures: AtomicU64,
}

/// Delivery queue
pub struct DeliveryQueue {
    config: QueueConfig,
    api_url: String,
    envelope: Envelope,
    debug: bool,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    before_send: Option<BeforeSend>,
    buffer: Mutex<Vec<QueuedItem>>,
    counters: Arc<Counters>,
}

impl DeliveryQueue {
    /// Create a queue for an already validated configuration
    pub fn new(config: &AgentConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.queue.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            envelope: config.envelope(),
            debug: config.debug,
            transport,
            clock,
            before_send: None,
            buffer: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_before_send(mut self, hook: BeforeSend) -> Self {
        self.before_send = Some(hook);
        self
    }

    /// Append a payload. Reaching the size threshold flushes right away.
    pub fn enqueue(&self, kind: ItemKind, payload: Value) {
        let item = QueuedItem {
            kind,
            payload,
            enqueued_at: self.clock.now_ms(),
        };

        let buffered = {
            let mut buffer = self.buffer.lock();
            buffer.push(item);
            buffer.len()
        };

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("lumen_items_enqueued_total", "kind" => kind.as_str()).increment(1);

        if buffered >= self.config.max_batch_size {
            debug!("Buffer reached {} items, flushing", buffered);
            self.flush_for(FlushTrigger::SizeThreshold);
        }
    }

    /// Flush with the egress mode dictated by the trigger
    pub fn flush_for(&self, trigger: FlushTrigger) -> usize {
        trace!("Flush triggered by {:?}", trigger);
        self.flush(trigger.egress_mode())
    }

    /// Take the current buffer generation and send one batch per kind.
    ///
    /// Returns the number of batches handed to the transport.
    pub fn flush(&self, mode: EgressMode) -> usize {
        let items = std::mem::take(&mut *self.buffer.lock());
        if items.is_empty() {
            return 0;
        }

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("Flushing {} items ({:?})", items.len(), mode);

        let mut dispatched = 0;
        for batch in partition(items) {
            let kind = batch.kind;
            let body = self.envelope.wrap_batch(kind, batch.into_payloads());
            if self.dispatch(Channel::Batch(kind), kind.path(), body, mode) {
                dispatched += 1;
            }
        }

        dispatched
    }

    /// Send one payload outside of batching
    pub fn send_immediate(&self, class: EndpointClass, payload: Value, mode: EgressMode) -> bool {
        let body = self.envelope.wrap_immediate(payload);
        self.dispatch(Channel::Immediate(class), class.path(), body, mode)
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            buffered: self.len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            sends: self.counters.sends.load(Ordering::Relaxed),
            beacons: self.counters.beacons.load(Ordering::Relaxed),
            vetoed: self.counters.vetoed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the interval flush loop
    pub fn spawn_flush_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.flush_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.flush_for(FlushTrigger::Interval);
                    }
                }
            }

            trace!("Queue flush loop stopped");
        })
    }

    fn dispatch(&self, channel: Channel, path: &str, body: Value, mode: EgressMode) -> bool {
        let body = match &self.before_send {
            Some(hook) => match hook(channel, body) {
                Some(body) => body,
                None => {
                    self.counters.vetoed.fetch_add(1, Ordering::Relaxed);
                    counter!("lumen_batches_vetoed_total").increment(1);
                    debug!("Send to {} suppressed by before_send", path);
                    return false;
                }
            },
            None => body,
        };

        let bytes = match serde_json::to_vec(&body) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                self.record_failure(path, &e.to_string());
                return false;
            }
        };

        let url = format!("{}{}", self.api_url, path);

        match mode {
            EgressMode::BestEffort => {
                if self.transport.send_beacon(&url, bytes) {
                    self.counters.beacons.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    counter!("lumen_beacons_rejected_total").increment(1);
                    self.record_failure(path, "beacon rejected");
                    false
                }
            }
            EgressMode::Normal => {
                let pending = self.transport.send(OutboundRequest {
                    url,
                    body: bytes,
                    bearer: Some(self.envelope.api_key.clone()),
                });

                let counters = Arc::clone(&self.counters);
                let debug_mode = self.debug;
                let owned_path = path.to_string();
                let completion = async move {
                    match pending.await {
                        Ok(status) => trace!("{} delivered ({})", owned_path, status),
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            counter!("lumen_delivery_failures_total").increment(1);
                            if debug_mode {
                                warn!("Delivery to {} failed: {}", owned_path, e);
                            }
                        }
                    }
                };

                // Without a runtime only an already-settled send counts as sent
                if !spawn_detached(completion) {
                    self.record_failure(path, "no runtime to drive send");
                    return false;
                }
                self.counters.sends.fetch_add(1, Ordering::Relaxed);
                counter!("lumen_batches_sent_total").increment(1);
                true
            }
        }
    }

    fn record_failure(&self, path: &str, reason: &str) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        counter!("lumen_delivery_failures_total").increment(1);
        if self.debug {
            warn!("Delivery to {} failed: {}", path, reason);
        }
    }
}

/// Drive a send-completion future. On the ambient runtime it is spawned;
/// without one it is polled once and must already be settled. Returns `false`
/// when the future was dropped unfinished.
fn spawn_detached<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => {
            let settled = future.now_or_never().is_some();
            if !settled {
                debug!("No runtime to await send completion");
            }
            settled
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently buffered
    pub buffered: usize,

    /// Total items enqueued
    pub enqueued: u64,

    /// Non-empty flushes
    pub flushes: u64,

    /// Normal sends handed to the transport
    pub sends: u64,

    /// Beacons accepted by the transport
    pub beacons: u64,

    /// Sends suppressed by `before_send`
    pub vetoed: u64,

    /// Rejected beacons and failed or non-2xx sends
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::CapturingTransport;
    use crate::utils::clock::ManualClock;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_config() -> AgentConfig {
        AgentConfig {
            api_url: "http://collector.test/v1/".to_string(),
            api_key: "key_123".to_string(),
            app_id: "app_abc".to_string(),
            ..Default::default()
        }
    }

    fn create_queue() -> (DeliveryQueue, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::new());
        let queue = DeliveryQueue::new(
            &test_config(),
            transport.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        (queue, transport)
    }

    #[tokio::test]
    async fn test_threshold_flushes_immediately() {
        let (queue, transport) = create_queue();

        for n in 0..49 {
            queue.enqueue(ItemKind::Event, json!({ "n": n }));
        }
        assert_eq!(queue.len(), 49);
        assert!(transport.sent().is_empty());

        queue.enqueue(ItemKind::Event, json!({ "n": 49 }));
        assert!(queue.is_empty());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mode, EgressMode::Normal);
        assert_eq!(sent[0].url, "http://collector.test/v1/events");
        assert_eq!(sent[0].body["events"].as_array().unwrap().len(), 50);
        assert_eq!(sent[0].bearer.as_deref(), Some("key_123"));
    }

    #[tokio::test]
    async fn test_threshold_counts_all_kinds() {
        let (queue, transport) = create_queue();

        for n in 0..25 {
            queue.enqueue(ItemKind::Event, json!({ "n": n }));
            queue.enqueue(ItemKind::Error, json!({ "n": n }));
        }

        assert!(queue.is_empty());
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(transport.count_for("/events"), 1);
        assert_eq!(transport.count_for("/errors"), 1);
    }

    #[tokio::test]
    async fn test_flush_groups_by_kind() {
        let (queue, transport) = create_queue();

        queue.enqueue(ItemKind::Network, json!({ "url": "/a" }));
        queue.enqueue(ItemKind::Performance, json!({ "lcp": 1200 }));
        queue.enqueue(ItemKind::Network, json!({ "url": "/b" }));

        assert_eq!(queue.flush(EgressMode::Normal), 2);

        let sent = transport.sent();
        let network = sent.iter().find(|r| r.path_is("/networks")).unwrap();
        assert_eq!(network.body["networks"][0]["url"], "/a");
        assert_eq!(network.body["networks"][1]["url"], "/b");
        assert_eq!(network.body["appId"], "app_abc");

        let perf = sent.iter().find(|r| r.path_is("/performances")).unwrap();
        assert_eq!(perf.body["performances"][0]["lcp"], 1200);
    }

    #[test]
    fn test_enqueue_during_flush_lands_in_next_generation() {
        let transport = Arc::new(CapturingTransport::new());
        let slot: Arc<Mutex<std::sync::Weak<DeliveryQueue>>> =
            Arc::new(Mutex::new(std::sync::Weak::new()));

        let hook_slot = Arc::clone(&slot);
        let hook: BeforeSend = Arc::new(move |channel: Channel, body: Value| {
            if channel == Channel::Batch(ItemKind::Event) {
                if let Some(queue) = hook_slot.lock().upgrade() {
                    queue.enqueue(ItemKind::Event, json!({ "n": "late" }));
                }
            }
            Some(body)
        });

        let queue = Arc::new(
            DeliveryQueue::new(
                &test_config(),
                transport.clone(),
                Arc::new(ManualClock::new(1_000)),
            )
            .with_before_send(hook),
        );
        *slot.lock() = Arc::downgrade(&queue);

        queue.enqueue(ItemKind::Event, json!({ "n": 1 }));
        queue.enqueue(ItemKind::Event, json!({ "n": 2 }));
        assert_eq!(queue.flush(EgressMode::BestEffort), 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let events = sent[0].body["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["n"] != "late"));
        assert_eq!(queue.len(), 1);

        *slot.lock() = std::sync::Weak::new();
        assert_eq!(queue.flush(EgressMode::BestEffort), 1);
        assert_eq!(transport.sent()[1].body["events"][0]["n"], "late");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let (queue, transport) = create_queue();
        assert_eq!(queue.flush(EgressMode::BestEffort), 0);
        assert!(transport.sent().is_empty());
        assert_eq!(queue.stats().flushes, 0);
    }

    #[test]
    fn test_unload_uses_beacon_regardless_of_size() {
        let (queue, transport) = create_queue();

        for n in 0..3 {
            queue.enqueue(ItemKind::Heatmap, json!({ "x": n }));
        }
        queue.flush_for(FlushTrigger::Unload);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mode, EgressMode::BestEffort);
        assert_eq!(sent[0].bearer, None);
        assert_eq!(sent[0].body["apiKey"], "key_123");
    }

    #[test]
    fn test_veto_suppresses_send() {
        let (queue, transport) = create_queue();
        let queue = queue.with_before_send(Arc::new(|channel, body| match channel {
            Channel::Batch(ItemKind::Error) => None,
            _ => Some(body),
        }));

        queue.enqueue(ItemKind::Error, json!({ "message": "secret" }));
        queue.enqueue(ItemKind::Event, json!({ "name": "click" }));
        queue.flush(EgressMode::BestEffort);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].path_is("/events"));
        assert_eq!(queue.stats().vetoed, 1);
    }

    #[test]
    fn test_hook_can_rewrite_body() {
        let (queue, transport) = create_queue();
        let queue = queue.with_before_send(Arc::new(|_, mut body| {
            body["scrubbed"] = json!(true);
            Some(body)
        }));

        queue.send_immediate(
            EndpointClass::Identify,
            json!({ "userId": "u1" }),
            EgressMode::BestEffort,
        );

        let sent = transport.sent();
        assert_eq!(sent[0].body["scrubbed"], true);
        assert_eq!(sent[0].body["userId"], "u1");
        assert!(sent[0].path_is("/identify"));
    }

    #[tokio::test]
    async fn test_failures_are_absorbed() {
        let (queue, transport) = create_queue();
        transport.respond_with(500);

        queue.enqueue(ItemKind::Event, json!({}));
        queue.flush(EgressMode::Normal);

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let stats = queue.stats();
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_rejected_beacon_is_dropped() {
        let (queue, transport) = create_queue();
        transport.set_beacon_available(false);

        queue.enqueue(ItemKind::Event, json!({}));
        assert_eq!(queue.flush(EgressMode::BestEffort), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().failures, 1);
    }

    /// Never completes; nothing outside a runtime can drive it
    struct StalledTransport;

    impl Transport for StalledTransport {
        fn send(
            &self,
            _request: OutboundRequest,
        ) -> futures::future::BoxFuture<'static, crate::utils::errors::Result<u16>> {
            Box::pin(futures::future::pending())
        }

        fn send_beacon(&self, _url: &str, _body: Bytes) -> bool {
            true
        }
    }

    #[test]
    fn test_unsettled_send_without_runtime_is_not_counted() {
        let queue = DeliveryQueue::new(
            &test_config(),
            Arc::new(StalledTransport),
            Arc::new(ManualClock::new(1_000)),
        );

        queue.enqueue(ItemKind::Event, json!({ "n": 1 }));
        assert_eq!(queue.flush(EgressMode::Normal), 0);

        let stats = queue.stats();
        assert_eq!(stats.sends, 0);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_settled_send_without_runtime_is_counted() {
        let (queue, transport) = create_queue();

        queue.enqueue(ItemKind::Event, json!({ "n": 1 }));
        assert_eq!(queue.flush(EgressMode::Normal), 1);
        assert_eq!(transport.sent().len(), 1);

        let stats = queue.stats();
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_loop() {
        let (queue, transport) = create_queue();
        let queue = Arc::new(queue);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&queue).spawn_flush_loop(cancel.clone());

        queue.enqueue(ItemKind::Event, json!({ "n": 1 }));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_empty());
        assert_eq!(transport.count_for("/events"), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    fn kind_strategy() -> impl Strategy<Value = ItemKind> {
        prop_oneof![
            Just(ItemKind::Event),
            Just(ItemKind::Error),
            Just(ItemKind::Network),
            Just(ItemKind::Performance),
            Just(ItemKind::Heatmap),
        ]
    }

    proptest! {
        #[test]
        fn prop_flush_preserves_per_kind_order(kinds in proptest::collection::vec(kind_strategy(), 0..49)) {
            let (queue, transport) = create_queue();

            for (n, kind) in kinds.iter().enumerate() {
                queue.enqueue(*kind, json!({ "n": n }));
            }
            queue.flush(EgressMode::BestEffort);

            for kind in ItemKind::ALL {
                let expected: Vec<u64> = kinds
                    .iter()
                    .enumerate()
                    .filter(|(_, k)| **k == kind)
                    .map(|(n, _)| n as u64)
                    .collect();

                let actual: Vec<u64> = transport
                    .sent()
                    .iter()
                    .filter(|r| r.path_is(kind.path()))
                    .flat_map(|r| r.body[kind.collection_key()].as_array().cloned().unwrap_or_default())
                    .map(|v| v["n"].as_u64().unwrap())
                    .collect();

                prop_assert_eq!(actual, expected);
            }
        }
    }
}
