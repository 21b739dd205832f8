// src/delivery/batch.rs
//! Batch model and request envelope

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a queued collector payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Event,
    Error,
    Network,
    Performance,
    Heatmap,
}

impl ItemKind {
    pub const ALL: [ItemKind; 5] = [
        ItemKind::Event,
        ItemKind::Error,
        ItemKind::Network,
        ItemKind::Performance,
        ItemKind::Heatmap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Error => "error",
            ItemKind::Network => "network",
            ItemKind::Performance => "performance",
            ItemKind::Heatmap => "heatmap",
        }
    }

    /// Name of the array wrapping a batch of this kind (`"<kind>s"`)
    pub fn collection_key(&self) -> &'static str {
        match self {
            ItemKind::Event => "events",
            ItemKind::Error => "errors",
            ItemKind::Network => "networks",
            ItemKind::Performance => "performances",
            ItemKind::Heatmap => "heatmaps",
        }
    }

    /// Collector path for batches of this kind
    pub fn path(&self) -> &'static str {
        match self {
            ItemKind::Event => "/events",
            ItemKind::Error => "/errors",
            ItemKind::Network => "/networks",
            ItemKind::Performance => "/performances",
            ItemKind::Heatmap => "/heatmaps",
        }
    }
}

/// Traffic that bypasses batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Session,
    Identify,
    Recording,
}

impl EndpointClass {
    pub fn path(&self) -> &'static str {
        match self {
            EndpointClass::Session => "/sessions",
            EndpointClass::Identify => "/identify",
            EndpointClass::Recording => "/recordings",
        }
    }
}

/// Outgoing channel handed to the `before_send` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Batch(ItemKind),
    Immediate(EndpointClass),
}

/// Buffered collector payload
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub kind: ItemKind,
    pub payload: Value,
    /// Epoch milliseconds at enqueue
    pub enqueued_at: i64,
}

/// Items of one kind, in enqueue order
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub kind: ItemKind,
    pub items: Vec<QueuedItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_payloads(self) -> Vec<Value> {
        self.items.into_iter().map(|item| item.payload).collect()
    }
}

/// Group a buffer generation by kind.
///
/// Order inside each batch is enqueue order. Batches come out in
/// [`ItemKind::ALL`] order, which carries no delivery guarantee.
pub fn partition(items: Vec<QueuedItem>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = ItemKind::ALL
        .iter()
        .map(|kind| Batch {
            kind: *kind,
            items: Vec::new(),
        })
        .collect();

    for item in items {
        let slot = ItemKind::ALL
            .iter()
            .position(|kind| *kind == item.kind)
            .unwrap_or_default();
        batches[slot].items.push(item);
    }

    batches.retain(|batch| !batch.is_empty());
    batches
}

/// Identity fields attached to every outgoing body
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub api_key: String,
    pub app_id: String,
    pub environment: String,
    pub release: Option<String>,
}

impl Envelope {
    /// `{ "<kind>s": [...], apiKey, appId, environment, release }`
    pub fn wrap_batch(&self, kind: ItemKind, payloads: Vec<Value>) -> Value {
        let mut body = Map::new();
        body.insert(kind.collection_key().to_string(), Value::Array(payloads));
        self.stamp(&mut body);
        Value::Object(body)
    }

    /// Merge the envelope into an immediate payload. Non-object payloads are
    /// nested under `data`.
    pub fn wrap_immediate(&self, payload: Value) -> Value {
        let mut body = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        self.stamp(&mut body);
        Value::Object(body)
    }

    fn stamp(&self, body: &mut Map<String, Value>) {
        body.insert("apiKey".to_string(), Value::from(self.api_key.clone()));
        body.insert("appId".to_string(), Value::from(self.app_id.clone()));
        body.insert(
            "environment".to_string(),
            Value::from(self.environment.clone()),
        );
        body.insert(
            "release".to_string(),
            self.release.clone().map(Value::from).unwrap_or(Value::Null),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(kind: ItemKind, n: u64) -> QueuedItem {
        QueuedItem {
            kind,
            payload: json!({ "n": n }),
            enqueued_at: n as i64,
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            api_key: "key_123".to_string(),
            app_id: "app_abc".to_string(),
            environment: "staging".to_string(),
            release: Some("1.4.0".to_string()),
        }
    }

    #[test]
    fn test_partition_preserves_order_within_kind() {
        let items = vec![
            item(ItemKind::Event, 1),
            item(ItemKind::Error, 2),
            item(ItemKind::Event, 3),
            item(ItemKind::Network, 4),
            item(ItemKind::Event, 5),
        ];

        let batches = partition(items);
        assert_eq!(batches.len(), 3);

        let events = batches.iter().find(|b| b.kind == ItemKind::Event).unwrap();
        let order: Vec<i64> = events.items.iter().map(|i| i.enqueued_at).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[test]
    fn test_partition_empty() {
        assert!(partition(Vec::new()).is_empty());
    }

    #[test]
    fn test_wrap_batch() {
        let body = envelope().wrap_batch(ItemKind::Error, vec![json!({"message": "boom"})]);

        assert_eq!(body["errors"][0]["message"], "boom");
        assert_eq!(body["apiKey"], "key_123");
        assert_eq!(body["appId"], "app_abc");
        assert_eq!(body["environment"], "staging");
        assert_eq!(body["release"], "1.4.0");
    }

    #[test]
    fn test_wrap_immediate_nests_scalars() {
        let body = envelope().wrap_immediate(json!("ping"));
        assert_eq!(body["data"], "ping");
        assert_eq!(body["apiKey"], "key_123");

        let body = envelope().wrap_immediate(json!({"sessionId": "s1"}));
        assert_eq!(body["sessionId"], "s1");
    }

    #[test]
    fn test_paths() {
        assert_eq!(ItemKind::Heatmap.path(), "/heatmaps");
        assert_eq!(ItemKind::Performance.collection_key(), "performances");
        assert_eq!(EndpointClass::Recording.path(), "/recordings");
    }
}
