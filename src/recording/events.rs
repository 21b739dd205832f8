// src/recording/events.rs
//! Captured and emitted recording events

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalSource {
    Mutation,
    /// Mouse or touch movement; the only paced source
    PointerMove,
    /// Clicks, presses, focus changes
    PointerInteraction,
    Scroll,
    ViewportResize,
    Input,
    Custom,
}

/// Classification of an event coming off the capture feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    FullSnapshot,
    /// Page metadata (URL, viewport) that accompanies a snapshot
    Meta,
    Incremental(IncrementalSource),
}

/// Event as produced by the capture callback
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub kind: CaptureKind,

    /// Wall-clock capture time (epoch milliseconds)
    pub timestamp_ms: i64,

    pub payload: Value,
}

impl CapturedEvent {
    pub fn new(kind: CaptureKind, timestamp_ms: i64, payload: Value) -> Self {
        Self {
            kind,
            timestamp_ms,
            payload,
        }
    }

    pub fn full_snapshot(timestamp_ms: i64, payload: Value) -> Self {
        Self::new(CaptureKind::FullSnapshot, timestamp_ms, payload)
    }

    pub fn incremental(source: IncrementalSource, timestamp_ms: i64, payload: Value) -> Self {
        Self::new(CaptureKind::Incremental(source), timestamp_ms, payload)
    }

    /// Classify an rrweb-style event (`{ type, timestamp, data: { source } }`).
    ///
    /// Returns `None` when `type` or `timestamp` is missing.
    pub fn from_wire(raw: Value) -> Option<Self> {
        let event_type = raw.get("type")?.as_u64()?;
        let timestamp_ms = raw.get("timestamp")?.as_i64()?;

        let kind = match event_type {
            2 => CaptureKind::FullSnapshot,
            4 => CaptureKind::Meta,
            3 => {
                let source = raw
                    .get("data")
                    .and_then(|data| data.get("source"))
                    .and_then(Value::as_u64);
                CaptureKind::Incremental(match source {
                    Some(0) => IncrementalSource::Mutation,
                    Some(1) | Some(6) => IncrementalSource::PointerMove,
                    Some(2) => IncrementalSource::PointerInteraction,
                    Some(3) => IncrementalSource::Scroll,
                    Some(4) => IncrementalSource::ViewportResize,
                    Some(5) => IncrementalSource::Input,
                    _ => IncrementalSource::Custom,
                })
            }
            _ => CaptureKind::Incremental(IncrementalSource::Custom),
        };

        Some(Self {
            kind,
            timestamp_ms,
            payload: raw,
        })
    }

    pub fn is_full_snapshot(&self) -> bool {
        self.kind == CaptureKind::FullSnapshot
    }

    pub fn is_pointer_move(&self) -> bool {
        self.kind == CaptureKind::Incremental(IncrementalSource::PointerMove)
    }
}

/// Emitted event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingEventKind {
    FullSnapshot,
    Incremental,
}

/// Event as delivered to the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEvent {
    pub kind: RecordingEventKind,

    /// Milliseconds since session start
    pub relative_timestamp: u64,

    pub payload: Value,
}

impl RecordingEvent {
    pub fn from_captured(event: CapturedEvent, relative_timestamp: u64) -> Self {
        let kind = if event.is_full_snapshot() {
            RecordingEventKind::FullSnapshot
        } else {
            RecordingEventKind::Incremental
        };

        Self {
            kind,
            relative_timestamp,
            payload: event.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_wire_classification() {
        let snapshot = CapturedEvent::from_wire(json!({"type": 2, "timestamp": 10, "data": {}})).unwrap();
        assert!(snapshot.is_full_snapshot());

        let meta = CapturedEvent::from_wire(json!({"type": 4, "timestamp": 9, "data": {"href": "/"}})).unwrap();
        assert_eq!(meta.kind, CaptureKind::Meta);

        let mouse = CapturedEvent::from_wire(json!({"type": 3, "timestamp": 11, "data": {"source": 1}})).unwrap();
        assert!(mouse.is_pointer_move());

        let touch = CapturedEvent::from_wire(json!({"type": 3, "timestamp": 11, "data": {"source": 6}})).unwrap();
        assert!(touch.is_pointer_move());

        let click = CapturedEvent::from_wire(json!({"type": 3, "timestamp": 12, "data": {"source": 2}})).unwrap();
        assert_eq!(
            click.kind,
            CaptureKind::Incremental(IncrementalSource::PointerInteraction)
        );
    }

    #[test]
    fn test_from_wire_requires_type_and_timestamp() {
        assert!(CapturedEvent::from_wire(json!({"timestamp": 1})).is_none());
        assert!(CapturedEvent::from_wire(json!({"type": 2})).is_none());
    }

    #[test]
    fn test_emitted_shape() {
        let event = RecordingEvent::from_captured(
            CapturedEvent::full_snapshot(5_000, json!({"node": 1})),
            250,
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "fullSnapshot");
        assert_eq!(value["relativeTimestamp"], 250);
    }
}
