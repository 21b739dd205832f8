// src/recording/event_queue.rs
//! Bounded recording feed
//!
//! Capture callbacks push into a lock-free bounded queue and return
//! immediately; the stream manager drains it on its own schedule. A full
//! feed drops the event rather than blocking the producer.

use crate::recording::events::CapturedEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Producer handle for the capture feed. Cheap to clone.
#[derive(Clone)]
pub struct RecordingFeed {
    /// Underlying bounded queue
    queue: Arc<ArrayQueue<CapturedEvent>>,

    /// Wakes the consumer after a push
    notify: Arc<Notify>,

    /// Push counter
    push_count: Arc<AtomicU64>,

    /// Pop counter
    pop_count: Arc<AtomicU64>,

    /// Drop counter (feed full)
    drop_count: Arc<AtomicU64>,
}

impl RecordingFeed {
    /// Create a new feed
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            notify: Arc::new(Notify::new()),
            push_count: Arc::new(AtomicU64::new(0)),
            pop_count: Arc::new(AtomicU64::new(0)),
            drop_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push a captured event (non-blocking)
    pub fn push(&self, event: CapturedEvent) -> Result<(), CapturedEvent> {
        match self.queue.push(event) {
            Ok(_) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                Ok(())
            }
            Err(event) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    /// Try to pop an event (non-blocking)
    pub fn try_pop(&self) -> Option<CapturedEvent> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Resolves after the next push (or immediately if one is pending)
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Get feed statistics
    pub fn stats(&self) -> FeedStats {
        FeedStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Feed statistics
#[derive(Debug, Clone)]
pub struct FeedStats {
    /// Total events pushed
    pub push_count: u64,

    /// Total events popped
    pub pop_count: u64,

    /// Total events dropped (feed full)
    pub drop_count: u64,

    /// Current feed size
    pub current_size: usize,

    /// Feed capacity
    pub capacity: usize,
}

impl FeedStats {
    /// Calculate drop rate
    pub fn drop_rate(&self) -> f64 {
        let attempts = self.push_count + self.drop_count;
        if attempts == 0 {
            0.0
        } else {
            (self.drop_count as f64 / attempts as f64) * 100.0
        }
    }
}
