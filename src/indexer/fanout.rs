//! Fan-out publisher
//!
//! Every committed record is offered to each subscriber's bounded queue with
//! `try_send`. A subscriber whose queue is full (or whose receiver is gone) is
//! removed on the spot; publishing never waits on a consumer.

use super::record::Record;
use crate::common::METRICS;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

pub struct Publisher {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<Record>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Publisher {
    /// `buffer` is the per-subscriber queue capacity
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<Record>>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber. It only sees records published after this call.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut subscribers = self.subscribers();
        subscribers.insert(id, tx);
        METRICS.subscribers_active.set(subscribers.len() as u64);
        tracing::debug!(subscriber = id, total = subscribers.len(), "Subscriber connected");

        Subscription {
            id,
            rx,
            publisher: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers();
        if subscribers.remove(&id).is_some() {
            METRICS.subscribers_active.set(subscribers.len() as u64);
            tracing::debug!(subscriber = id, total = subscribers.len(), "Subscriber disconnected");
        }
    }

    /// Offer a record to every subscriber without blocking
    pub fn publish(&self, record: &Record) {
        let mut subscribers = self.subscribers();
        if subscribers.is_empty() {
            return;
        }

        let record = Arc::new(record.clone());
        subscribers.retain(|&id, tx| match tx.try_send(Arc::clone(&record)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Subscriber queue full, dropping subscriber");
                METRICS.subscribers_dropped.inc();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        METRICS.records_published.inc();
        METRICS.subscribers_active.set(subscribers.len() as u64);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

/// Receiving half of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Record>>,
    publisher: Weak<Publisher>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next record; `None` once the subscriber has been dropped by the publisher
    /// and its queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Record>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Record>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::record::Stamp;

    fn record(x: u32, color: u32) -> Record {
        Record {
            x,
            y: 0,
            color,
            placed_by: "0xabc".into(),
            placed_at: 0,
            stamp: Stamp::new(1, 0),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_current_subscribers_only() {
        let publisher = Publisher::new(8);
        let mut a = publisher.subscribe();

        publisher.publish(&record(5, 0xff));
        let mut b = publisher.subscribe();

        let got = a.recv().await.unwrap();
        assert_eq!((got.x, got.color), (5, 0xff));
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_subscriber_is_dropped() {
        let publisher = Publisher::new(2);
        let mut slow = publisher.subscribe();
        let mut fast = publisher.subscribe();

        for i in 0..3 {
            publisher.publish(&record(i, 1));
            fast.recv().await.unwrap();
        }

        assert_eq!(publisher.subscriber_count(), 1);
        // slow keeps what was queued, then sees the end of the stream
        assert_eq!(slow.recv().await.unwrap().x, 0);
        assert_eq!(slow.recv().await.unwrap().x, 1);
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let publisher = Publisher::new(4);
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        assert_eq!(publisher.subscriber_count(), 1);
        publisher.unsubscribe(b.id());
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
