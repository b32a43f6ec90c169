//! Fan-out distributor for the controller's broadcast pull path.
//!
//! Each subscriber gets a dedicated bounded mpsc channel, providing isolation
//! and true backpressure: a full subscriber channel suspends the publisher
//! rather than silently dropping scans the way a lossy broadcast channel
//! would. Sends to all subscribers run in parallel so one slow subscriber
//! does not add head-of-line latency for the others (it still bounds the
//! publisher's overall rate once its channel fills).

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::scan::FrozenScanItem;

struct Subscriber {
    label: String,
    tx: mpsc::Sender<Arc<FrozenScanItem>>,
}

/// Multi-subscriber scan fan-out with per-subscriber bounded channels.
pub struct ScanDistributor {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

impl ScanDistributor {
    /// Creates a distributor whose subscriber channels hold `capacity` scans.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber and returns its receiving end.
    ///
    /// The label only shows up in logs when the subscriber is swept after
    /// going away.
    pub async fn subscribe(&self, label: impl Into<String>) -> mpsc::Receiver<Arc<FrozenScanItem>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subscribers = self.subscribers.lock().await;
        subscribers.push(Subscriber {
            label: label.into(),
            tx,
        });
        rx
    }

    /// Delivers one scan to every live subscriber, suspending on full
    /// channels. Subscribers whose receiver was dropped are swept.
    pub async fn publish(&self, scan: Arc<FrozenScanItem>) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            return;
        }

        let sends: Vec<_> = subscribers
            .iter()
            .map(|sub| sub.tx.send(scan.clone()))
            .collect();
        let results = join_all(sends).await;

        // Sweep dead subscribers in reverse to keep indices stable.
        let dead: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_err().then_some(i))
            .collect();
        for i in dead.iter().rev() {
            let sub = subscribers.swap_remove(*i);
            debug!(subscriber = %sub.label, "dropping disconnected scan subscriber");
        }
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{AnalyzerInfo, Freeze, ScanItem};

    fn scan(n: u64) -> Arc<FrozenScanItem> {
        let mut item = ScanItem::new(1, AnalyzerInfo::default());
        item.scan_number = n;
        item.set_payload(vec![400.0], vec![1.0]);
        Arc::new(item.freeze())
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_scan() {
        let distributor = ScanDistributor::new(16);
        let mut rx_a = distributor.subscribe("a").await;
        let mut rx_b = distributor.subscribe("b").await;

        for n in 0..5 {
            distributor.publish(scan(n)).await;
        }

        for n in 0..5 {
            assert_eq!(rx_a.recv().await.map(|s| s.scan_number), Some(n));
            assert_eq!(rx_b.recv().await.map(|s| s.scan_number), Some(n));
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_swept() {
        let distributor = ScanDistributor::new(4);
        let rx = distributor.subscribe("gone").await;
        drop(rx);

        distributor.publish(scan(1)).await;
        assert_eq!(distributor.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let distributor = ScanDistributor::new(4);
        distributor.publish(scan(1)).await;
        assert_eq!(distributor.subscriber_count().await, 0);
    }
}
