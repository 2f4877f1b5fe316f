use crate::{
    error::QueueError,
    queue::broker::{Broker, Delivery},
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<String, Delivery>,
    acked: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_id: u64,
    connected: bool,
}

/// Broker held entirely in process memory.
///
/// `disconnect` simulates a lost connection: every call fails with
/// [`QueueError::Reconnect`] until `reconnect`, and unacknowledged messages go
/// back to the front of their queue for redelivery.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                connected: true,
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>, QueueError> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(QueueError::Reconnect)
        }
    }

    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        for queue in state.queues.values_mut() {
            let mut returned: Vec<Delivery> = queue.unacked.drain().map(|(_, d)| d).collect();
            returned.sort_by(|a, b| b.id.cmp(&a.id));
            for mut delivery in returned {
                delivery.redelivered = true;
                queue.ready.push_front(delivery);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    /// Messages waiting to be fetched.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages fetched but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Bodies currently waiting on `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|d| d.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        self.connected()?
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.connected()?;
            state.next_id += 1;
            // Zero padded so ids sort in publish order
            let id = format!("{:020}", state.next_id);
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(Delivery {
                    id,
                    queue: queue.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.connected()?;
                let entry = state.queues.entry(queue.to_string()).or_default();
                if !entry.ready.is_empty() {
                    let take = max.min(entry.ready.len());
                    let batch: Vec<Delivery> = entry.ready.drain(..take).collect();
                    for delivery in &batch {
                        entry.unacked.insert(delivery.id.clone(), delivery.clone());
                    }
                    return Ok(batch);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.connected()?;
        if let Some(queue) = state.queues.get_mut(&delivery.queue) {
            if queue.unacked.remove(&delivery.id).is_some() {
                queue.acked += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "test-queue";

    #[tokio::test]
    async fn fetched_messages_stay_pending_until_acked() {
        let broker = MemoryBroker::new();
        broker.declare(Q).await.unwrap();
        broker.publish(Q, b"one").await.unwrap();
        broker.publish(Q, b"two").await.unwrap();

        let batch = broker.fetch(Q, 10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(broker.unacked_len(Q), 2);

        broker.ack(&batch[0]).await.unwrap();
        assert_eq!(broker.unacked_len(Q), 1);
        assert_eq!(broker.acked_count(Q), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fetch_returns_after_block() {
        let broker = MemoryBroker::new();
        let batch = broker.fetch(Q, 5, Duration::from_secs(1)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn disconnect_requeues_unacked_for_redelivery() {
        let broker = MemoryBroker::new();
        broker.publish(Q, b"a").await.unwrap();
        broker.publish(Q, b"b").await.unwrap();
        let batch = broker.fetch(Q, 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch[0].body, b"a");

        broker.disconnect();
        assert!(matches!(
            broker.fetch(Q, 1, Duration::from_millis(10)).await,
            Err(QueueError::Reconnect)
        ));
        assert!(matches!(broker.ack(&batch[0]).await, Err(QueueError::Reconnect)));

        broker.reconnect();
        let again = broker.fetch(Q, 2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again[0].body, b"a");
        assert!(again[0].redelivered);
        assert_eq!(again[1].body, b"b");
        assert!(!again[1].redelivered);
    }

    #[tokio::test]
    async fn publish_wakes_a_blocked_fetch() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let fetcher = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.fetch(Q, 1, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        broker.publish(Q, b"late").await.unwrap();
        let batch = fetcher.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }
}
