use crate::{
    error::QueueError,
    queue::broker::{Broker, Delivery},
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// What to do with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal outcome reached; remove the message from the queue.
    Ack,
    /// Processing was interrupted; leave the message pending for redelivery.
    Abandon,
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery, cancel: CancellationToken) -> Disposition;
}

/// Consumes one queue, running each delivery as its own task.
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    queue: String,
    prefetch: usize,
    fetch_block: Duration,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, queue: &str, prefetch: usize) -> Self {
        Self {
            broker,
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            fetch_block: Duration::from_secs(5),
        }
    }

    pub fn with_fetch_block(mut self, block: Duration) -> Self {
        self.fetch_block = block;
        self
    }

    /// Runs until `shutdown` fires (`Ok`) or the broker connection is lost
    /// (`Err(QueueError::Reconnect)`). Either way in-flight handlers are
    /// cancelled and awaited before returning.
    pub async fn consume<H: MessageHandler>(
        &self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        self.broker.declare(&self.queue).await?;
        tracing::info!(queue = %self.queue, prefetch = self.prefetch, "Consuming queue");

        let permits = Arc::new(Semaphore::new(self.prefetch));
        let tracker = TaskTracker::new();
        let in_flight = shutdown.child_token();
        let (fault_tx, mut fault_rx) = mpsc::channel::<QueueError>(1);

        let result = loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(err) = fault_rx.recv() => break Err(err),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(QueueError::Broker("permit pool closed".to_string())),
                },
            };
            let mut slots: Vec<OwnedSemaphorePermit> = vec![first];
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                slots.push(permit);
            }

            let deliveries = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(err) = fault_rx.recv() => break Err(err),
                fetched = self.broker.fetch(&self.queue, slots.len(), self.fetch_block) => match fetched {
                    Ok(deliveries) => deliveries,
                    Err(err) => break Err(err),
                },
            };

            for delivery in deliveries {
                let Some(permit) = slots.pop() else {
                    break;
                };
                self.dispatch(
                    &tracker,
                    permit,
                    delivery,
                    handler.clone(),
                    in_flight.clone(),
                    fault_tx.clone(),
                );
            }
        };

        match &result {
            Ok(()) => tracing::info!(queue = %self.queue, "Shutdown requested, stopping consumer"),
            Err(e) => tracing::error!(queue = %self.queue, error = %e, "Consumer stopped"),
        }

        in_flight.cancel();
        tracker.close();
        tracker.wait().await;
        result
    }

    fn dispatch<H: MessageHandler>(
        &self,
        tracker: &TaskTracker,
        permit: OwnedSemaphorePermit,
        delivery: Delivery,
        handler: Arc<H>,
        cancel: CancellationToken,
        faults: mpsc::Sender<QueueError>,
    ) {
        let broker = self.broker.clone();
        tracker.spawn(async move {
            let _permit = permit;
            match handler.handle(&delivery, cancel).await {
                Disposition::Ack => {
                    if let Err(err) = broker.ack(&delivery).await {
                        tracing::error!(id = %delivery.id, error = %err, "Failed to acknowledge message");
                        if matches!(err, QueueError::Reconnect) {
                            let _ = faults.try_send(err);
                        }
                    }
                }
                Disposition::Abandon => {
                    tracing::warn!(id = %delivery.id, "Message left unacknowledged for redelivery");
                }
            }
        });
    }
}
