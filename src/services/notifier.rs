use crate::{
    error::NotifyError,
    models::EmailSend,
    queue::{publish_json, Broker, EMAIL_SEND_QUEUE},
};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: EmailSend) -> Result<(), NotifyError>;
}

/// Hands emails to the mail sender through `email-send-queue`.
pub struct QueueNotifier {
    broker: Arc<dyn Broker>,
}

impl QueueNotifier {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn send(&self, email: EmailSend) -> Result<(), NotifyError> {
        publish_json(self.broker.as_ref(), EMAIL_SEND_QUEUE, &email).await?;
        tracing::debug!(subject = %email.subject, "Queued email");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBroker;

    #[tokio::test]
    async fn email_lands_on_send_queue_as_json() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = QueueNotifier::new(broker.clone());
        notifier
            .send(EmailSend {
                subject: "DASH Payment Confirmed".into(),
                content: "ok".into(),
                content_type: "text/html".into(),
                user_names: vec!["alice".into()],
                emails: vec!["alice@example.com".into()],
            })
            .await
            .unwrap();

        let bodies = broker.peek(EMAIL_SEND_QUEUE);
        assert_eq!(bodies.len(), 1);
        let email: EmailSend = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(email.user_names, vec!["alice".to_string()]);
    }
}
