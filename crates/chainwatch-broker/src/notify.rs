//! Fire-and-forget notifications to an external delivery service.
//!
//! The notifier only publishes; a separate process consumes the queue and
//! performs the actual delivery (mail, push, webhooks). Messages are
//! persistent so notifications survive a broker restart while the
//! delivery service is down.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::{BrokerChannel, PublishTarget};
use crate::error::BrokerError;

/// Default queue the delivery service consumes.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

/// A notification handed off to the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// What happened, as free-form structured data.
    pub data: serde_json::Value,
    /// Delivery action hint (e.g. `"email"`, `"push"`).
    pub action: String,
    /// Addresses or user ids, interpreted by the delivery service.
    pub recipients: Vec<String>,
}

impl Notification {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

/// Publisher half of the notification pipeline.
pub struct Notifier {
    broker: Arc<dyn BrokerChannel>,
    queue: String,
}

impl Notifier {
    pub fn new(broker: Arc<dyn BrokerChannel>) -> Self {
        Self::with_queue(broker, NOTIFICATIONS_QUEUE)
    }

    pub fn with_queue(broker: Arc<dyn BrokerChannel>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }

    /// Declare the notification queue so messages are held even before the
    /// delivery service attaches.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.broker.declare_queue(&self.queue).await
    }

    /// Enqueue a notification. Returns once the broker accepted it; actual
    /// delivery happens elsewhere.
    pub async fn send(&self, notification: &Notification) -> Result<(), BrokerError> {
        let bytes = notification.to_bytes()?;
        self.broker
            .publish(&PublishTarget::Queue(self.queue.clone()), &bytes, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConsumeHandler;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Sink {
        received: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl ConsumeHandler for Sink {
        async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError> {
            self.received
                .lock()
                .unwrap()
                .push(Notification::from_bytes(payload)?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sent_notification_reaches_the_queue_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Notifier::new(broker.clone());
        notifier.start().await.unwrap();

        let sink = Arc::new(Sink {
            received: Mutex::new(vec![]),
        });
        broker
            .consume(NOTIFICATIONS_QUEUE, sink.clone())
            .await
            .unwrap();

        notifier
            .send(&Notification {
                data: json!({ "deal": 7, "status": "active" }),
                action: "email".into(),
                recipients: vec!["ops@example.com".into()],
            })
            .await
            .unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].action, "email");
        assert_eq!(received[0].data["deal"], 7);
    }

    #[tokio::test]
    async fn notifications_are_held_until_a_consumer_attaches() {
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Notifier::new(broker.clone());
        notifier.start().await.unwrap();

        notifier
            .send(&Notification {
                data: json!({}),
                action: "push".into(),
                recipients: vec![],
            })
            .await
            .unwrap();

        let sink = Arc::new(Sink {
            received: Mutex::new(vec![]),
        });
        broker
            .consume(NOTIFICATIONS_QUEUE, sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }
}
