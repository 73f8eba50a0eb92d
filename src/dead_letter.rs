//! Dead-letter routing for messages that keep failing.
//!
//! A message that exhausts its retries is copied, body untouched, to
//! `<queue><suffix>` (by default `sync_data.dlq`) with headers describing the
//! failure, and only then acknowledged on its original queue.
//!
//! ```text
//! x-original-queue  sync_data
//! x-failure-reason  store unavailable: connection reset
//! x-failed-at       2024-01-01T00:00:00+00:00
//! x-retry-count     3
//! ```

use crate::broker::{
    Broker, BrokerError, Delivery, Message, FAILED_AT_HEADER, FAILURE_REASON_HEADER,
    ORIGINAL_QUEUE_HEADER, RETRY_COUNT_HEADER,
};
use chrono::{DateTime, Utc};
use tracing::info;

/// A message as found in a dead-letter queue.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    pub original_queue: String,

    /// Error from the last failed attempt
    pub reason: String,

    pub failed_at: DateTime<Utc>,

    /// Retries spent before giving up
    pub retry_count: u32,

    pub body: Vec<u8>,
}

impl FailedMessage {
    /// Read the failure headers back from a dead-lettered message.
    pub fn from_message(message: &Message) -> Option<Self> {
        let failed_at = message.headers.get(FAILED_AT_HEADER)?;
        Some(Self {
            original_queue: message.headers.get(ORIGINAL_QUEUE_HEADER)?.clone(),
            reason: message.headers.get(FAILURE_REASON_HEADER)?.clone(),
            failed_at: DateTime::parse_from_rfc3339(failed_at).ok()?.with_timezone(&Utc),
            retry_count: message
                .headers
                .get(RETRY_COUNT_HEADER)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            body: message.body.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    suffix: String,
}

impl DeadLetterRouter {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn queue_for(&self, queue: &str) -> String {
        format!("{}{}", queue, self.suffix)
    }

    /// The message to park for `delivery`.
    pub fn letter(&self, delivery: &Delivery, reason: &str, failed_at: DateTime<Utc>) -> Message {
        delivery
            .to_message()
            .with_header(ORIGINAL_QUEUE_HEADER, delivery.queue.clone())
            .with_header(FAILURE_REASON_HEADER, reason)
            .with_header(FAILED_AT_HEADER, failed_at.to_rfc3339())
    }

    /// Publish `delivery` to its dead-letter queue.
    ///
    /// The delivery itself is not settled; the caller acks it once this
    /// returns `Ok`.
    pub async fn route(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<String, BrokerError> {
        let queue = self.queue_for(&delivery.queue);
        broker
            .publish(&queue, self.letter(delivery, reason, Utc::now()))
            .await?;

        info!(
            queue = %delivery.queue,
            dead_letter_queue = %queue,
            retry_count = delivery.retry_count(),
            reason = %reason,
            "Message moved to dead-letter queue"
        );
        Ok(queue)
    }
}

impl Default for DeadLetterRouter {
    fn default() -> Self {
        Self::new(".dlq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use futures_util::StreamExt;

    #[test]
    fn test_queue_name() {
        let router = DeadLetterRouter::default();
        assert_eq!(router.queue_for("sync_data"), "sync_data.dlq");
        assert_eq!(DeadLetterRouter::new("-failed").queue_for("q"), "q-failed");
    }

    #[tokio::test]
    async fn test_route_keeps_body_and_adds_headers() {
        let broker = MemoryBroker::new();
        broker.declare_queue("sync_data").await.unwrap();
        broker.declare_queue("sync_data.dlq").await.unwrap();
        broker
            .publish(
                "sync_data",
                Message::new(b"{\"event\":\"x\"}".to_vec()).with_header(RETRY_COUNT_HEADER, "3"),
            )
            .await
            .unwrap();

        let mut sub = broker.consume("sync_data", "t").await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();

        let router = DeadLetterRouter::default();
        let queue = router
            .route(&broker, &delivery, "store unavailable")
            .await
            .unwrap();
        assert_eq!(queue, "sync_data.dlq");

        let parked = broker.published("sync_data.dlq");
        assert_eq!(parked.len(), 1);
        let failed = FailedMessage::from_message(&parked[0]).unwrap();
        assert_eq!(failed.original_queue, "sync_data");
        assert_eq!(failed.reason, "store unavailable");
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.body, delivery.body);
    }

    #[tokio::test]
    async fn test_route_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker.publish("q", Message::new(vec![])).await.unwrap();
        let mut sub = broker.consume("q", "t").await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();

        let result = DeadLetterRouter::default()
            .route(&broker, &delivery, "boom")
            .await;
        assert!(matches!(result, Err(BrokerError::UnknownQueue(_))));
    }

    #[test]
    fn test_plain_message_is_not_a_failed_message() {
        assert!(FailedMessage::from_message(&Message::new(vec![])).is_none());
    }
}
