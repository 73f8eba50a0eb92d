//! Publisher.
//!
//! Fire-and-forget sends of envelopes to the well-known queues. A publish
//! never retries and never waits longer than the configured timeout. Callers
//! that have already committed their store write use the best-effort helpers
//! ([`Publisher::index_journal`], [`Publisher::forget_journal`]), which log a
//! failure and move on.

use crate::broker::{BrokerError, Message};
use crate::config::QueuesConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{self, CodecError};
use crate::events::{self, JournalDelete, JournalIndex, UserJournal};
use crate::metrics::Metrics;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker is disconnected")]
    Disconnected,

    #[error("unknown destination '{0}'")]
    UnknownDestination(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("publish to '{queue}' failed: {source}")]
    Broker {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("publish to '{queue}' timed out after {timeout:?}")]
    Timeout { queue: String, timeout: Duration },
}

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    queues: QueuesConfig,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        queues: QueuesConfig,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connection,
            queues,
            timeout,
            metrics,
        }
    }

    pub fn queues(&self) -> &QueuesConfig {
        &self.queues
    }

    /// Publish `payload` as `event` to `destination`.
    pub async fn publish<P: Serialize + Sync + ?Sized>(
        &self,
        destination: &str,
        event: &str,
        payload: &P,
    ) -> Result<(), PublishError> {
        self.send(destination, event, None, payload).await
    }

    /// Publish with a correlation id the reply will carry back.
    pub async fn publish_correlated<P: Serialize + Sync + ?Sized>(
        &self,
        destination: &str,
        event: &str,
        correlation_id: &str,
        payload: &P,
    ) -> Result<(), PublishError> {
        self.send(destination, event, Some(correlation_id), payload)
            .await
    }

    async fn send<P: Serialize + Sync + ?Sized>(
        &self,
        destination: &str,
        event: &str,
        correlation_id: Option<&str>,
        payload: &P,
    ) -> Result<(), PublishError> {
        let result = self
            .try_send(destination, event, correlation_id, payload)
            .await;

        match &result {
            Ok(()) => {
                self.metrics.record_published();
                debug!(queue = %destination, event = %event, "Message published");
            }
            Err(_) => self.metrics.record_publish_failure(),
        }
        result
    }

    async fn try_send<P: Serialize + Sync + ?Sized>(
        &self,
        destination: &str,
        event: &str,
        correlation_id: Option<&str>,
        payload: &P,
    ) -> Result<(), PublishError> {
        if !self.queues.is_known(destination) {
            return Err(PublishError::UnknownDestination(destination.to_string()));
        }

        let broker = self.connection.current().ok_or(PublishError::Disconnected)?;
        let body = envelope::encode_correlated(event, Utc::now(), correlation_id, payload)?;

        match tokio::time::timeout(self.timeout, broker.publish(destination, Message::new(body)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(PublishError::Broker {
                queue: destination.to_string(),
                source,
            }),
            Err(_) => Err(PublishError::Timeout {
                queue: destination.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Ask the worker to index a journal. Failures are logged only.
    pub async fn index_journal(&self, journal: &UserJournal) {
        let payload = JournalIndex::from(journal);
        if let Err(e) = self
            .publish(&self.queues.tasks, events::JOURNAL_INDEX, &payload)
            .await
        {
            warn!(
                journal_id = %journal.id,
                event = events::JOURNAL_INDEX,
                error = %e,
                "Failed to publish journal task"
            );
        }
    }

    /// Ask the worker to drop a deleted journal from its index. Failures are logged only.
    pub async fn forget_journal(&self, id: Uuid, user_id: Uuid) {
        let payload = JournalDelete { id, user_id };
        if let Err(e) = self
            .publish(&self.queues.tasks, events::JOURNAL_DELETE, &payload)
            .await
        {
            warn!(
                journal_id = %id,
                event = events::JOURNAL_DELETE,
                error = %e,
                "Failed to publish journal task"
            );
        }
    }
}
