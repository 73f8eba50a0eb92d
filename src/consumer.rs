//! Consumer Dispatcher.
//!
//! One supervised task per consumed queue. Each task registers a manual-ack
//! subscription on the current connection, handles deliveries one at a time,
//! and registers again whenever the connection is replaced.
//!
//! # States
//!
//! ```text
//! Idle ──► Registered ──► Receiving ◄──► Processing
//!  ▲                          │
//!  └──── connection lost ─────┘          shutdown ──► Stopped
//! ```
//!
//! # Dispositions
//!
//! | Outcome                         | Action                                  |
//! |---------------------------------|-----------------------------------------|
//! | handler succeeded               | ack                                     |
//! | malformed envelope or payload   | ack, logged, no retry                   |
//! | no handler for event            | ack, logged                             |
//! | handler failed, retries left    | backoff, republish with attempt+1, ack  |
//! | handler failed, retries spent   | copy to dead-letter queue, ack          |
//! | republish itself failed         | reject with requeue                     |

use crate::broker::{Broker, Delivery, Subscription, RETRY_COUNT_HEADER};
use crate::connection::{ConnectionManager, Link};
use crate::dead_letter::DeadLetterRouter;
use crate::envelope;
use crate::handlers::{HandlerError, HandlerTable};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of one queue consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for a connection
    Idle,
    /// Subscription created on the current connection
    Registered,
    /// Waiting for the next delivery
    Receiving,
    /// Handling a delivery
    Processing,
    Stopped,
}

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Acknowledged without effect
    Dropped,
    /// Republished with this attempt number, original acknowledged
    Retried { attempt: u32 },
    DeadLettered { queue: String },
    /// Handed back to the broker
    Requeued,
}

/// Retry budget for failing handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl DispatchPolicy {
    /// Delay before retry `attempt` (0-based), doubling up to 32x the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .checked_mul(1u32 << attempt.min(5))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Consumer tag unique to this process, e.g. `sync_data@web-1#3f2a9c1d`.
pub fn consumer_tag(queue: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "relay".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}@{}#{}", queue, host, &suffix[..8])
}

/// Something that consumes one queue under [`supervise`].
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn queue(&self) -> &str;

    fn tag(&self) -> &str;

    fn state(&self) -> &watch::Sender<ConsumerState>;

    /// Settle one delivery. Called sequentially, in broker order.
    async fn on_delivery(&self, broker: &Arc<dyn Broker>, delivery: Delivery);
}

/// Consume until shutdown, registering again after every reconnect.
pub async fn supervise<C: QueueConsumer + ?Sized>(
    consumer: &C,
    connection: &ConnectionManager,
    shutdown: &ShutdownSignal,
) {
    let queue = consumer.queue().to_string();
    let state = consumer.state();
    let mut link = connection.subscribe();

    info!(queue = %queue, tag = %consumer.tag(), "Consumer started");

    'outer: loop {
        state.send_replace(ConsumerState::Idle);

        let current = link.borrow_and_update().clone();
        let (broker, generation) = match current {
            Link::Connected { broker, generation } => (broker, generation),
            Link::Disconnected => {
                let stop = tokio::select! {
                    _ = shutdown.cancelled() => true,
                    changed = link.changed() => changed.is_err(),
                };
                if stop {
                    break;
                }
                continue;
            }
        };

        let mut subscription = match register(consumer, &broker).await {
            Some(subscription) => subscription,
            None => {
                if !broker.is_open() {
                    connection.report_lost(generation);
                }
                let stop = tokio::select! {
                    _ = shutdown.cancelled() => true,
                    _ = tokio::time::sleep(connection.policy().reconnect_interval) => false,
                };
                if stop {
                    break;
                }
                continue;
            }
        };
        state.send_replace(ConsumerState::Registered);

        loop {
            state.send_replace(ConsumerState::Receiving);
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'outer,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    state.send_replace(ConsumerState::Processing);
                    consumer.on_delivery(&broker, delivery).await;
                }
                Some(Err(e)) => {
                    warn!(queue = %queue, error = %e, "Subscription failed");
                    break;
                }
                None => {
                    debug!(queue = %queue, "Subscription ended");
                    break;
                }
            }
        }

        state.send_replace(ConsumerState::Idle);
        if broker.is_open() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(connection.policy().reconnect_interval) => {}
            }
        } else {
            connection.report_lost(generation);
            let replaced = async {
                let _ = link
                    .wait_for(|l| l.generation() != Some(generation))
                    .await;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = replaced => {}
            }
        }
    }

    state.send_replace(ConsumerState::Stopped);
    info!(queue = %queue, "Consumer stopped");
}

async fn register<C: QueueConsumer + ?Sized>(
    consumer: &C,
    broker: &Arc<dyn Broker>,
) -> Option<Subscription> {
    match broker.consume(consumer.queue(), consumer.tag()).await {
        Ok(subscription) => {
            info!(queue = %consumer.queue(), tag = %consumer.tag(), "Consumer registered");
            Some(subscription)
        }
        Err(e) => {
            warn!(queue = %consumer.queue(), error = %e, "Failed to register consumer");
            None
        }
    }
}

/// Dispatches deliveries of one queue to its handler table.
pub struct ConsumerDispatcher {
    queue: String,
    tag: String,
    table: HandlerTable,
    policy: DispatchPolicy,
    dead_letters: DeadLetterRouter,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConsumerState>,
}

impl ConsumerDispatcher {
    pub fn new(
        queue: impl Into<String>,
        table: HandlerTable,
        policy: DispatchPolicy,
        dead_letters: DeadLetterRouter,
        metrics: Arc<Metrics>,
    ) -> Self {
        let queue = queue.into();
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            tag: consumer_tag(&queue),
            queue,
            table,
            policy,
            dead_letters,
            metrics,
            state,
        }
    }

    pub fn current_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until shutdown.
    pub async fn run(&self, connection: Arc<ConnectionManager>, shutdown: ShutdownSignal) {
        info!(
            queue = %self.queue,
            events = ?self.table.events(),
            max_retries = self.policy.max_retries,
            "Dispatcher configured"
        );
        supervise(self, &connection, &shutdown).await;
    }

    /// Handle one delivery and settle it.
    pub async fn process(&self, broker: &dyn Broker, delivery: Delivery) -> Disposition {
        let envelope = match envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    error = %e,
                    "Dropping undecodable message"
                );
                return self.ack(delivery, Disposition::Dropped).await;
            }
        };
        let event = envelope.event.as_str();

        let Some(handler) = self.table.get(event) else {
            warn!(
                queue = %self.queue,
                event = %event,
                "No handler registered for event, acknowledging"
            );
            return self.ack(delivery, Disposition::Dropped).await;
        };

        debug!(
            queue = %self.queue,
            event = %event,
            handler = %handler.name(),
            retry_count = delivery.retry_count(),
            redelivered = delivery.redelivered,
            "Processing message"
        );

        match handler.handle(&envelope).await {
            Ok(outcome) => {
                debug!(queue = %self.queue, event = %event, outcome = ?outcome, "Message processed");
                self.ack(delivery, Disposition::Acked).await
            }
            Err(HandlerError::Decode(e)) => {
                warn!(
                    queue = %self.queue,
                    event = %event,
                    error = %e,
                    "Dropping message with malformed payload"
                );
                self.ack(delivery, Disposition::Dropped).await
            }
            Err(e) => self.fail(broker, delivery, event, e).await,
        }
    }

    async fn fail(
        &self,
        broker: &dyn Broker,
        delivery: Delivery,
        event: &str,
        err: HandlerError,
    ) -> Disposition {
        let attempt = delivery.retry_count();

        if err.is_retryable() && attempt < self.policy.max_retries {
            let backoff = self.policy.backoff(attempt);
            warn!(
                queue = %self.queue,
                event = %event,
                error = %err,
                retry_count = attempt,
                backoff = ?backoff,
                "Handler failed, scheduling retry"
            );
            tokio::time::sleep(backoff).await;

            let retry = delivery
                .to_message()
                .with_header(RETRY_COUNT_HEADER, (attempt + 1).to_string());
            return match broker.publish(&self.queue, retry).await {
                Ok(()) => {
                    self.metrics.record_requeued();
                    self.ack(delivery, Disposition::Retried { attempt: attempt + 1 })
                        .await
                }
                Err(e) => {
                    error!(queue = %self.queue, event = %event, error = %e, "Failed to republish for retry");
                    self.requeue(delivery).await
                }
            };
        }

        warn!(
            queue = %self.queue,
            event = %event,
            error = %err,
            retry_count = attempt,
            max_retries = self.policy.max_retries,
            "Giving up on message, moving to dead-letter queue"
        );
        match self.dead_letters.route(broker, &delivery, &err.to_string()).await {
            Ok(queue) => {
                self.metrics.record_dead_lettered();
                self.ack(delivery, Disposition::DeadLettered { queue }).await
            }
            Err(e) => {
                error!(queue = %self.queue, event = %event, error = %e, "Failed to dead-letter message");
                self.requeue(delivery).await
            }
        }
    }

    async fn ack(&self, delivery: Delivery, disposition: Disposition) -> Disposition {
        if let Err(e) = delivery.ack().await {
            // the broker redelivers it on the next connection
            warn!(queue = %self.queue, error = %e, "Failed to acknowledge message");
            return disposition;
        }
        match disposition {
            Disposition::Acked => self.metrics.record_acked(),
            Disposition::Dropped => self.metrics.record_dropped(),
            _ => {}
        }
        disposition
    }

    async fn requeue(&self, delivery: Delivery) -> Disposition {
        if let Err(e) = delivery.reject(true).await {
            warn!(queue = %self.queue, error = %e, "Failed to requeue message");
        }
        self.metrics.record_requeued();
        Disposition::Requeued
    }
}

#[async_trait]
impl QueueConsumer for ConsumerDispatcher {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn state(&self) -> &watch::Sender<ConsumerState> {
        &self.state
    }

    async fn on_delivery(&self, broker: &Arc<dyn Broker>, delivery: Delivery) {
        let disposition = self.process(broker.as_ref(), delivery).await;
        debug!(queue = %self.queue, disposition = ?disposition, "Delivery settled");
    }
}
