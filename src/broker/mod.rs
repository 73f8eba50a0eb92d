//! Broker transport seam.
//!
//! The rest of the crate talks to the message broker only through the
//! [`Broker`] and [`Connector`] traits. Two implementations ship with the
//! crate:
//!
//! - [`amqp`]: RabbitMQ over AMQP 0-9-1 (production)
//! - [`memory`]: an in-process broker with the same ack/requeue semantics,
//!   used by tests and local development
//!
//! A [`Delivery`] must be settled with exactly one of [`Delivery::ack`] or
//! [`Delivery::reject`]. Both consume the delivery. A delivery that is dropped
//! without being settled stays unacknowledged until its connection goes away,
//! at which point the broker redelivers it.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub use amqp::{AmqpBroker, AmqpConnector};
pub use memory::{MemoryBroker, MemoryConnector};

/// Number of times a delivery has already been retried by the dispatcher
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Why a message ended up in a dead-letter queue
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// Queue a dead-lettered message was originally consumed from
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";

/// RFC 3339 time at which a message was dead-lettered
pub const FAILED_AT_HEADER: &str = "x-failed-at";

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("broker connection is closed")]
    Disconnected,

    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("broker did not confirm publish to '{0}'")]
    Unconfirmed(String),

    #[error("delivery handle is no longer valid")]
    StaleDelivery,

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// A message handed to the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One received instance of a message.
pub struct Delivery {
    /// Queue the delivery was consumed from
    pub queue: String,

    pub body: Vec<u8>,

    pub headers: BTreeMap<String, String>,

    /// Set when the broker delivered this message before
    pub redelivered: bool,

    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers,
            redelivered,
            acker,
        }
    }

    /// Retries already spent on this message, from [`RETRY_COUNT_HEADER`].
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Copy of the message for republishing.
    pub fn to_message(&self) -> Message {
        Message {
            body: self.body.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Remove the message from its queue.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Hand the message back to the broker, or discard it when `requeue` is false.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("bytes", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Deliveries from one consumer registration, in broker order.
///
/// The stream ends when the underlying connection or channel is lost.
pub type Subscription = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// An open connection and channel to the broker.
///
/// Implementations must be safe to share between the publisher, every
/// consumer and every in-flight bridge request.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue if it does not exist yet.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Send a message to a queue through the default exchange.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, BrokerError>;

    /// Resolves once this connection is lost or closed.
    async fn closed(&self);

    fn is_open(&self) -> bool;
}

/// Dials the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address for logs, with credentials removed.
    fn address(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Strip `user:pass@` from a broker URL.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
