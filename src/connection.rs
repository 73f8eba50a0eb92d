//! Connection Manager.
//!
//! Owns the one broker connection of the process. Components never hold the
//! connection directly; they ask the manager for the current [`Link`] or
//! subscribe to changes of it.
//!
//! # Lifecycle
//!
//! ```text
//!              connect() ok
//! Disconnected ─────────────────► Connected { generation: n }
//!      ▲                                   │
//!      │   closed() / report_lost(n)       │
//!      └───────────────────────────────────┘
//! ```
//!
//! Every successful connect declares the well-known queues and bumps the
//! generation. Consumers watch the generation to know when to re-register,
//! because deliveries and subscriptions from an older generation are dead.
//!
//! Failing to connect is never fatal: the manager stays `Disconnected`,
//! publishes fail fast, and [`ConnectionManager::supervise`] keeps retrying
//! in the background.

use crate::broker::{Broker, BrokerError, Connector};
use crate::shutdown::ShutdownSignal;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker unreachable after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// How hard to try when dialing the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Dial attempts per connect cycle
    pub max_attempts: u32,
    /// Pause between attempts within one cycle
    pub retry_delay: Duration,
    /// Pause between cycles while running disconnected
    pub reconnect_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// State of the process' broker connection.
#[derive(Clone)]
pub enum Link {
    Disconnected,
    Connected {
        broker: Arc<dyn Broker>,
        generation: u64,
    },
}

impl Link {
    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        match self {
            Link::Connected { broker, .. } => Some(broker),
            Link::Disconnected => None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            Link::Connected { generation, .. } => Some(*generation),
            Link::Disconnected => None,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Disconnected => f.write_str("Disconnected"),
            Link::Connected { generation, .. } => f
                .debug_struct("Connected")
                .field("generation", generation)
                .finish(),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    /// Declared on every connect
    queues: Vec<String>,
    link: watch::Sender<Link>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy, queues: Vec<String>) -> Self {
        let (link, _) = watch::channel(Link::Disconnected);
        Self {
            connector,
            policy,
            queues,
            link,
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one connect cycle.
    ///
    /// Dials up to `max_attempts` times, sleeping `retry_delay` between
    /// attempts. On success the queues are declared and the new connection
    /// becomes the current [`Link`].
    pub async fn connect(&self) -> Result<Arc<dyn Broker>, ConnectionError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let address = self.connector.address();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            debug!(address = %address, attempt, max_attempts, "Connecting to broker");

            match self.try_connect().await {
                Ok(broker) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.link.send_replace(Link::Connected {
                        broker: broker.clone(),
                        generation,
                    });
                    info!(
                        address = %address,
                        attempt,
                        generation,
                        queues = ?self.queues,
                        "Connected to broker"
                    );
                    return Ok(broker);
                }
                Err(e) => {
                    warn!(
                        address = %address,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        let source = last_error.unwrap_or(BrokerError::Disconnected);
        error!(
            address = %address,
            attempts = max_attempts,
            "Giving up on broker, running disconnected"
        );
        Err(ConnectionError::Exhausted {
            attempts: max_attempts,
            source,
        })
    }

    async fn try_connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = self.connector.connect().await?;
        for queue in &self.queues {
            broker.declare_queue(queue).await?;
        }
        Ok(broker)
    }

    pub fn link(&self) -> Link {
        self.link.borrow().clone()
    }

    /// The open connection, if any.
    pub fn current(&self) -> Option<Arc<dyn Broker>> {
        match &*self.link.borrow() {
            Link::Connected { broker, .. } if broker.is_open() => Some(broker.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Watch the link. Receivers see every change of generation.
    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.link.subscribe()
    }

    /// Mark connection `generation` as lost.
    ///
    /// Ignored if a newer connection is already in place.
    pub fn report_lost(&self, generation: u64) {
        let replaced = self.link.send_if_modified(|link| {
            if link.generation() != Some(generation) {
                return false;
            }
            *link = Link::Disconnected;
            true
        });

        if replaced {
            warn!(generation, "Broker connection lost");
        }
    }

    /// Keep the process connected until shutdown.
    ///
    /// While connected, waits for the connection to close. While
    /// disconnected, runs a connect cycle every `reconnect_interval`.
    pub async fn supervise(&self, shutdown: ShutdownSignal) {
        info!(
            reconnect_interval = ?self.policy.reconnect_interval,
            "Connection supervisor started"
        );

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            match self.link() {
                Link::Connected { broker, generation } => {
                    let mut changes = self.link.subscribe();
                    let replaced = async {
                        let _ = changes
                            .wait_for(|link| link.generation() != Some(generation))
                            .await;
                    };

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = broker.closed() => self.report_lost(generation),
                        _ = replaced => {}
                    }
                }
                Link::Disconnected => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.connect() => {
                            if result.is_ok() {
                                continue;
                            }
                        }
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.policy.reconnect_interval) => {}
                    }
                }
            }
        }

        info!("Connection supervisor stopped");
    }
}
