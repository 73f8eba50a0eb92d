//! In-process broker.
//!
//! Mirrors the parts of RabbitMQ semantics the relay depends on: named
//! queues, FIFO delivery, manual acknowledgement, requeue to the head of the
//! queue, and redelivery of unacknowledged messages when the connection is
//! lost. It also records what happened on every queue so tests can assert on
//! acks, requeues and published messages.
//!
//! A [`MemoryBroker`] value is a handle to one connection of a shared broker.
//! [`MemoryBroker::disconnect`] drops the connection: every subscription ends
//! and every outstanding delivery handle becomes stale.

use super::{Acker, Broker, BrokerError, Connector, Delivery, Message, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Stored {
    message: Message,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    published: Vec<Message>,
    acked: u64,
    requeued: u64,
    discarded: u64,
}

#[derive(Debug)]
struct State {
    queues: HashMap<String, QueueState>,
    connected: bool,
    epoch: u64,
    next_tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    connected: bool,
    epoch: u64,
}

struct Shared {
    state: Mutex<State>,
    ready: Notify,
    status: watch::Sender<Status>,
}

/// Handle to one connection of an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    epoch: u64,
}

impl MemoryBroker {
    /// Create a broker with an open connection and no queues.
    pub fn new() -> Self {
        let status = Status {
            connected: true,
            epoch: 0,
        };
        let (status_tx, _) = watch::channel(status);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queues: HashMap::new(),
                    connected: true,
                    epoch: 0,
                    next_tag: 1,
                }),
                ready: Notify::new(),
                status: status_tx,
            }),
            epoch: 0,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self, state: &State) -> Result<(), BrokerError> {
        if state.connected && state.epoch == self.epoch {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    /// Simulate loss of the connection.
    ///
    /// Unacknowledged deliveries go back to the head of their queues, flagged
    /// as redelivered.
    pub fn disconnect(&self) {
        let mut state = self.state();
        if !state.connected {
            return;
        }
        state.connected = false;

        for queue in state.queues.values_mut() {
            let mut inflight: Vec<(u64, Stored)> = queue.unacked.drain().collect();
            inflight.sort_by_key(|(tag, _)| *tag);
            for (_, mut stored) in inflight.into_iter().rev() {
                stored.redelivered = true;
                queue.ready.push_front(stored);
            }
        }

        let status = Status {
            connected: false,
            epoch: state.epoch,
        };
        drop(state);

        debug!("memory broker connection dropped");
        self.shared.status.send_replace(status);
        self.shared.ready.notify_waiters();
    }

    /// Open a connection, reusing the current one if it is still up.
    pub fn open(&self) -> MemoryBroker {
        let mut state = self.state();
        if !state.connected {
            state.connected = true;
            state.epoch += 1;
            let status = Status {
                connected: true,
                epoch: state.epoch,
            };
            self.shared.status.send_replace(status);
        }

        MemoryBroker {
            shared: self.shared.clone(),
            epoch: state.epoch,
        }
    }

    /// Messages ever published to `queue`, in order.
    pub fn published(&self, queue: &str) -> Vec<Message> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    /// Ready plus unacknowledged messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.acked)
    }

    pub fn requeued(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.requeued)
    }

    pub fn discarded(&self, queue: &str) -> u64 {
        self.counter(queue, |q| q.discarded)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    fn counter(&self, queue: &str, read: impl Fn(&QueueState) -> u64) -> u64 {
        self.state().queues.get(queue).map(read).unwrap_or(0)
    }

    async fn next_delivery(&self, queue: &str) -> Option<Delivery> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.state();
                if self.check_open(&guard).is_err() {
                    return None;
                }

                let state = &mut *guard;
                let q = state.queues.get_mut(queue)?;
                if let Some(stored) = q.ready.pop_front() {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    q.unacked.insert(tag, stored.clone());

                    let acker = MemoryAcker {
                        broker: self.clone(),
                        queue: queue.to_string(),
                        tag,
                    };
                    return Some(Delivery::new(
                        queue,
                        stored.message.body,
                        stored.message.headers,
                        stored.redelivered,
                        Box::new(acker),
                    ));
                }
            }

            notified.await;
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        self.broker
            .check_open(&state)
            .map_err(|_| BrokerError::StaleDelivery)?;

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or(BrokerError::StaleDelivery)?;
        let mut stored = queue
            .unacked
            .remove(&self.tag)
            .ok_or(BrokerError::StaleDelivery)?;

        match requeue {
            None => queue.acked += 1,
            Some(true) => {
                stored.redelivered = true;
                queue.ready.push_front(stored);
                queue.requeued += 1;
                drop(state);
                self.broker.shared.ready.notify_waiters();
            }
            Some(false) => queue.discarded += 1,
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        self.check_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            self.check_open(&state)?;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            q.published.push(message.clone());
            q.ready.push_back(Stored {
                message,
                redelivered: false,
            });
        }
        self.shared.ready.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Subscription, BrokerError> {
        {
            let state = self.state();
            self.check_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
        }

        let stream = futures_util::stream::unfold(
            (self.clone(), queue.to_string()),
            |(broker, queue)| async move {
                let delivery = broker.next_delivery(&queue).await?;
                Some((Ok(delivery), (broker, queue)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn closed(&self) {
        let mut status = self.shared.status.subscribe();
        let epoch = self.epoch;
        let _ = status
            .wait_for(|s| !s.connected || s.epoch != epoch)
            .await;
    }

    fn is_open(&self) -> bool {
        let state = self.state();
        self.check_open(&state).is_ok()
    }
}

/// Connects to a [`MemoryBroker`], optionally refusing every attempt.
pub struct MemoryConnector {
    broker: MemoryBroker,
    reachable: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            reachable: AtomicBool::new(true),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// A connector whose broker refuses connections until
    /// [`set_reachable`](Self::set_reachable) is called.
    pub fn unreachable(broker: MemoryBroker) -> Self {
        let connector = Self::new(broker);
        connector.reachable.store(false, Ordering::SeqCst);
        connector
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// When each connection attempt was made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn address(&self) -> String {
        "memory://local".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect {
                address: self.address(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(Arc::new(self.broker.open()))
    }
}
