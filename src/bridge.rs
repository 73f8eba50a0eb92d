//! Synchronous Request/Response Bridge.
//!
//! Turns one HTTP request into a publish on the task queue followed by a
//! stream of replies from the shared response queue.
//!
//! ```text
//!  HTTP handler                 ResponseRouter (one per process)
//!  ────────────                 ─────────────────────────────────
//!  register(id) ───────────────► sessions[id] = inbox
//!  publish task {id}
//!                                ai_response ─► decode ─► sessions[id]?
//!  session task ◄── Routed ──────────────────────────┘        │ no
//!   ├─ write chunk, then ack                                   ▼
//!   ├─ client gone: reject(requeue)             reject(requeue) after a pause,
//!   └─ deadline / guidance.complete             or discard once expired
//!                                               or its session has finished
//! ```
//!
//! Registering before publishing means a reply can never arrive for an id the
//! router does not know yet. Replies are acknowledged only after their chunk
//! has been handed to the response body, so a client that disconnects never
//! causes a reply to be lost.
//!
//! The router hands replies to sessions without waiting. A session whose
//! inbox is full is ended, so a client that stops reading only loses its own
//! stream.

use crate::broker::{Broker, Delivery};
use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::consumer::{self, ConsumerState, QueueConsumer};
use crate::envelope::{self, RawEnvelope};
use crate::events::{self, GuidanceRequest, GuidanceResponse};
use crate::metrics::Metrics;
use crate::publisher::{PublishError, Publisher};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered replies per session
const SESSION_BUFFER: usize = 16;

/// Buffered chunks between a session and its HTTP response
const CHUNK_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("broker is disconnected")]
    Disconnected,

    #[error("failed to publish guidance task: {0}")]
    Publish(#[source] PublishError),
}

/// Why a session stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The worker sent `guidance.complete`
    Completed,
    ClientGone,
    TimedOut,
    /// The router stopped routing to this session
    Interrupted,
}

/// A reply routed to the session that owns its correlation id.
pub struct Routed {
    pub delivery: Delivery,
    pub envelope: RawEnvelope,
}

/// Consumes the response queue and routes each reply by correlation id.
pub struct ResponseRouter {
    queue: String,
    tag: String,
    sessions: Mutex<HashMap<String, mpsc::Sender<Routed>>>,
    /// Correlation ids this process served and has finished, with when
    finished: Mutex<HashMap<String, Instant>>,
    /// Replies older than this cannot have a waiting session anywhere
    expiry: Duration,
    orphan_delay: Duration,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConsumerState>,
}

impl ResponseRouter {
    pub fn new(queue: impl Into<String>, config: &BridgeConfig, metrics: Arc<Metrics>) -> Self {
        let queue = queue.into();
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            tag: consumer::consumer_tag(&queue),
            queue,
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            expiry: config.timeout(),
            orphan_delay: config.orphan_requeue_delay(),
            metrics,
            state,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<Routed>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start receiving replies for `correlation_id`.
    pub fn register(self: &Arc<Self>, correlation_id: &str) -> SessionInbox {
        let (sender, receiver) = mpsc::channel(SESSION_BUFFER);
        self.sessions().insert(correlation_id.to_string(), sender);
        debug!(correlation_id = %correlation_id, "Session registered");

        SessionInbox {
            correlation_id: correlation_id.to_string(),
            receiver,
            router: self.clone(),
        }
    }

    fn finished(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, correlation_id: &str) {
        if self.sessions().remove(correlation_id).is_some() {
            debug!(correlation_id = %correlation_id, "Session unregistered");
        }

        let now = Instant::now();
        let mut finished = self.finished();
        finished.retain(|_, at| now.duration_since(*at) <= self.expiry);
        finished.insert(correlation_id.to_string(), now);
    }

    /// Whether `correlation_id` belonged to a session of this process that has ended.
    fn has_finished(&self, correlation_id: &str) -> bool {
        self.finished()
            .get(correlation_id)
            .is_some_and(|at| at.elapsed() <= self.expiry)
    }

    /// Sessions currently waiting for replies.
    pub fn in_flight(&self) -> usize {
        self.sessions().len()
    }

    pub fn current_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Route one delivery from the response queue.
    pub async fn route(&self, delivery: Delivery) {
        let envelope = match envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dropping undecodable response");
                self.discard(delivery, true).await;
                return;
            }
        };

        let Some(correlation_id) = envelope.correlation_id.clone() else {
            warn!(
                queue = %self.queue,
                event = %envelope.event,
                "Dropping response without correlation id"
            );
            self.discard(delivery, true).await;
            return;
        };

        let session = self.sessions().get(&correlation_id).cloned();
        let routed = Routed { delivery, envelope };
        let Some(session) = session else {
            self.orphan(&correlation_id, routed).await;
            return;
        };

        // never wait on a session here, one stalled client would hold up every other
        match session.try_send(routed) {
            Ok(()) => {}
            Err(TrySendError::Full(routed)) => {
                warn!(
                    correlation_id = %correlation_id,
                    buffered = SESSION_BUFFER,
                    "Session is not keeping up with its replies, ending it"
                );
                self.unregister(&correlation_id);
                self.discard(routed.delivery, false).await;
            }
            Err(TrySendError::Closed(routed)) => self.orphan(&correlation_id, routed).await,
        }
    }

    /// A reply for a request this process is not serving.
    async fn orphan(&self, correlation_id: &str, routed: Routed) {
        if self.has_finished(correlation_id) {
            debug!(
                correlation_id = %correlation_id,
                "Discarding response for a finished session"
            );
            self.discard(routed.delivery, false).await;
            return;
        }

        let age = (Utc::now() - routed.envelope.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age > self.expiry {
            info!(
                correlation_id = %correlation_id,
                age_secs = age.as_secs(),
                "Discarding response for expired request"
            );
            self.discard(routed.delivery, false).await;
            return;
        }

        debug!(
            correlation_id = %correlation_id,
            "No local session for response, handing it back"
        );
        self.metrics.record_requeued();
        let delay = self.orphan_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = routed.delivery.reject(true).await {
                debug!(error = %e, "Failed to requeue unclaimed response");
            }
        });
    }

    async fn discard(&self, delivery: Delivery, ack: bool) {
        let result = if ack {
            delivery.ack().await
        } else {
            delivery.reject(false).await
        };
        if let Err(e) = result {
            warn!(queue = %self.queue, error = %e, "Failed to settle response");
        }
        self.metrics.record_dropped();
    }

    /// Consume the response queue until shutdown.
    pub async fn run(&self, connection: Arc<ConnectionManager>, shutdown: ShutdownSignal) {
        consumer::supervise(self, &connection, &shutdown).await;
    }
}

#[async_trait]
impl QueueConsumer for ResponseRouter {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn state(&self) -> &watch::Sender<ConsumerState> {
        &self.state
    }

    async fn on_delivery(&self, _broker: &Arc<dyn Broker>, delivery: Delivery) {
        self.route(delivery).await;
    }
}

/// Replies for one correlation id.
///
/// Dropping the inbox unregisters it. Call [`SessionInbox::close`] first so
/// buffered replies are handed back to the broker instead of waiting for the
/// connection to drop.
pub struct SessionInbox {
    correlation_id: String,
    receiver: mpsc::Receiver<Routed>,
    router: Arc<ResponseRouter>,
}

impl SessionInbox {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn recv(&mut self) -> Option<Routed> {
        self.receiver.recv().await
    }

    /// Stop receiving and requeue anything still buffered.
    pub async fn close(&mut self) {
        self.router.unregister(&self.correlation_id);
        self.receiver.close();

        while let Ok(routed) = self.receiver.try_recv() {
            if let Err(e) = routed.delivery.reject(true).await {
                debug!(error = %e, "Failed to requeue buffered response");
            }
        }
    }
}

impl Drop for SessionInbox {
    fn drop(&mut self) {
        self.router.unregister(&self.correlation_id);
    }
}

/// An open guidance stream.
pub struct BridgeStream {
    pub correlation_id: String,
    /// One JSON payload per reply; closes when the session ends
    pub chunks: mpsc::Receiver<String>,
    pub task: JoinHandle<SessionEnd>,
}

pub struct Bridge {
    publisher: Arc<Publisher>,
    router: Arc<ResponseRouter>,
    connection: Arc<ConnectionManager>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Bridge {
    pub fn new(
        publisher: Arc<Publisher>,
        router: Arc<ResponseRouter>,
        connection: Arc<ConnectionManager>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            publisher,
            router,
            connection,
            timeout,
            metrics,
        }
    }

    /// Requests currently streaming.
    pub fn in_flight(&self) -> usize {
        self.router.in_flight()
    }

    /// Publish a guidance task and start streaming its replies.
    pub async fn open(&self, request: &GuidanceRequest) -> Result<BridgeStream, BridgeError> {
        if !self.connection.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let mut inbox = self.router.register(&correlation_id);

        let tasks = self.publisher.queues().tasks.clone();
        if let Err(e) = self
            .publisher
            .publish_correlated(&tasks, events::GUIDANCE_REQUEST, &correlation_id, request)
            .await
        {
            inbox.close().await;
            return Err(match e {
                PublishError::Disconnected => BridgeError::Disconnected,
                e => BridgeError::Publish(e),
            });
        }

        info!(correlation_id = %correlation_id, "Guidance task published");

        let (chunks_tx, chunks) = mpsc::channel(CHUNK_BUFFER);
        let task = tokio::spawn(run_session(
            inbox,
            chunks_tx,
            self.timeout,
            self.metrics.clone(),
        ));

        Ok(BridgeStream {
            correlation_id,
            chunks,
            task,
        })
    }
}

async fn run_session(
    mut inbox: SessionInbox,
    chunks: mpsc::Sender<String>,
    timeout: Duration,
    metrics: Arc<Metrics>,
) -> SessionEnd {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut streamed = 0u32;

    let end = loop {
        let routed = tokio::select! {
            biased;
            _ = chunks.closed() => break SessionEnd::ClientGone,
            _ = &mut deadline => break SessionEnd::TimedOut,
            routed = inbox.recv() => routed,
        };

        let Some(Routed { delivery, envelope }) = routed else {
            break SessionEnd::Interrupted;
        };

        if envelope.event == events::GUIDANCE_COMPLETE {
            if let Err(e) = delivery.ack().await {
                warn!(correlation_id = %inbox.correlation_id(), error = %e, "Failed to acknowledge completion");
            }
            break SessionEnd::Completed;
        }

        if let Err(e) = envelope.decode_payload::<GuidanceResponse>() {
            warn!(
                correlation_id = %inbox.correlation_id(),
                event = %envelope.event,
                error = %e,
                "Skipping malformed guidance response"
            );
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "Failed to acknowledge malformed response");
            }
            metrics.record_dropped();
            continue;
        }

        let chunk = envelope.raw_payload().to_string();
        let sent = tokio::select! {
            sent = chunks.send(chunk) => sent.is_ok(),
            _ = &mut deadline => {
                requeue(delivery).await;
                break SessionEnd::TimedOut;
            }
        };

        if !sent {
            requeue(delivery).await;
            break SessionEnd::ClientGone;
        }

        match delivery.ack().await {
            Ok(()) => {
                streamed += 1;
                metrics.record_streamed();
            }
            Err(e) => warn!(
                correlation_id = %inbox.correlation_id(),
                error = %e,
                "Failed to acknowledge streamed response"
            ),
        }
    };

    inbox.close().await;
    info!(
        correlation_id = %inbox.correlation_id(),
        streamed,
        end = ?end,
        "Guidance stream finished"
    );
    end
}

async fn requeue(delivery: Delivery) {
    if let Err(e) = delivery.reject(true).await {
        debug!(error = %e, "Failed to requeue response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryConnector, Message};
    use crate::config::QueuesConfig;
    use crate::connection::RetryPolicy;
    use futures_util::StreamExt;

    struct Harness {
        broker: MemoryBroker,
        router: Arc<ResponseRouter>,
        bridge: Bridge,
        shutdown: ShutdownSignal,
    }

    async fn harness(timeout_secs: u64) -> Harness {
        let broker = MemoryBroker::new();
        let queues = QueuesConfig::default();
        let metrics = Arc::new(Metrics::new());
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(MemoryConnector::new(broker.clone())),
            RetryPolicy::default(),
            queues.declared(),
        ));
        connection.connect().await.unwrap();

        let config = BridgeConfig {
            timeout_secs,
            orphan_requeue_delay_ms: 20,
        };
        let router = Arc::new(ResponseRouter::new(
            queues.responses.clone(),
            &config,
            metrics.clone(),
        ));
        let publisher = Arc::new(Publisher::new(
            connection.clone(),
            queues,
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let bridge = Bridge::new(
            publisher,
            router.clone(),
            connection.clone(),
            config.timeout(),
            metrics,
        );

        let shutdown = ShutdownSignal::new();
        {
            let router = router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { router.run(connection, shutdown).await });
        }

        Harness {
            broker,
            router,
            bridge,
            shutdown,
        }
    }

    fn request() -> GuidanceRequest {
        GuidanceRequest {
            current_week: 2,
            chatbot_interaction: "felt stuck".to_string(),
            emotion_tracking: "tired".to_string(),
        }
    }

    fn tip(n: u32) -> GuidanceResponse {
        GuidanceResponse {
            suggest_mindfulness_tip: format!("tip {}", n),
            explaination: "because".to_string(),
        }
    }

    async fn reply<P: serde::Serialize>(broker: &MemoryBroker, id: &str, event: &str, payload: &P) {
        let body = envelope::encode_correlated(event, Utc::now(), Some(id), payload).unwrap();
        broker
            .publish("ai_response", Message::new(body))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_task_carries_correlation_id() {
        let h = harness(5).await;
        let stream = h.bridge.open(&request()).await.unwrap();

        let tasks = h.broker.published("ai_tasks");
        assert_eq!(tasks.len(), 1);
        let task = envelope::decode(&tasks[0].body).unwrap();
        assert_eq!(task.event, events::GUIDANCE_REQUEST);
        assert_eq!(task.correlation_id.as_deref(), Some(stream.correlation_id.as_str()));
        assert_eq!(task.decode_payload::<GuidanceRequest>().unwrap(), request());
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_streams_until_complete() {
        let h = harness(5).await;
        let mut stream = h.bridge.open(&request()).await.unwrap();
        let id = stream.correlation_id.clone();

        reply(&h.broker, &id, events::GUIDANCE_RESPONSE, &tip(1)).await;
        reply(&h.broker, &id, events::GUIDANCE_RESPONSE, &tip(2)).await;
        reply(&h.broker, &id, events::GUIDANCE_COMPLETE, &serde_json::json!({})).await;

        let first: GuidanceResponse =
            serde_json::from_str(&stream.chunks.recv().await.unwrap()).unwrap();
        let second: GuidanceResponse =
            serde_json::from_str(&stream.chunks.recv().await.unwrap()).unwrap();
        assert_eq!(first, tip(1));
        assert_eq!(second, tip(2));
        assert!(stream.chunks.recv().await.is_none());

        assert_eq!(stream.task.await.unwrap(), SessionEnd::Completed);
        assert_eq!(h.broker.acked("ai_response"), 3);
        assert_eq!(h.router.in_flight(), 0);
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_times_out_without_replies() {
        let h = harness(1).await;
        let stream = h.bridge.open(&request()).await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), stream.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::TimedOut);
        assert_eq!(h.router.in_flight(), 0);
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_malformed_reply_is_skipped() {
        let h = harness(5).await;
        let mut stream = h.bridge.open(&request()).await.unwrap();
        let id = stream.correlation_id.clone();

        reply(&h.broker, &id, events::GUIDANCE_RESPONSE, &serde_json::json!({"tip": 1})).await;
        reply(&h.broker, &id, events::GUIDANCE_RESPONSE, &tip(1)).await;

        let chunk: GuidanceResponse =
            serde_json::from_str(&stream.chunks.recv().await.unwrap()).unwrap();
        assert_eq!(chunk, tip(1));
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_expired_orphan_is_discarded() {
        let h = harness(5).await;
        let stale = envelope::encode_correlated(
            events::GUIDANCE_RESPONSE,
            Utc::now() - chrono::Duration::minutes(10),
            Some("gone"),
            &tip(1),
        )
        .unwrap();
        h.broker
            .publish("ai_response", Message::new(stale))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.discarded("ai_response") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.broker.depth("ai_response"), 0);
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_hold_up_other_sessions() {
        let h = harness(5).await;
        // never read from
        let stalled = h.bridge.open(&request()).await.unwrap();
        let mut active = h.bridge.open(&request()).await.unwrap();

        for n in 0..40 {
            reply(&h.broker, &stalled.correlation_id, events::GUIDANCE_RESPONSE, &tip(n)).await;
        }
        reply(&h.broker, &active.correlation_id, events::GUIDANCE_RESPONSE, &tip(99)).await;

        let chunk = tokio::time::timeout(Duration::from_secs(2), active.chunks.recv())
            .await
            .expect("active session starved by a stalled one")
            .unwrap();
        let chunk: GuidanceResponse = serde_json::from_str(&chunk).unwrap();
        assert_eq!(chunk, tip(99));

        assert!(h.broker.discarded("ai_response") >= 1);
        assert_eq!(h.router.in_flight(), 1);
        drop(stalled);
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_reply_for_finished_session_is_discarded() {
        let h = harness(5).await;
        let stream = h.bridge.open(&request()).await.unwrap();
        let id = stream.correlation_id.clone();

        reply(&h.broker, &id, events::GUIDANCE_COMPLETE, &serde_json::json!({})).await;
        assert_eq!(stream.task.await.unwrap(), SessionEnd::Completed);

        reply(&h.broker, &id, events::GUIDANCE_RESPONSE, &tip(1)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.discarded("ai_response") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.broker.depth("ai_response"), 0);
        assert_eq!(h.broker.requeued("ai_response"), 0);
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_acked() {
        let h = harness(5).await;
        h.broker
            .publish("ai_response", Message::new(b"garbage".to_vec()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.acked("ai_response") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_close_requeues_buffered_replies() {
        let broker = MemoryBroker::new();
        broker.declare_queue("ai_response").await.unwrap();
        let router = Arc::new(ResponseRouter::new(
            "ai_response",
            &BridgeConfig::default(),
            Arc::new(Metrics::new()),
        ));

        let mut inbox = router.register("abc");
        reply(&broker, "abc", events::GUIDANCE_RESPONSE, &tip(1)).await;

        let mut sub = broker.consume("ai_response", "t").await.unwrap();
        router.route(sub.next().await.unwrap().unwrap()).await;
        assert_eq!(broker.unacked("ai_response"), 1);

        inbox.close().await;
        assert_eq!(router.in_flight(), 0);
        assert_eq!(broker.requeued("ai_response"), 1);
        assert_eq!(broker.acked("ai_response"), 0);
    }
}
