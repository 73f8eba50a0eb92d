//! End-to-end flows over the in-memory broker.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use tranquara_relay::api::{self, AppState};
use tranquara_relay::bridge::SessionEnd;
use tranquara_relay::broker::{Broker, MemoryBroker, MemoryConnector, Message};
use tranquara_relay::config::{BridgeConfig, QueuesConfig};
use tranquara_relay::connection::{ConnectionError, RetryPolicy};
use tranquara_relay::consumer::DispatchPolicy;
use tranquara_relay::dead_letter::DeadLetterRouter;
use tranquara_relay::envelope;
use tranquara_relay::events::{self, EmotionLog, GuidanceRequest, GuidanceResponse, UserJournal};
use tranquara_relay::metrics::Metrics;
use tranquara_relay::shutdown::ShutdownSignal;
use tranquara_relay::store::MemoryStore;
use tranquara_relay::{
    Bridge, ConnectionManager, ConsumerDispatcher, HandlerTable, Publisher, ResponseRouter,
};

struct Stack {
    broker: MemoryBroker,
    store: Arc<MemoryStore>,
    bridge: Arc<Bridge>,
    app: Router,
    shutdown: ShutdownSignal,
}

fn bridge_config() -> BridgeConfig {
    BridgeConfig {
        timeout_secs: 5,
        orphan_requeue_delay_ms: 20,
    }
}

/// Everything `main` wires up, minus the TCP listener.
async fn stack() -> Stack {
    let broker = MemoryBroker::new();
    let queues = QueuesConfig::default();
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());
    let shutdown = ShutdownSignal::new();

    let connection = Arc::new(ConnectionManager::new(
        Arc::new(MemoryConnector::new(broker.clone())),
        RetryPolicy::default(),
        queues.declared(),
    ));
    connection.connect().await.unwrap();

    let dispatcher = Arc::new(ConsumerDispatcher::new(
        queues.sync.clone(),
        HandlerTable::write_back(store.clone()),
        DispatchPolicy {
            max_retries: 2,
            retry_backoff: Duration::from_millis(5),
        },
        DeadLetterRouter::default(),
        metrics.clone(),
    ));
    let responses = Arc::new(ResponseRouter::new(
        queues.responses.clone(),
        &bridge_config(),
        metrics.clone(),
    ));
    {
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(connection, shutdown).await });
    }
    {
        let responses = responses.clone();
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { responses.run(connection, shutdown).await });
    }

    let publisher = Arc::new(Publisher::new(
        connection.clone(),
        queues,
        Duration::from_secs(1),
        metrics.clone(),
    ));
    let bridge = Arc::new(Bridge::new(
        publisher.clone(),
        responses,
        connection.clone(),
        bridge_config().timeout(),
        metrics.clone(),
    ));
    let app = api::router(Arc::new(AppState {
        environment: "test".to_string(),
        api_key: None,
        connection,
        publisher,
        bridge: bridge.clone(),
        store: store.clone(),
        metrics,
    }));

    Stack {
        broker,
        store,
        bridge,
        app,
        shutdown,
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(3), wait).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

async fn send(broker: &MemoryBroker, queue: &str, body: Vec<u8>) {
    broker.publish(queue, Message::new(body)).await.unwrap();
}

fn guidance_request() -> GuidanceRequest {
    GuidanceRequest {
        current_week: 3,
        chatbot_interaction: "could not sleep".to_string(),
        emotion_tracking: "anxious".to_string(),
    }
}

fn reply(id: &str, tip: &str) -> Vec<u8> {
    let payload = GuidanceResponse {
        suggest_mindfulness_tip: tip.to_string(),
        explaination: "slows the heart rate".to_string(),
    };
    envelope::encode_correlated(events::GUIDANCE_RESPONSE, Utc::now(), Some(id), &payload).unwrap()
}

fn journal(id: Uuid) -> UserJournal {
    UserJournal {
        id,
        user_id: Uuid::new_v4(),
        collection_id: None,
        title: "Monday".to_string(),
        content: "Long day".to_string(),
        content_html: None,
        mood_score: Some(4),
        mood_label: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

#[tokio::test]
async fn test_journal_create_enqueues_one_index_task() {
    let s = stack().await;
    let user_id = Uuid::new_v4();

    let response = s
        .app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/journals")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"user_id": user_id, "title": "Monday", "content": "Long day"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let tasks = s.broker.published("ai_tasks");
    assert_eq!(tasks.len(), 1);
    let task = envelope::decode(&tasks[0].body).unwrap();
    assert_eq!(task.event, events::JOURNAL_INDEX);
    assert!(task.correlation_id.is_none());

    let payload: Value = serde_json::from_str(task.raw_payload()).unwrap();
    assert_eq!(payload["user_id"], json!(user_id));
    assert_eq!(payload["title"], "Monday");
    s.shutdown.trigger();
}

#[tokio::test]
async fn test_guidance_stream_only_sees_its_own_replies() {
    let s = stack().await;
    let stream = s.bridge.open(&guidance_request()).await.unwrap();
    let id = stream.correlation_id.clone();

    send(&s.broker, "ai_response", reply(&id, "box breathing")).await;
    send(&s.broker, "ai_response", reply("someone-else", "not yours")).await;
    send(&s.broker, "ai_response", reply(&id, "body scan")).await;
    let complete = envelope::encode_correlated(events::GUIDANCE_COMPLETE, Utc::now(), Some(&id), &json!({}));
    send(&s.broker, "ai_response", complete.unwrap()).await;

    let chunks: Vec<String> = tokio::time::timeout(
        Duration::from_secs(3),
        tokio_stream::wrappers::ReceiverStream::new(stream.chunks).collect(),
    )
    .await
    .unwrap();
    let tips: Vec<String> = chunks
        .iter()
        .map(|c| serde_json::from_str::<GuidanceResponse>(c).unwrap().suggest_mindfulness_tip)
        .collect();
    assert_eq!(tips, vec!["box breathing", "body scan"]);
    assert_eq!(stream.task.await.unwrap(), SessionEnd::Completed);

    // the stranger's reply keeps circulating for whoever owns it
    eventually("unclaimed reply requeued", || s.broker.requeued("ai_response") >= 1).await;
    assert!(s.broker.depth("ai_response") >= 1);
    assert_eq!(s.broker.acked("ai_response"), 3);
    s.shutdown.trigger();
}

#[tokio::test]
async fn test_client_disconnect_acknowledges_nothing() {
    let s = stack().await;
    let stream = s.bridge.open(&guidance_request()).await.unwrap();
    let id = stream.correlation_id.clone();
    drop(stream.chunks);

    let end = tokio::time::timeout(Duration::from_secs(1), stream.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(end, SessionEnd::ClientGone);
    assert_eq!(s.bridge.in_flight(), 0);

    // the request is over, so a late reply is dropped without being acknowledged
    send(&s.broker, "ai_response", reply(&id, "late tip")).await;
    eventually("late reply discarded", || s.broker.discarded("ai_response") == 1).await;
    assert_eq!(s.broker.acked("ai_response"), 0);
    assert_eq!(s.broker.depth("ai_response"), 0);
    s.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_keeps_api_up() {
    let broker = MemoryBroker::new();
    let connector = Arc::new(MemoryConnector::unreachable(broker.clone()));
    let queues = QueuesConfig::default();
    let metrics = Arc::new(Metrics::new());
    let connection = Arc::new(ConnectionManager::new(
        connector.clone(),
        RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(10),
        },
        queues.declared(),
    ));

    let result = connection.connect().await;
    assert!(matches!(
        result,
        Err(ConnectionError::Exhausted { attempts: 3, .. })
    ));
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(2));
    }

    let responses = Arc::new(ResponseRouter::new(
        queues.responses.clone(),
        &bridge_config(),
        metrics.clone(),
    ));
    let publisher = Arc::new(Publisher::new(
        connection.clone(),
        queues,
        Duration::from_secs(1),
        metrics.clone(),
    ));
    let bridge = Arc::new(Bridge::new(
        publisher.clone(),
        responses,
        connection.clone(),
        Duration::from_secs(5),
        metrics.clone(),
    ));
    let app = api::router(Arc::new(AppState {
        environment: "test".to_string(),
        api_key: None,
        connection,
        publisher,
        bridge,
        store: Arc::new(MemoryStore::new()),
        metrics,
    }));

    let response = app
        .oneshot(Request::builder().uri("/v1/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["broker"], "disconnected");
}

#[tokio::test]
async fn test_duplicate_journal_sync_is_stored_once() {
    let s = stack().await;
    let body = envelope::encode(events::USER_JOURNAL_CREATE, Utc::now(), &journal(Uuid::new_v4()))
        .unwrap();

    send(&s.broker, "sync_data", body.clone()).await;
    send(&s.broker, "sync_data", body).await;

    eventually("both deliveries acked", || s.broker.acked("sync_data") == 2).await;
    assert_eq!(s.store.journal_count(), 1);
    assert_eq!(s.broker.depth("sync_data"), 0);
    s.shutdown.trigger();
}

#[tokio::test]
async fn test_unknown_event_does_not_block_the_queue() {
    let s = stack().await;
    let log = EmotionLog {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        emotion: "calm".to_string(),
        source: "journal".to_string(),
        context: "after a walk".to_string(),
        created_at: Utc::now(),
    };

    send(
        &s.broker,
        "sync_data",
        envelope::encode("mood.forecast", Utc::now(), &json!({"days": 3})).unwrap(),
    )
    .await;
    send(
        &s.broker,
        "sync_data",
        envelope::encode(events::EMOTION_LOG_CREATE, Utc::now(), &log).unwrap(),
    )
    .await;

    eventually("emotion log stored", || s.store.emotion_log_count() == 1).await;
    eventually("both deliveries acked", || s.broker.acked("sync_data") == 2).await;
    assert!(s.broker.published("sync_data.dlq").is_empty());
    s.shutdown.trigger();
}
