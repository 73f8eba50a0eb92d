//! HTTP surface.
//!
//! ```text
//! GET    /v1/healthcheck          always 200, reports broker state
//! GET    /v1/metrics
//! POST   /v1/provide_guidence     text/event-stream of guidance chunks
//! POST   /v1/journals             201, then journal.index (best effort)
//! GET    /v1/journals/{id}
//! DELETE /v1/journals/{id}        204, then journal.delete (best effort)
//! ```
//!
//! When `server.api_key` is set every route except the healthcheck requires
//! `Authorization: Bearer <api_key>`.

use crate::bridge::{Bridge, BridgeError};
use crate::connection::ConnectionManager;
use crate::events::{GuidanceRequest, UserJournal};
use crate::metrics::{format_uptime, Metrics};
use crate::publisher::Publisher;
use crate::store::{DataStore, Inserted, StoreError};
use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEALTHCHECK_PATH: &str = "/v1/healthcheck";

pub struct AppState {
    pub environment: String,
    pub api_key: Option<String>,
    pub connection: Arc<ConnectionManager>,
    pub publisher: Arc<Publisher>,
    pub bridge: Arc<Bridge>,
    pub store: Arc<dyn DataStore>,
    pub metrics: Arc<Metrics>,
}

/// Errors returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid or missing authentication token")]
    Unauthorized,

    #[error("the requested resource could not be found")]
    NotFound,

    #[error("{0}")]
    Unavailable(String),

    #[error("the server encountered a problem and could not process your request")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::Unavailable(reason) => {
                error!(reason = %reason, "Store unavailable");
                ApiError::Unavailable("the data store is unavailable".to_string())
            }
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Disconnected => {
                ApiError::Unavailable("the guidance service is unavailable".to_string())
            }
            BridgeError::Publish(e) => {
                error!(error = %e, "Failed to start guidance stream");
                ApiError::Internal
            }
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTHCHECK_PATH, get(health_check))
        .route("/v1/metrics", get(get_metrics))
        .route("/v1/provide_guidence", post(provide_guidance))
        .route("/v1/journals", post(create_journal))
        .route("/v1/journals/{id}", get(show_journal).delete(delete_journal))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == HEALTHCHECK_PATH {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API key attempt");
            Err(ApiError::Unauthorized)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(ApiError::Unauthorized)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let broker = if state.connection.is_connected() {
        "connected"
    } else {
        "disconnected"
    };

    Json(json!({
        "status": "available",
        "environment": state.environment,
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker,
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.metrics.snapshot();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": snapshot.uptime_seconds,
        "uptime": format_uptime(snapshot.uptime_seconds),
        "broker": {
            "connected": state.connection.is_connected(),
            "generation": state.connection.link().generation(),
        },
        "messages": snapshot,
        "guidance_in_flight": state.bridge.in_flight(),
    }))
}

async fn provide_guidance(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GuidanceRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(request) = body?;
    debug!(current_week = request.current_week, "Guidance requested");

    let stream = state.bridge.open(&request).await?;
    info!(correlation_id = %stream.correlation_id, "Streaming guidance");

    let events = ReceiverStream::new(stream.chunks)
        .map(|chunk| Ok::<_, Infallible>(Event::default().data(chunk)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Body of `POST /v1/journals`.
#[derive(Debug, Deserialize)]
pub struct NewJournal {
    pub user_id: Uuid,
    #[serde(default)]
    pub collection_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub content_html: Option<String>,
    #[serde(default)]
    pub mood_score: Option<i32>,
    #[serde(default)]
    pub mood_label: Option<String>,
}

impl NewJournal {
    fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() {
            return Err(ApiError::BadRequest("title must be provided".to_string()));
        }
        if let Some(score) = self.mood_score {
            if !(1..=10).contains(&score) {
                return Err(ApiError::BadRequest(
                    "mood_score must be between 1 and 10".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn into_journal(self) -> UserJournal {
        UserJournal {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            collection_id: self.collection_id,
            title: self.title,
            content: self.content,
            content_html: self.content_html,
            mood_score: self.mood_score,
            mood_label: self.mood_label,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

async fn create_journal(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewJournal>, JsonRejection>,
) -> Result<(StatusCode, Json<UserJournal>), ApiError> {
    let Json(new_journal) = body?;
    new_journal.validate()?;

    let journal = new_journal.into_journal();
    if state.store.insert_journal(&journal).await? == Inserted::AlreadyExists {
        // ids are generated above, so this only happens on a uuid collision
        return Err(ApiError::Internal);
    }
    info!(journal_id = %journal.id, user_id = %journal.user_id, "Journal created");

    state.publisher.index_journal(&journal).await;
    Ok((StatusCode::CREATED, Json(journal)))
}

async fn show_journal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserJournal>, ApiError> {
    Ok(Json(state.store.get_journal(id).await?))
}

async fn delete_journal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let journal = state.store.delete_journal(id).await?;
    info!(journal_id = %id, "Journal deleted");

    state.publisher.forget_journal(journal.id, journal.user_id).await;
    Ok(StatusCode::NO_CONTENT)
}
