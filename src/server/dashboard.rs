//! Dashboard polling + SSE routes and the ad-hoc trigger endpoint.
//!
//! Dashboard HTML/CSS rendering is an external collaborator (§1); these
//! handlers return JSON for the embedded `web/main.js` to poll, the way
//! the reference backend's `flow_routes`/`prompt_routes` return JSON for
//! its own frontend rather than server-rendered HTML fragments.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::http::StatusCode;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::hub::HubMessage;
use crate::store::{NewMemory, Store, Trigger};

use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/chain", get(get_chain))
        .route("/sessions/{id}/stream", get(stream_session))
        .route("/sessions/trigger", post(trigger))
        .route("/events", get(list_events))
        .route("/memories", get(list_memories).post(create_memory))
        .route("/memories/{id}", axum::routing::put(update_memory).delete(delete_memory))
        .route("/cooldowns", get(list_cooldowns))
}

async fn index() -> impl IntoResponse {
    match tokio::fs::read_to_string("web/index.html").await {
        Ok(html) => axum::response::Html(html).into_response(),
        Err(_) => (StatusCode::OK, axum::response::Html(include_str!("../../web/index.html"))).into_response(),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_sessions(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    match state.store.list_sessions(q.limit).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.get_session(id).await {
        Ok(session) => Json(session).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

async fn get_chain(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.get_escalation_chain(id).await {
        Ok(chain) => Json(chain).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `GET /sessions/{id}/stream` — replay buffer, then live lines, until
/// the `done` sentinel closes the stream. Terminator event is named
/// `done` per §6.
async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let hub = state.hub.clone();
    let stream = async_stream::stream! {
        let (replay, mut rx) = hub.subscribe(id).await;
        for line in replay {
            yield Ok(SseEvent::default().data(line));
        }
        while let Some(msg) = rx.recv().await {
            match msg {
                HubMessage::Line(line) => yield Ok(SseEvent::default().data(line)),
                HubMessage::Done => {
                    yield Ok(SseEvent::default().event("done").data(""));
                    break;
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Deserialize)]
struct TriggerBody {
    prompt: String,
    #[serde(default = "default_tier")]
    tier: u32,
}

fn default_tier() -> u32 {
    1
}

/// `POST /sessions/trigger` — 200 on accept, 409 on busy, 400 on empty
/// prompt.
async fn trigger(State(state): State<AppState>, Json(body): Json<TriggerBody>) -> impl IntoResponse {
    if body.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "prompt must not be empty").into_response();
    }
    let tier = body.tier.clamp(1, state.config.max_tier);
    match state.scheduler.trigger_ad_hoc(body.prompt, tier, Trigger::Manual) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "triggered"}))).into_response(),
        Err(crate::error::SchedulerError::Busy) => {
            (StatusCode::CONFLICT, Json(json!({"status": "busy"}))).into_response()
        }
        Err(crate::error::SchedulerError::EmptyPrompt) => {
            (StatusCode::BAD_REQUEST, "prompt must not be empty").into_response()
        }
    }
}

async fn list_events(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    match state.store.list_events(q.limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_memories(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    match state.store.list_memories(q.limit).await {
        Ok(memories) => Json(memories).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct NewMemoryBody {
    service: Option<String>,
    category: String,
    observation: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

/// Operator-facing CRUD, performed out-of-band from reinforcement
/// (§4.9): inserted with `originating_session_id = 0` and `tier = 0` to
/// mark it as operator-authored rather than LLM-observed.
async fn create_memory(State(state): State<AppState>, Json(body): Json<NewMemoryBody>) -> impl IntoResponse {
    let row = NewMemory {
        service: body.service,
        category: body.category,
        observation: body.observation,
        confidence: crate::store::clamp_confidence(body.confidence),
        originating_session_id: 0,
        tier: 0,
    };
    match state.store.insert_memory(row).await {
        Ok(id) => (StatusCode::CREATED, Json(json!({"id": id}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct UpdateMemoryBody {
    observation: String,
    confidence: f64,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

async fn update_memory(State(state): State<AppState>, Path(id): Path<i64>, Json(body): Json<UpdateMemoryBody>) -> impl IntoResponse {
    let confidence = crate::store::clamp_confidence(body.confidence);
    match state.store.update_memory(id, body.observation, confidence, body.active).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn delete_memory(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.delete_memory(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_cooldowns(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    match state.store.list_cooldown_actions(q.limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
