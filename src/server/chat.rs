//! OpenAI-compatible bridge: `/v1/chat/completions` and `/v1/models`.
//!
//! Maps a chat request onto an ad-hoc escalation cycle and streams (or
//! blocks for) the resulting session's output reshaped as OpenAI chat
//! completion chunks/response, the way the reference backend's
//! `tasks/executors` adapts a `claude` stream into a different wire shape
//! for its own consumers.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::hub::HubMessage;
use crate::store::{SessionStatus, Store, Trigger};

use super::AppState;

const MODEL_ALIASES: &[&str] = &["claude-ops", "claude-ops-tier1", "claude-ops-tier2", "claude-ops-tier3"];

fn tier_for_alias(model: &str) -> u32 {
    match model {
        "claude-ops-tier1" => 1,
        "claude-ops-tier2" => 2,
        "claude-ops-tier3" => 3,
        "claude-ops" => 1,
        _ => 1,
    }
}

pub async fn list_models() -> impl IntoResponse {
    let data: Vec<serde_json::Value> = MODEL_ALIASES
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "claude-ops"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

#[derive(Deserialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAiError<'a> {
    error: OpenAiErrorBody<'a>,
}

#[derive(Serialize)]
struct OpenAiErrorBody<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
}

fn error_body(message: &str, kind: &str, code: &str) -> Json<OpenAiError<'_>> {
    Json(OpenAiError { error: OpenAiErrorBody { message, kind, code } })
}

pub async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> axum::response::Response {
    let Some(last_user) = req.messages.iter().rev().find(|m| m.role == "user") else {
        return (StatusCode::BAD_REQUEST, error_body("no user message found", "invalid_request_error", "missing_user_message"))
            .into_response();
    };

    let start_tier = tier_for_alias(&req.model).clamp(1, state.config.max_tier);

    if let Err(crate::error::SchedulerError::Busy) =
        state.scheduler.trigger_ad_hoc(last_user.content.clone(), start_tier, Trigger::Manual)
    {
        // §4.11: on busy, prefer a 200 assistant message over a hard error
        // so chat clients render something instead of a raw failure.
        return busy_response(req.stream);
    }

    let Some(session_id) = wait_for_new_running_session(&state).await else {
        return (StatusCode::BAD_GATEWAY, error_body("session did not start", "api_error", "session_start_failed")).into_response();
    };

    if req.stream {
        stream_as_sse(state, session_id).await.into_response()
    } else {
        block_for_completion(state, session_id).await.into_response()
    }
}

fn busy_response(stream: bool) -> axum::response::Response {
    let message = "claude-ops is currently busy running another session; try again shortly.";
    if stream {
        let chunk = openai_chunk(message, Some("stop"));
        let body = format!("data: {chunk}\n\ndata: [DONE]\n\n");
        (StatusCode::OK, [("content-type", "text/event-stream")], body).into_response()
    } else {
        (StatusCode::OK, Json(openai_completion(message, "stop"))).into_response()
    }
}

/// Mutual exclusion (§5) means at most one session is `running` at a
/// time, so the session the ad-hoc trigger just created can be found by
/// polling for the newest running row.
async fn wait_for_new_running_session(state: &AppState) -> Option<i64> {
    for _ in 0..50 {
        if let Ok(sessions) = state.store.list_sessions(1).await {
            if let Some(s) = sessions.first() {
                if s.status == SessionStatus::Running {
                    return Some(s.id);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

fn openai_chunk(content: &str, finish_reason: Option<&str>) -> serde_json::Value {
    json!({
        "object": "chat.completion.chunk",
        "model": "claude-ops",
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": content},
            "finish_reason": finish_reason,
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    })
}

fn openai_completion(content: &str, finish_reason: &str) -> serde_json::Value {
    json!({
        "object": "chat.completion",
        "model": "claude-ops",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason,
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    })
}

async fn stream_as_sse(state: AppState, session_id: i64) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let hub = state.hub.clone();
    let stream = async_stream::stream! {
        let (replay, mut rx) = hub.subscribe(session_id).await;
        for line in replay {
            yield Ok(SseEvent::default().data(to_chunk(&line).to_string()));
        }
        while let Some(msg) = rx.recv().await {
            match msg {
                HubMessage::Line(line) => yield Ok(SseEvent::default().data(to_chunk(&line).to_string())),
                HubMessage::Done => {
                    yield Ok(SseEvent::default().data(openai_chunk("", Some("stop")).to_string()));
                    yield Ok(SseEvent::default().data("[DONE]".to_string()));
                    break;
                }
            }
        }
    };
    Sse::new(stream)
}

/// A hub line prefixed `[tool_use:NAME]` becomes a `tool_calls` delta
/// rather than plain content, per §4.11.
fn to_chunk(line: &str) -> serde_json::Value {
    if let Some(rest) = line.strip_prefix("[tool_use:") {
        if let Some((name, args)) = rest.split_once(']') {
            return json!({
                "object": "chat.completion.chunk",
                "model": "claude-ops",
                "choices": [{
                    "index": 0,
                    "delta": {"tool_calls": [{"index": 0, "function": {"name": name, "arguments": args.trim()}}]},
                    "finish_reason": null,
                }],
            });
        }
    }
    openai_chunk(line, None)
}

async fn block_for_completion(state: AppState, session_id: i64) -> axum::response::Response {
    let hub = state.hub.clone();
    let (replay, mut rx) = hub.subscribe(session_id).await;
    let mut content = replay.join("\n");

    while let Some(msg) = rx.recv().await {
        match msg {
            HubMessage::Line(line) => {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(&line);
            }
            HubMessage::Done => break,
        }
    }

    Json(openai_completion(&content, "stop")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_for_alias_maps_explicit_tier_suffixes() {
        assert_eq!(tier_for_alias("claude-ops-tier1"), 1);
        assert_eq!(tier_for_alias("claude-ops-tier2"), 2);
        assert_eq!(tier_for_alias("claude-ops-tier3"), 3);
    }

    #[test]
    fn tier_for_alias_unknown_model_defaults_to_tier_one() {
        assert_eq!(tier_for_alias("claude-ops"), 1);
        assert_eq!(tier_for_alias("gpt-4"), 1);
    }

    #[test]
    fn to_chunk_plain_line_becomes_content_delta() {
        let chunk = to_chunk("investigating payments-api latency");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "investigating payments-api latency");
        assert!(chunk["choices"][0]["delta"].get("tool_calls").is_none());
    }

    #[test]
    fn to_chunk_tool_use_line_becomes_tool_calls_delta() {
        let chunk = to_chunk("[tool_use:Bash] {\"command\": \"curl healthcheck\"}");
        let call = &chunk["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "Bash");
        assert_eq!(call["function"]["arguments"], "{\"command\": \"curl healthcheck\"}");
    }

    #[test]
    fn to_chunk_malformed_tool_use_prefix_falls_back_to_content() {
        let chunk = to_chunk("[tool_use:Bash without closing bracket");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "[tool_use:Bash without closing bracket");
    }

    #[test]
    fn openai_chunk_has_zero_usage_counters() {
        let chunk = openai_chunk("hello", None);
        assert_eq!(chunk["usage"]["total_tokens"], 0);
        assert_eq!(chunk["choices"][0]["finish_reason"], serde_json::Value::Null);
    }
}
