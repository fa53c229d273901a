//! `POST /api/v1/webhook` — accepts an arbitrary alerting payload,
//! synthesizes a short investigation brief via an LLM call, and triggers
//! an ad-hoc session with that brief. Bearer-authenticated by the
//! `require_bearer_token` middleware layered in `server::create_app`.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, body::Bytes};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::Trigger;

use super::AppState;

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(20);
const SYSTEM_PROMPT: &str =
    "You are given a raw alerting webhook payload. Write a 2-4 sentence investigation brief for an on-call agent describing what appears to be wrong and which services are implicated. Do not include the word 'tier'.";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

pub async fn handle_webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty webhook body").into_response();
    }

    let raw = String::from_utf8_lossy(&body).to_string();

    // Optional `tier` field clamps the starting tier and is stripped
    // before synthesis so it never leaks into the brief.
    let (payload_for_synthesis, tier) = strip_tier_field(&raw);
    let start_tier = tier.unwrap_or(1).clamp(1, state.config.max_tier);

    let model = state.config.webhook_model.clone().unwrap_or_else(|| state.config.summarizer_model.clone());
    let brief = match synthesize_brief(&state.http_client, &model, &payload_for_synthesis).await {
        Some(b) => b,
        None => return (StatusCode::BAD_GATEWAY, "failed to synthesize investigation brief").into_response(),
    };

    match state.scheduler.trigger_ad_hoc(brief, start_tier, Trigger::Alert) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "triggered"}))).into_response(),
        Err(crate::error::SchedulerError::Busy) => {
            (StatusCode::ACCEPTED, Json(json!({"status": "acknowledged"}))).into_response()
        }
        Err(crate::error::SchedulerError::EmptyPrompt) => {
            (StatusCode::BAD_REQUEST, "synthesized brief was empty").into_response()
        }
    }
}

/// Extracts and removes a top-level `tier` field from a JSON body. Bodies
/// that aren't a JSON object (or aren't JSON at all) pass through
/// unchanged with no tier override.
fn strip_tier_field(raw: &str) -> (String, Option<u32>) {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return (raw.to_string(), None);
    };
    let Some(obj) = value.as_object_mut() else {
        return (raw.to_string(), None);
    };
    let tier = obj.remove("tier").and_then(|v| v.as_u64()).map(|v| v as u32);
    (serde_json::to_string(&value).unwrap_or_else(|_| raw.to_string()), tier)
}

async fn synthesize_brief(client: &reqwest::Client, model: &str, payload: &str) -> Option<String> {
    let api_base = std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".to_string());
    let api_key = std::env::var("ANTHROPIC_API_KEY").ok()?;

    let body = MessagesRequest {
        model,
        max_tokens: 300,
        system: SYSTEM_PROMPT,
        messages: vec![ChatMessage { role: "user", content: payload }],
    };

    let request = client
        .post(format!("{api_base}/v1/messages"))
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body);

    let response = match tokio::time::timeout(SYNTHESIS_TIMEOUT, request.send()).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "webhook brief synthesis request failed");
            return None;
        }
        Err(_) => {
            tracing::warn!("webhook brief synthesis timed out");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), "webhook brief synthesis returned non-success status");
        return None;
    }

    let parsed: MessagesResponse = response.json().await.ok()?;
    parsed.content.into_iter().find_map(|b| b.text).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_field_is_extracted_and_stripped() {
        let (payload, tier) = strip_tier_field(r#"{"service":"web","tier":2}"#);
        assert_eq!(tier, Some(2));
        assert!(!payload.contains("tier"));
        assert!(payload.contains("web"));
    }

    #[test]
    fn non_object_body_passes_through() {
        let (payload, tier) = strip_tier_field("plain text alert");
        assert_eq!(tier, None);
        assert_eq!(payload, "plain text alert");
    }
}
