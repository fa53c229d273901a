//! Best-effort post-session summarization. Never allowed to affect
//! session finalization: every failure path logs and returns `None`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(20);
const SYSTEM_PROMPT: &str = "Summarize the following operations report in 2-4 sentences for an on-call engineer. Be concrete about what happened and whether action is needed.";

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

pub struct Summarizer {
    client: reqwest::Client,
    model: String,
    api_base: String,
}

impl Summarizer {
    pub fn new(client: reqwest::Client, model: String) -> Self {
        Self {
            client,
            model,
            api_base: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
        }
    }

    /// Returns `None` on any failure (network, auth, empty response,
    /// timeout) — the caller treats a missing summary as "not available
    /// yet", never as an error.
    pub async fn summarize(&self, response_text: &str) -> Option<String> {
        if response_text.trim().is_empty() {
            return None;
        }

        let api_key = std::env::var("ANTHROPIC_API_KEY").ok()?;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: 300,
            system: SYSTEM_PROMPT,
            messages: vec![ChatMessage { role: "user", content: response_text }],
        };

        let request = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);

        let result = tokio::time::timeout(SUMMARIZER_TIMEOUT, request.send()).await;

        let response = match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "summarizer request failed");
                return None;
            }
            Err(_) => {
                tracing::warn!("summarizer request timed out");
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "summarizer returned non-success status");
            return None;
        }

        let parsed: MessagesResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse summarizer response");
                return None;
            }
        };

        let text = parsed.content.into_iter().find_map(|b| b.text).map(|s| s.trim().to_string());
        match text {
            Some(t) if !t.is_empty() => Some(t),
            _ => {
                tracing::warn!("summarizer returned empty content");
                None
            }
        }
    }
}
