//! Outbound notification dispatch. Treated as a black-box sink per the
//! design: a single best-effort POST, never allowed to propagate failure.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CycleFailure,
    HumanAttention,
    Terminal,
}

#[derive(Serialize)]
struct NotificationBody<'a> {
    kind: NotificationKind,
    message: &'a str,
}

pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl Notifier {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    pub async fn notify(&self, kind: NotificationKind, message: &str) {
        let Some(url) = &self.url else {
            tracing::debug!(?kind, message, "no notify URL configured, dropping notification");
            return;
        };

        let body = NotificationBody { kind, message };
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), "notification endpoint returned non-success");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to deliver notification");
            }
            Ok(_) => {}
        }
    }
}
