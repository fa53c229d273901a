pub mod chat;
pub mod dashboard;
pub mod middleware;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::hub::SharedHub;
use crate::scheduler::Scheduler;
use crate::store::Store;

/// Everything a route handler needs, cloned per-request (all fields are
/// `Arc`s or otherwise cheap to clone), matching the reference backend's
/// `AppState` shape.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub hub: SharedHub,
    pub scheduler: Scheduler,
    pub http_client: reqwest::Client,
    /// SHA-256 digest of the configured bearer token, cached once at
    /// startup. `None` means no token is configured, in which case
    /// bearer-protected routes return 503 rather than passing through.
    pub chat_bearer_hash: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        hub: SharedHub,
        scheduler: Scheduler,
        http_client: reqwest::Client,
    ) -> Self {
        let chat_bearer_hash = config.chat_bearer_token.as_deref().map(|token| {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(token.as_bytes());
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        });

        Self { config, store, hub, scheduler, http_client, chat_bearer_hash }
    }
}

pub fn create_app(state: AppState, static_dir: &std::path::Path) -> Router {
    let protected = Router::new()
        .route("/api/v1/webhook", axum::routing::post(webhook::handle_webhook))
        .route("/v1/chat/completions", axum::routing::post(chat::chat_completions))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_bearer_token));

    Router::new()
        .merge(dashboard::router())
        .route("/v1/models", axum::routing::get(chat::list_models))
        .merge(protected)
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
