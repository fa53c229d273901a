mod config;
mod error;
mod escalation;
mod handoff;
mod hub;
mod memory;
mod notify;
mod redact;
mod scheduler;
mod server;
mod store;
mod stream_parser;
mod summarizer;
mod tier_runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;
use crate::escalation::EscalationDriver;
use crate::hub::Hub;
use crate::memory::MemoryEngine;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::store::{SqliteStore, Store};
use crate::summarizer::Summarizer;
use crate::tier_runner::TierRunner;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("claude_ops=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .init();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    self_check(&config).context("startup self-check failed")?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store_path()).context("failed to open store")?);
    let hub = Arc::new(Hub::default());
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let memory = Arc::new(MemoryEngine::new(store.clone(), config.memory_budget_chars));
    let summarizer = Arc::new(Summarizer::new(http_client.clone(), config.summarizer_model.clone()));
    let notifier = Arc::new(Notifier::new(http_client.clone(), config.notify_url.clone()));
    let tier_runner = Arc::new(TierRunner::new(config.clone(), store.clone(), hub.clone(), memory.clone(), summarizer));
    let driver = Arc::new(EscalationDriver::new(config.clone(), store.clone(), memory, tier_runner, notifier.clone()));

    let (scheduler, trigger_rx) = Scheduler::new();
    let cancel = CancellationToken::new();

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let interval = config.interval;
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            scheduler.run(trigger_rx, interval, driver, notifier, cancel).await;
        })
    };

    let state = server::AppState::new(config.clone(), store, hub, scheduler, http_client);
    let app = server::create_app(state, std::path::Path::new("web"));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "claude-ops listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received, draining");
            shutdown_cancel.cancel();
        })
        .await
        .context("server error")?;

    // Scheduler's own cancellation is a child of `cancel`, already fired
    // above; give the in-flight cycle (if any) the configured grace
    // period to finish tearing down its subprocess before the process
    // exits and the store connection drops.
    let _ = tokio::time::timeout(config.shutdown_grace, scheduler_task).await;

    Ok(())
}

/// Fails fast on a misconfigured environment rather than accepting
/// requests it can't actually service: the `claude` binary must be
/// reachable and the working directories must exist.
fn self_check(config: &Config) -> Result<()> {
    let found = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                dir.join("claude").is_file() || dir.join("claude.exe").is_file()
            })
        })
        .unwrap_or(false);
    if !found {
        anyhow::bail!("`claude` binary not found on PATH");
    }

    for dir in [&config.state_dir, &config.results_dir, &config.repos_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    Ok(())
}
