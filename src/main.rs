//! Knowledge-Graph Builder Server
//!
//! Entry point: loads configuration, connects the store, starts the three
//! pipeline schedulers and serves the HTTP API.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::map_err_ignore)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kg_builder::config::{AppConfig, load_llm_settings};
use kg_builder::kg::embedding::build_embedder;
use kg_builder::kg::persistence::KgStore;
use kg_builder::kg::{KgService, telemetry};
use kg_builder::llm::build_model;
use kg_builder::server::start_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before anything reads the environment.
    let _ = dotenv();

    telemetry::init();

    let config = Arc::new(AppConfig::load().context("failed to load configuration")?);

    let settings = load_llm_settings().map_err(|msg| anyhow::anyhow!("Configuration error: {msg}"))?;
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let model = build_model(settings, Duration::from_secs(config.llm.request_timeout_secs))?;
    let embedder = build_embedder(&config.embedding)?;
    let store = KgStore::connect(&config.store)
        .await
        .context("failed to connect to SurrealDB")?;

    let service = KgService::new(&config, store, model, embedder);

    if config.scheduler.housekeeping_on_start {
        match service.startup_housekeeping().await {
            Ok(report) => info!(?report, "Startup housekeeping done"),
            Err(e) => warn!(error = %e, "Startup housekeeping failed"),
        }
    }

    let shutdown = CancellationToken::new();
    let handles = service.spawn(&shutdown);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    let served = start_server(Arc::clone(&config), service, shutdown.clone()).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    served
}
