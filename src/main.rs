mod config;
mod error;
mod models;
mod pipeline;
mod services;
mod store;

use crate::config::Config;
use crate::pipeline::AppContext;
use crate::services::download::Downloader;
use crate::services::stt::build_stt;
use crate::services::tts::build_tts;
use crate::services::{AudioToolkit, BlobCache, LlmAdapter};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sifter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Connect to database
    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Connect to Redis (queue substrate)
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Connected to Redis");

    // Audio toolkit is mandatory for transcription and assembly.
    let audio = AudioToolkit::new(&config);
    if !audio.available().await {
        tracing::warn!(
            "ffmpeg not runnable at '{}'; transcription and assembly jobs will fail",
            config.ffmpeg_path
        );
    }

    if config.anthropic_api_key.is_none() && config.openai_api_key.is_none() {
        tracing::warn!("No LLM credentials configured; analysis and curation jobs will fail");
    }

    let ctx = Arc::new(AppContext {
        blobs: BlobCache::new(&config),
        downloader: Downloader::new(&config),
        stt: build_stt(&config),
        llm: Arc::new(LlmAdapter::new(&config)),
        tts: build_tts(&config),
        audio,
        redis,
        db,
        config,
    });

    // Boot the worker fleet.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = pipeline::spawn_workers(ctx, shutdown_rx);
    tracing::info!("Worker fleet started ({} queues)", workers.len());

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining workers");

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!("Worker task panicked: {}", e);
        }
    }
    tracing::info!("All workers drained, exiting");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
