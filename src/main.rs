use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod infrastructure;
mod media;
mod modules;
mod queue;
mod routes;
mod state;
mod workers;

use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::connect_to_db;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::storage::s3::StorageService;
use crate::media::publisher::ArtifactPublisher;
use crate::media::transcoder::HlsTranscoder;
use crate::modules::lecture::repository::{LectureGateway, PgLectureGateway};
use crate::modules::lecture::service::LectureService;
use crate::queue::TranscodeQueue;
use crate::state::AppState;
use crate::workers::transcoder::TranscodeWorker;

#[tokio::main]
async fn main() {
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("❌ Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::new().context("invalid configuration")?;
    info!("Starting lecture pipeline (mode: {:?})...", config.mode);

    tokio::fs::create_dir_all(&config.worker.staging_dir)
        .await
        .with_context(|| format!("cannot create {}", config.worker.staging_dir.display()))?;
    tokio::fs::create_dir_all(&config.worker.work_dir)
        .await
        .with_context(|| format!("cannot create {}", config.worker.work_dir.display()))?;

    let db = connect_to_db(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    let lectures: Arc<dyn LectureGateway> = Arc::new(PgLectureGateway::new(db));

    let queue = TranscodeQueue::open(&config.redis_url, &config.rabbitmq_url)
        .await
        .context("failed to open the transcode queue")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("🛑 Shutdown requested");
            shutdown.cancel();
        }
    });

    let worker = if config.mode.runs_worker() {
        let storage = StorageService::new(
            &config.minio_url,
            &config.minio_bucket,
            &config.minio_access_key,
            &config.minio_secret_key,
            &config.minio_region,
            config.public_base_url.clone(),
        )
        .await;
        let publisher = ArtifactPublisher::new(Arc::new(storage), config.publish.clone());
        let transcoder = HlsTranscoder::new(config.transcode.clone());

        // Consuming runs on its own connection so a slow job never stalls publishing.
        let rabbit = RabbitMqService::new(&config.rabbitmq_url)
            .await
            .context("failed to connect the worker to RabbitMQ")?;

        let worker = TranscodeWorker::new(
            queue.ledger(),
            lectures.clone(),
            transcoder,
            publisher,
            config.worker.clone(),
        );
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            worker.run(rabbit.clone(), shutdown).await;
            rabbit.close().await;
        }))
    } else {
        None
    };

    if config.mode.runs_api() {
        let service = LectureService::new(
            lectures,
            queue.clone(),
            config.worker.staging_dir.clone(),
            config.max_upload_bytes,
        );
        let app = app::create_app(AppState::new(service, queue.clone()));

        let addr = format!("0.0.0.0:{}", config.server_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind {}", addr))?;
        info!("Server running on http://{}", addr);

        let api_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
            .context("server error")?;
    } else {
        shutdown.cancelled().await;
    }

    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    queue.close().await;
    info!("👋 Bye");
    Ok(())
}
