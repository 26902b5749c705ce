use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod middleware;
mod modules;
mod routes;
mod state;
mod supervisor;
mod workers;

use config::settings::AppConfig;
use infrastructure::db::pool::{connect_to_db, run_migrations};
use infrastructure::queue::rabbitmq::RabbitMqService;
use infrastructure::queue::topology::TopologySettings;
use infrastructure::redis::client::RedisService;
use modules::transcode::repository::PgJobRepository;
use modules::transcode::service::JobService;
use supervisor::{ProcessSupervisor, SupervisorLimits};
use workers::WorkerContext;
use workers::encoder::HlsEncoder;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    info!("Starting server...");
    let config = AppConfig::new().context("Missing required environment variable")?;
    let settings = Arc::new(config.transcode.clone());
    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .with_context(|| format!("Cannot create output dir {}", settings.output_dir.display()))?;

    let db = connect_to_db(&config.database_url).await?;
    run_migrations(&db).await?;
    let redis = RedisService::new(&config.redis_url).await?;
    let rabbit = RabbitMqService::new(
        &config.rabbitmq_url,
        TopologySettings {
            video_retention: settings.video_retention(),
            subtitle_retention: settings.subtitle_retention(),
        },
    )
    .await?;

    let supervisor = ProcessSupervisor::new(SupervisorLimits::from(settings.as_ref()));
    let jobs = JobService::new(
        Arc::new(PgJobRepository::new(db)),
        Arc::new(redis),
        Arc::new(rabbit.clone()),
        supervisor.registry().clone(),
        settings.clone(),
    );

    let recovered = jobs.recover_stale_processing(OffsetDateTime::now_utc()).await?;
    info!(recovered, "Startup recovery finished");

    let ctx = WorkerContext {
        jobs: jobs.clone(),
        registry: supervisor.registry().clone(),
        encoder: Arc::new(HlsEncoder::new(supervisor.clone(), &settings)),
    };
    workers::transcoder::start_transcode_workers(&rabbit, &ctx, settings.transcode_consumers);
    workers::subtitle::start_subtitle_workers(&rabbit, &ctx, settings.subtitle_consumers);
    workers::dead_letter::start_dead_letter_worker(&rabbit, &jobs);
    workers::cleanup::start_cleanup_worker(&rabbit, &jobs);
    tokio::spawn(workers::scavenger::start_scavenger(
        jobs.clone(),
        settings.scavenger_cron.clone(),
    ));

    let port = config.server_port;
    let app = app::create_app(state::AppState::new(config, jobs, supervisor));

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind {}", addr))?;
    info!("Server running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
