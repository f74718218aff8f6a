use anyhow::Context;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod modules;
mod routes;
mod state;
mod transcode;
mod workers;

use config::settings::AppConfig;
use infrastructure::db::pool::connect_to_db;
use infrastructure::queue::rabbitmq::RabbitMqService;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting lesson transcoder...");

    let mut config = AppConfig::new().context("Missing required configuration")?;
    config.transcode.resolve_tools();

    let db = connect_to_db(&config.database_url, config.transcode.workers)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let queue = RabbitMqService::new(&config.amqp_url).await?;
    queue
        .declare_topology(&config.transcode.queue, &config.transcode.retry_queue())
        .await?;

    let port = config.server_port;
    let state = AppState::new(config, db, queue);
    let cancel = CancellationToken::new();

    // A worker that stops on its own takes the HTTP server down with it.
    let worker = {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = workers::transcoder::start_transcoder_worker(state, cancel.clone()).await;
            cancel.cancel();
            result
        })
    };

    let app = app::create_app(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Transcoder worker exited with error: {:#}", e),
        Err(e) => error!("Transcoder worker panicked: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
                cancel.cancelled().await;
            }
        }
        _ = cancel.cancelled() => {}
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
