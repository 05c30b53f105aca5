mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use futures_util::StreamExt;
use gavel_common::redis::COMPLETIONS_CHANNEL;
use gavel_common::types::CompletionEvent;
use gavel_common::Config;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub struct AppState {
    pub redis: ConnectionManager,
    pub start_time: Instant,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Gavel API booting...");

    metrics::init_metrics().context("Failed to register metrics")?;
    info!("Metrics registry initialized");

    let config = Arc::new(Config::from_env());

    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let redis_conn = ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let state = Arc::new(AppState {
        redis: redis_conn,
        start_time: Instant::now(),
        config: config.clone(),
    });

    tokio::spawn(metrics_subscriber(client));

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

/// Background task: count worker completion events into the metrics
async fn metrics_subscriber(client: redis::Client) {
    let mut pubsub = match client.get_async_connection().await {
        Ok(conn) => conn.into_pubsub(),
        Err(e) => {
            error!(error = %e, "Failed to create pubsub connection");
            return;
        }
    };

    if let Err(e) = pubsub.subscribe(COMPLETIONS_CHANNEL).await {
        error!(error = %e, "Failed to subscribe to completions channel");
        return;
    }

    info!("Metrics subscriber started - listening for job completions");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };

        match serde_json::from_str::<CompletionEvent>(&payload) {
            Ok(event) => {
                let status = serde_json::to_value(event.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                metrics::record_job_completed(
                    &event.language.to_string(),
                    &status,
                    event.execution_time_ms as f64,
                );
                debug!(job_id = %event.job_id, language = %event.language, %status, "Recorded job completion");
            }
            Err(e) => warn!(error = %e, "Ignoring malformed completion event"),
        }
    }
    warn!("Completions subscription closed");
}
