use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common_kafka::kafka_producer::create_kafka_producer;

use telemetry_ingest::config::Config;
use telemetry_ingest::consumer::TelemetryConsumer;
use telemetry_ingest::dead_letter::KafkaDeadLetterSink;
use telemetry_ingest::dispatch::PatchDispatcher;
use telemetry_ingest::metrics::{serve, setup_metrics_routes};
use telemetry_ingest::registry::PgDeviceRegistry;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "telemetry ingest service"
}

fn start_server(config: &Config) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| std::future::ready("ok")));
    let router = setup_metrics_routes(router);
    let bind = config.bind_address();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting telemetry ingest service");

    let config = Config::init_with_defaults().context("failed to load configuration")?;

    let server_handle = start_server(&config);
    info!("started metrics server on {}", config.bind_address());

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the device registry database")?;
    let registry = Arc::new(PgDeviceRegistry::new(pool));

    let dlq_producer = create_kafka_producer(&config.kafka)
        .await
        .context("failed to create dead-letter producer")?;
    let dead_letter = Arc::new(KafkaDeadLetterSink::new(
        dlq_producer,
        config.dead_letter_topic.clone(),
    ));

    let dispatcher = PatchDispatcher::new(
        registry,
        dead_letter,
        config.retry_policy(),
        config.worker_count,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let consumer = TelemetryConsumer::new(&config, dispatcher, shutdown_rx);
    let consumer_handle = tokio::spawn(consumer.run());

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(());

    // Give the in-flight dispatch a bounded grace period, then force-close.
    match tokio::time::timeout(config.shutdown_grace(), consumer_handle).await {
        Ok(Ok(Ok(()))) => info!("consumer stopped cleanly"),
        Ok(Ok(Err(e))) => error!("consumer stopped with error: {e:#}"),
        Ok(Err(e)) => error!("consumer task panicked: {e:#}"),
        Err(_) => error!(
            "consumer shutdown timed out after {:?}, aborting",
            config.shutdown_grace()
        ),
    }

    server_handle.abort();
    Ok(())
}
