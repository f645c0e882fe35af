mod buffer;
mod config;
mod handler;
mod http;
mod mqtt;
mod pipeline;
mod reading;
mod snapshot;
mod store;

use crate::buffer::IngestBuffer;
use crate::config::Config;
use crate::handler::MessageHandler;
use crate::pipeline::{spawn_flusher, FlushOutcome, IngestStats};
use crate::snapshot::SnapshotStore;
use crate::store::Store;
use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = Store::connect(&config.database_url, config.db_pool_size).await?;
    store.migrate().await.context("create sensor_data schema")?;
    let snapshots = SnapshotStore::new(&config.data_dir)?;
    let stats = Arc::new(IngestStats::new());
    let buffer = Arc::new(match config.buffer_capacity() {
        Some(cap) => IngestBuffer::bounded(cap),
        None => IngestBuffer::unbounded(),
    });
    tracing::info!(
        database = %config.database_url,
        data_dir = %config.data_dir.display(),
        flush_interval_secs = config.flush_interval_secs,
        buffer_cap = ?config.buffer_capacity(),
        "sensor ingest starting"
    );

    let flusher = spawn_flusher(
        store.clone(),
        buffer.clone(),
        stats.clone(),
        config.flush_interval(),
    );
    let handler = MessageHandler::new(buffer.clone(), snapshots.clone(), stats.clone());

    let mut mqtt_handle = {
        let config_clone = config.clone();
        tokio::spawn(async move { mqtt::run_listener(config_clone, handler).await })
    };

    let mut http_handle = if config.enable_http {
        let app = http::router(http::HttpState {
            store: store.clone(),
            buffer: buffer.clone(),
            stats: stats.clone(),
            snapshots,
        });
        let listener = tokio::net::TcpListener::bind(&config.http_bind)
            .await
            .with_context(|| format!("bind {}", config.http_bind))?;
        tracing::info!(bind=%config.http_bind, "history API listening");
        Some(tokio::spawn(async move { axum::serve(listener, app).await }))
    } else {
        None
    };

    let mut mqtt_running = true;
    let mut http_running = http_handle.is_some();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut mqtt_handle => {
            mqtt_running = false;
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener exited"),
                Err(err) => tracing::error!(error=%err, "MQTT task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = async {
            match http_handle.as_mut() {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        } => {
            http_running = false;
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "history API exited"),
                Err(err) => tracing::error!(error=%err, "history API task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    // producers must be gone before the final drain
    if mqtt_running {
        pipeline::stop_producer("mqtt listener", mqtt_handle).await;
    }
    if let Some(handle) = http_handle.filter(|_| http_running) {
        pipeline::stop_producer("history api", handle).await;
    }

    match flusher.shutdown().await {
        FlushOutcome::Written(rows) => tracing::info!(rows, "final flush committed"),
        FlushOutcome::Lost(rows) => tracing::error!(rows, "final flush failed; readings lost"),
        FlushOutcome::Empty => tracing::info!("nothing pending at shutdown"),
    }
    store.pool().close().await;

    Ok(())
}
