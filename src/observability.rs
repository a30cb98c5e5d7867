// src/observability.rs
//! Logging and metrics setup
//!
//! `RUST_LOG` overrides `logging.level`. Worker processes log to stderr since
//! their stdout carries the protocol.

use crate::utils::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT_TRACING: Once = Once::new();

/// Install the global subscriber; later calls are no-ops
pub fn init_tracing(config: &LoggingConfig, to_stderr: bool) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        let installed = match (config.format, to_stderr) {
            (LogFormat::Json, true) => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            (LogFormat::Json, false) => registry.with(fmt::layer().json()).try_init(),
            (LogFormat::Pretty, true) => registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init(),
            (LogFormat::Pretty, false) => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = installed {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}

/// Serve Prometheus metrics on `listen_addr`; must run inside a tokio runtime
pub fn init_metrics(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr.parse().map_err(|e| {
        EngineError::ConfigError(format!("invalid metrics.listen_addr '{}': {}", listen_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::RuntimeError(format!("Failed to start metrics exporter: {}", e)))?;

    describe_metrics();
    tracing::info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    describe_counter!("module_cache_lookups_total", "Module lookups by tier that answered");
    describe_counter!("import_boundary_violations_total", "Imports refused by the boundary guard");
    describe_counter!("pool_executions_total", "Workflow executions by status");
    describe_histogram!("pool_execution_duration_seconds", "Wall time of one execution");
    describe_gauge!("pool_processes_live", "Live worker processes");
    describe_gauge!("pool_processes_busy", "Worker processes running an execution");
    describe_counter!("pool_processes_spawned_total", "Worker processes started");
    describe_counter!("pool_processes_recycled_total", "Worker processes killed and replaced");
    describe_counter!("scheduler_ticks_total", "Scheduler passes over schedule sources");
    describe_counter!("scheduler_events_fired_total", "Events created by schedule sources");
    describe_counter!("scheduler_missed_fires_total", "Schedule occurrences skipped after downtime");
    describe_counter!("webhook_events_total", "Events accepted from webhook sources");
    describe_counter!("events_created_total", "Events recorded");
    describe_counter!("deliveries_created_total", "Deliveries fanned out to subscriptions");
    describe_counter!("deliveries_total", "Finished delivery attempts by outcome");
    describe_histogram!("delivery_duration_seconds", "Wall time of one delivery attempt");
    describe_counter!("alerts_raised_total", "Operator alerts raised");
}
