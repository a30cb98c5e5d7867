// src/main.rs
//! Workflow Runtime
//!
//! `wfrt serve` runs the process pool, scheduler and delivery processor;
//! `wfrt worker` is what the pool launches for each worker process.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use workflow_runtime::admin::AdminClient;
use workflow_runtime::alerts::AlertPublisher;
use workflow_runtime::events::{
    DeliveryConfig, DeliveryProcessor, EventIngestor, EventStore, RetryPolicy, Scheduler,
    SchedulerConfig,
};
use workflow_runtime::modules::{CodeOrigin, FsOrigin, ModuleCache, ModuleCacheConfig};
use workflow_runtime::observability::{init_metrics, init_tracing};
use workflow_runtime::runtime::{PoolConfig, ProcessLauncher, ProcessPool, SpawnConfig};
use workflow_runtime::store::{self, Keys};
use workflow_runtime::utils::config::{EngineConfig, CONFIG_PATH_ENV};

#[derive(Parser)]
#[command(name = "wfrt", version, about = "Workflow runtime: module cache, worker pool and event delivery")]
struct Cli {
    /// Configuration file (defaults to ./wfrt.toml when present)
    #[arg(long, short, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the process pool, scheduler and delivery processor
    Serve,

    /// Serve the worker protocol on stdin/stdout (launched by the pool)
    Worker,

    /// Publish a source file under a logical path
    Push {
        logical_path: String,
        file: PathBuf,
    },

    /// Record an inbound event for a webhook source
    Webhook {
        source_id: String,

        #[arg(long)]
        event_type: Option<String>,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Show registered pools, their heartbeats and the delivery queue
    Status,

    /// Ask a pool to recycle one of its idle processes
    Recycle {
        worker_id: String,

        #[arg(long)]
        pid: Option<u32>,

        #[arg(long)]
        process_id: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;

    // stdout belongs to the protocol in worker processes
    let is_worker = matches!(cli.command, Command::Worker);
    init_tracing(&config.logging, is_worker);

    match cli.command {
        Command::Serve => serve(config, cli.config.as_deref()).await,
        Command::Worker => {
            workflow_runtime::runtime::worker::run_worker(&config).await?;
            Ok(())
        }
        Command::Push { logical_path, file } => push(&config, &logical_path, &file).await,
        Command::Webhook {
            source_id,
            event_type,
            data,
        } => webhook(&config, &source_id, event_type.as_deref(), &data).await,
        Command::Status => status(&config).await,
        Command::Recycle {
            worker_id,
            pid,
            process_id,
            reason,
        } => {
            let store = store::connect(&config.redis.url).await?;
            let admin = AdminClient::new(store, &config.redis.key_prefix, None);
            admin.request_recycle(&worker_id, pid, process_id, reason).await?;
            println!("Recycle requested on {}", worker_id);
            Ok(())
        }
    }
}

async fn serve(config: EngineConfig, config_path: Option<&Path>) -> Result<()> {
    info!("Starting workflow runtime v{}", workflow_runtime::VERSION);

    if let Some(addr) = &config.metrics.listen_addr {
        init_metrics(addr)?;
    }

    let store = store::connect(&config.redis.url)
        .await
        .context("Failed to connect to the cache store")?;
    let events = EventStore::open(&config.database.path)
        .await
        .context("Failed to open the event database")?;

    let launcher = ProcessLauncher::new(SpawnConfig::from_settings(&config.pool, config_path)?);
    let pool = ProcessPool::new(
        PoolConfig::from_settings(&config.pool, &config.redis.key_prefix),
        Arc::new(launcher),
        store.clone(),
    );
    pool.start().await.context("Failed to start the process pool")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(
            events.clone(),
            SchedulerConfig::from_settings(&config.scheduler),
        ));
        tasks.push(scheduler.spawn(shutdown_rx.clone()));
    }

    if config.delivery.enabled {
        let alerts = AlertPublisher::new(store.clone(), &Keys::new(&config.redis.key_prefix), "delivery");
        let processor = Arc::new(DeliveryProcessor::new(
            events.clone(),
            pool.clone(),
            RetryPolicy::from_settings(&config.delivery),
            DeliveryConfig::from_settings(&config.delivery),
            alerts,
        ));
        tasks.push(processor.spawn(shutdown_rx.clone()));
    }

    info!("Workflow runtime ready (pool {})", pool.worker_id());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    pool.shutdown().await;

    info!("Workflow runtime stopped");
    Ok(())
}

async fn push(config: &EngineConfig, logical_path: &str, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let origin = Arc::new(FsOrigin::new(&config.origin.root));
    origin
        .put_object(logical_path, Bytes::from(content.clone()))
        .await?;

    let store = store::connect(&config.redis.url).await?;
    let cache = ModuleCache::new(
        store,
        origin,
        ModuleCacheConfig::from_settings(&config.module_cache, &config.redis.key_prefix),
    );
    let entry = cache.push(logical_path, &content).await?;
    println!("{} {}", entry.path, entry.content_hash);
    Ok(())
}

async fn webhook(
    config: &EngineConfig,
    source_id: &str,
    event_type: Option<&str>,
    data: &str,
) -> Result<()> {
    let data: Value = serde_json::from_str(data).context("--data must be JSON")?;
    let events = EventStore::open(&config.database.path).await?;
    let fan_out = EventIngestor::new(events)
        .ingest_webhook(source_id, event_type, data)
        .await?;

    println!(
        "{}",
        json!({
            "event_id": fan_out.event.id,
            "status": fan_out.event.status,
            "deliveries": fan_out.deliveries.iter().map(|d| &d.id).collect::<Vec<_>>(),
        })
    );
    Ok(())
}

async fn status(config: &EngineConfig) -> Result<()> {
    let store = store::connect(&config.redis.url).await?;
    let events = match EventStore::open(&config.database.path).await {
        Ok(events) => Some(events),
        Err(e) => {
            error!("Event database unavailable: {}", e);
            None
        }
    };
    let admin = AdminClient::new(store, &config.redis.key_prefix, events);

    let mut pools = Vec::new();
    for record in admin.list_pools().await? {
        let heartbeat = admin.latest_heartbeat(&record.worker_id).await?;
        pools.push(json!({"pool": record, "heartbeat": heartbeat}));
    }
    let queue = admin.queue_stats().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"pools": pools, "queue": queue}))?
    );
    Ok(())
}
