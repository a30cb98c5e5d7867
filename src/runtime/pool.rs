// src/runtime/pool.rs
//! Worker process pool
//!
//! Owns a set of worker processes and their state machine.
//!
//! # Architecture
//!
//! ```text
//! ProcessPool
//! ├─ ProcessTable      (IDLE / BUSY / KILLED, compare-and-set transitions)
//! ├─ Supervision loop  (reap crashes, enforce limits, respawn, heartbeat)
//! └─ Command loop      ({prefix}:pool:{worker_id}:commands → recycle_process)
//! ```
//!
//! Dispatch never reports a transport problem as an error: every call to
//! [`ProcessPool::execute`] yields an [`ExecutionResult`]. Timeouts are
//! enforced here, and a timed-out process is killed and replaced rather than
//! trusted to stop on its own.

use crate::alerts::{AlertKind, AlertPublisher, Severity};
use crate::runtime::process_manager::{WorkerHandle, WorkerLauncher};
use crate::runtime::process_table::{Claimed, ProcessRecord, ProcessState, ProcessTable};
use crate::runtime::protocol::{
    ExecutionError, ExecutionRequest, ExecutionResult, WorkflowRef,
};
use crate::runtime::resource_limiter::{ResourceLimiter, ResourceLimits};
use crate::store::{CacheStore, Keys};
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the process pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Identity of this pool instance in the shared store
    pub worker_id: String,

    pub key_prefix: String,

    pub min_workers: usize,
    pub max_workers: usize,

    /// Supervisor-side execution deadline
    pub execution_timeout: Duration,

    /// How long a dispatch waits for a free process
    pub acquire_timeout: Duration,

    /// Supervision and heartbeat period
    pub heartbeat_interval: Duration,

    /// Grace period for stopping processes on shutdown
    pub shutdown_grace: Duration,

    pub limits: ResourceLimits,
}

impl PoolConfig {
    pub fn from_settings(settings: &PoolSettings, key_prefix: &str) -> Self {
        Self {
            worker_id: format!("pool_{}", ulid::Ulid::new()),
            key_prefix: key_prefix.to_string(),
            min_workers: settings.min_workers,
            max_workers: settings.max_workers,
            execution_timeout: Duration::from_secs(settings.execution_timeout_secs),
            acquire_timeout: Duration::from_secs(settings.acquire_timeout_secs),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            shutdown_grace: Duration::from_secs(5),
            limits: ResourceLimits::from_settings(settings),
        }
    }

    /// TTL of the registration hash and heartbeat key
    pub fn record_ttl(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default(), "wfrt")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Online,
    Offline,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Online => "online",
            PoolStatus::Offline => "offline",
        }
    }
}

/// Registration of one pool instance (`{prefix}:pool:{worker_id}` hash)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub worker_id: String,
    pub hostname: String,
    pub status: PoolStatus,
    pub min_workers: usize,
    pub max_workers: usize,
    pub started_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("worker_id".to_string(), self.worker_id.clone()),
            ("hostname".to_string(), self.hostname.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("min_workers".to_string(), self.min_workers.to_string()),
            ("max_workers".to_string(), self.max_workers.to_string()),
            ("started_at".to_string(), self.started_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let status = match fields.get("status")?.as_str() {
            "online" => PoolStatus::Online,
            "offline" => PoolStatus::Offline,
            _ => return None,
        };
        Some(Self {
            worker_id: fields.get("worker_id")?.clone(),
            hostname: fields.get("hostname")?.clone(),
            status,
            min_workers: fields.get("min_workers")?.parse().ok()?,
            max_workers: fields.get("max_workers")?.parse().ok()?,
            started_at: DateTime::parse_from_rfc3339(fields.get("started_at")?)
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

/// Snapshot published every heartbeat interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub pool_size: usize,
    pub idle_count: usize,
    pub busy_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub timestamp: DateTime<Utc>,
    pub processes: Vec<ProcessRecord>,
}

/// Commands accepted on the pool's command channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PoolCommand {
    RecycleProcess {
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        process_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycleOutcome {
    Recycled,
    /// Target is running an execution; nothing changed
    RejectedBusy,
    NotFound,
    AlreadyKilled,
}

/// Published on `{prefix}:pool:command-results` for every command handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub worker_id: String,
    pub action: String,
    pub pid: Option<u32>,
    pub process_id: Option<String>,
    pub outcome: RecycleOutcome,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Runs workflows on pooled worker processes
#[async_trait]
pub trait WorkflowExecutor: Send + Sync + 'static {
    async fn execute(&self, workflow: &WorkflowRef, input: Value) -> ExecutionResult;
}

/// Process pool manager
pub struct ProcessPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    table: ProcessTable,
    limiter: ResourceLimiter,
    store: Arc<dyn CacheStore>,
    keys: Keys,
    alerts: AlertPublisher,
    hostname: String,
    started_at: DateTime<Utc>,

    /// Launches in flight, counted against `max_workers`
    spawning: AtomicUsize,

    /// Signalled whenever a process becomes IDLE
    freed: Notify,

    below_minimum_alerted: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn CacheStore>,
    ) -> Arc<Self> {
        let keys = Keys::new(config.key_prefix.clone());
        let alerts = AlertPublisher::new(store.clone(), &keys, config.worker_id.clone());
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            limiter: ResourceLimiter::new(config.limits.clone()),
            config,
            launcher,
            table: ProcessTable::new(),
            store,
            keys,
            alerts,
            hostname,
            started_at: Utc::now(),
            spawning: AtomicUsize::new(0),
            freed: Notify::new(),
            below_minimum_alerted: AtomicBool::new(false),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.table.live_count(),
            idle: self.table.count(ProcessState::Idle),
            busy: self.table.count(ProcessState::Busy),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
        }
    }

    /// Spawn `min_workers`, register the pool and start the background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            "Starting process pool {} on {} (min {}, max {})",
            self.config.worker_id, self.hostname, self.config.min_workers, self.config.max_workers
        );

        self.replenish().await;
        if self.config.min_workers > 0 && self.table.live_count() == 0 {
            return Err(EngineError::ProcessSpawnFailed(
                "No worker process could be started".to_string(),
            ));
        }

        let commands = self
            .store
            .subscribe(&self.keys.command_channel(&self.config.worker_id))
            .await?;
        self.refresh_registration(PoolStatus::Online).await;
        self.publish_heartbeat().await;

        let supervisor = tokio::spawn(Self::supervise_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        ));
        let listener = tokio::spawn(Self::command_loop(
            Arc::clone(self),
            commands,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend([supervisor, listener]);

        info!("Process pool {} started with {} processes", self.config.worker_id, self.table.live_count());
        Ok(())
    }

    /// Run `workflow` with `input` on a pooled process
    pub async fn execute(&self, workflow: &WorkflowRef, input: Value) -> ExecutionResult {
        let execution_id = format!("exec_{}", ulid::Ulid::new());
        let started = Instant::now();

        let claimed = match self.acquire(&execution_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("No process available for {} ({}): {}", execution_id, workflow, e);
                metrics::counter!("pool_executions_total", "status" => "exhausted").increment(1);
                return ExecutionResult::failed(
                    execution_id,
                    ExecutionError::new("PoolExhausted", e.to_string()),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        debug!(
            "Dispatching {} ({}) to process {} (pid {})",
            execution_id, workflow, claimed.process_id, claimed.pid
        );

        let request = ExecutionRequest {
            execution_id: execution_id.clone(),
            workflow: workflow.clone(),
            input,
        };

        let limit = self.config.execution_timeout;
        let outcome = tokio::time::timeout(limit, claimed.handle.execute(&request)).await;

        let mut result = match outcome {
            Ok(Ok(result)) => {
                self.complete(&claimed).await;
                result
            }
            Ok(Err(e)) => {
                warn!(
                    "Process {} (pid {}) failed during {}: {}",
                    claimed.process_id, claimed.pid, execution_id, e
                );
                self.retire(&claimed, "crashed during execution").await;
                self.alerts
                    .raise(
                        AlertKind::ProcessCrashed,
                        Severity::Warning,
                        format!("Process {} crashed while running {}", claimed.process_id, workflow),
                        json!({"process_id": claimed.process_id, "pid": claimed.pid, "execution_id": execution_id}),
                    )
                    .await;
                ExecutionResult::failed(
                    &execution_id,
                    ExecutionError::new("WorkerCrashed", e.to_string()),
                    started.elapsed().as_millis() as u64,
                )
            }
            Err(_) => {
                warn!(
                    "Execution {} on process {} exceeded {:?}, recycling",
                    execution_id, claimed.process_id, limit
                );
                self.retire(&claimed, "execution timeout").await;
                ExecutionResult::timeout(&execution_id, limit.as_millis() as u64)
            }
        };
        result.process_id = Some(claimed.process_id.clone());

        if result.error_type() == Some("ImportBoundaryError") {
            let message = result.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
            self.alerts
                .raise(
                    AlertKind::ImportBoundaryViolation,
                    Severity::Warning,
                    message,
                    json!({"workflow": workflow, "execution_id": execution_id}),
                )
                .await;
        }

        metrics::counter!("pool_executions_total", "status" => result.status.as_str()).increment(1);
        metrics::histogram!("pool_execution_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// Claim an IDLE process, spawning one if below `max_workers`
    async fn acquire(&self, execution_id: &str) -> Result<Claimed> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self.is_shut_down() {
                return Err(EngineError::RuntimeError(format!(
                    "Process pool {} is shut down",
                    self.config.worker_id
                )));
            }
            if let Some(claimed) = self.table.claim_idle(execution_id) {
                return Ok(claimed);
            }

            if self.try_reserve_spawn() {
                if let Err(e) = self.spawn_process().await {
                    warn!("Failed to grow pool {}: {}", self.config.worker_id, e);
                } else {
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::PoolExhausted);
            }
            let wait = (deadline - now).min(Duration::from_millis(100));
            let _ = tokio::time::timeout(wait, self.freed.notified()).await;
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn try_reserve_spawn(&self) -> bool {
        let in_flight = self.spawning.fetch_add(1, Ordering::SeqCst) + 1;
        if self.table.live_count() + in_flight > self.config.max_workers {
            self.spawning.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Launch one process; the caller holds a spawn reservation
    async fn spawn_process(&self) -> Result<String> {
        let launched = self.launcher.launch().await;
        // A launch that lands after shutdown drained the table is not kept
        let launched = match launched {
            Ok(handle) if self.is_shut_down() => {
                if let Err(e) = handle.kill() {
                    warn!("Failed to kill late process (pid {}): {}", handle.pid(), e);
                }
                Err(EngineError::RuntimeError(format!(
                    "Process pool {} is shut down",
                    self.config.worker_id
                )))
            }
            other => other,
        };
        let outcome = launched.map(|handle| {
            let pid = handle.pid();
            let process_id = self.table.insert(handle);
            info!("Spawned process {} (pid {})", process_id, pid);
            process_id
        });
        self.spawning.fetch_sub(1, Ordering::SeqCst);

        if outcome.is_ok() {
            metrics::counter!("pool_processes_spawned_total").increment(1);
            self.freed.notify_one();
        }
        outcome
    }

    /// Spawn until `min_workers` processes are live; a no-op once shut down
    async fn replenish(&self) {
        while !self.is_shut_down()
            && self.table.live_count() + self.spawning.load(Ordering::SeqCst) < self.config.min_workers {
            if !self.try_reserve_spawn() {
                break;
            }
            if let Err(e) = self.spawn_process().await {
                if self.is_shut_down() {
                    return;
                }
                error!("Pool {} cannot reach min_workers: {}", self.config.worker_id, e);
                if !self.below_minimum_alerted.swap(true, Ordering::SeqCst) {
                    self.alerts
                        .raise(
                            AlertKind::PoolBelowMinimum,
                            Severity::Critical,
                            format!(
                                "Pool {} has {} of {} required processes: {}",
                                self.config.worker_id,
                                self.table.live_count(),
                                self.config.min_workers,
                                e
                            ),
                            json!({"hostname": self.hostname}),
                        )
                        .await;
                }
                return;
            }
        }

        if self.table.live_count() >= self.config.min_workers {
            self.below_minimum_alerted.store(false, Ordering::SeqCst);
        }
    }

    /// BUSY → IDLE after a completed execution, rotating the process if due
    async fn complete(&self, claimed: &Claimed) {
        match self.table.release(&claimed.process_id) {
            Ok(completed) => {
                self.freed.notify_one();
                if let Some(breach) = self.limiter.check_executions(completed) {
                    self.recycle(&claimed.process_id, &breach.to_string()).await;
                }
            }
            Err(e) => debug!("Process {} not released: {}", claimed.process_id, e),
        }
    }

    /// BUSY → KILLED for a process that broke or overran, then replace it
    async fn retire(&self, claimed: &Claimed, reason: &str) {
        match self.table.mark_killed(&claimed.process_id, ProcessState::Busy) {
            Ok(handle) => self.terminate(&claimed.process_id, handle.as_ref(), reason),
            Err(e) => debug!("Process {} already retired: {}", claimed.process_id, e),
        }
        self.replenish().await;
    }

    fn terminate(&self, process_id: &str, handle: &dyn WorkerHandle, reason: &str) {
        info!("Recycling process {} (pid {}): {}", process_id, handle.pid(), reason);
        if let Err(e) = handle.kill() {
            warn!("Failed to kill process {}: {}", process_id, e);
        }
        metrics::counter!("pool_processes_recycled_total").increment(1);
    }

    /// Recycle an IDLE process; BUSY processes are left alone
    pub async fn recycle(&self, process_id: &str, reason: &str) -> RecycleOutcome {
        match self.table.mark_killed(process_id, ProcessState::Idle) {
            Ok(handle) => {
                self.terminate(process_id, handle.as_ref(), reason);
                self.replenish().await;
                RecycleOutcome::Recycled
            }
            Err(_) => match self.table.state(process_id) {
                None => RecycleOutcome::NotFound,
                Some(ProcessState::Killed) => RecycleOutcome::AlreadyKilled,
                Some(_) => RecycleOutcome::RejectedBusy,
            },
        }
    }

    /// Apply one command; the outcome is also published to the results channel
    pub async fn handle_command(&self, command: PoolCommand) -> CommandResult {
        match command {
            PoolCommand::RecycleProcess {
                pid,
                process_id,
                reason,
            } => {
                let target = process_id
                    .clone()
                    .or_else(|| pid.and_then(|pid| self.table.find_by_pid(pid)));
                let why = reason.clone().unwrap_or_else(|| "remote command".to_string());

                let outcome = match &target {
                    Some(id) => self.recycle(id, &why).await,
                    None => RecycleOutcome::NotFound,
                };
                info!(
                    "recycle_process pid={:?} process_id={:?}: {:?}",
                    pid, target, outcome
                );

                let result = CommandResult {
                    worker_id: self.config.worker_id.clone(),
                    action: "recycle_process".to_string(),
                    pid,
                    process_id: target,
                    outcome,
                    reason,
                    timestamp: Utc::now(),
                };
                self.publish_command_result(&result).await;
                result
            }
        }
    }

    async fn publish_command_result(&self, result: &CommandResult) {
        let channel = self.keys.command_results_channel();
        match serde_json::to_vec(result) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(&channel, Bytes::from(payload)).await {
                    warn!("Failed to publish command result: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode command result: {}", e),
        }
    }

    /// One supervision pass: reap, enforce limits, respawn, report
    pub async fn supervise_once(&self) {
        for (process_id, pid, handle) in self.table.in_state(ProcessState::Idle) {
            if handle.is_alive() {
                continue;
            }
            if self.table.mark_killed(&process_id, ProcessState::Idle).is_ok() {
                warn!("Process {} (pid {}) exited unexpectedly", process_id, pid);
                self.alerts
                    .raise(
                        AlertKind::ProcessCrashed,
                        Severity::Warning,
                        format!("Idle process {} exited unexpectedly", process_id),
                        json!({"process_id": process_id, "pid": pid}),
                    )
                    .await;
            }
        }

        for record in self.table.snapshot() {
            if record.state == ProcessState::Killed {
                continue;
            }
            let memory_mb = match self.table.handle(&record.process_id) {
                Some(handle) => handle.memory_mb(),
                None => continue,
            };
            self.table.set_memory(&record.process_id, memory_mb);

            if record.state != ProcessState::Idle {
                continue;
            }
            let breach = self
                .limiter
                .check_memory(memory_mb)
                .or_else(|| self.limiter.check_executions(record.executions_completed));
            if let Some(breach) = breach {
                self.recycle(&record.process_id, &breach.to_string()).await;
            }
        }

        self.replenish().await;
        self.publish_heartbeat().await;
        self.refresh_registration(PoolStatus::Online).await;
        self.table.prune_killed();

        let stats = self.stats();
        metrics::gauge!("pool_processes_live").set(stats.live as f64);
        metrics::gauge!("pool_processes_busy").set(stats.busy as f64);
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let processes = self.table.snapshot();
        let idle_count = processes.iter().filter(|p| p.state == ProcessState::Idle).count();
        let busy_count = processes.iter().filter(|p| p.state == ProcessState::Busy).count();

        Heartbeat {
            worker_id: self.config.worker_id.clone(),
            hostname: self.hostname.clone(),
            pool_size: idle_count + busy_count,
            idle_count,
            busy_count,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            timestamp: Utc::now(),
            processes,
        }
    }

    async fn publish_heartbeat(&self) {
        let payload = match serde_json::to_vec(&self.heartbeat()) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("Failed to encode heartbeat: {}", e);
                return;
            }
        };

        let key = self.keys.pool_heartbeat(&self.config.worker_id);
        if let Err(e) = self.store.set_ex(&key, payload.clone(), self.config.record_ttl()).await {
            warn!("Failed to store heartbeat: {}", e);
        }
        if let Err(e) = self.store.publish(&self.keys.heartbeat_channel(), payload).await {
            warn!("Failed to publish heartbeat: {}", e);
        }
    }

    pub fn record(&self, status: PoolStatus) -> PoolRecord {
        PoolRecord {
            worker_id: self.config.worker_id.clone(),
            hostname: self.hostname.clone(),
            status,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            started_at: self.started_at,
        }
    }

    async fn refresh_registration(&self, status: PoolStatus) {
        let key = self.keys.pool(&self.config.worker_id);
        let fields = self.record(status).to_fields();

        let registered = async {
            self.store.hset_all(&key, &fields).await?;
            self.store.expire(&key, self.config.record_ttl()).await?;
            self.store.sadd(&self.keys.pools(), &self.config.worker_id).await
        };
        if let Err(e) = registered.await {
            warn!("Failed to refresh pool registration: {}", e);
        }
    }

    async fn supervise_loop(pool: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(pool.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => pool.supervise_once().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Supervision loop for {} stopped", pool.config.worker_id);
    }

    async fn command_loop(
        pool: Arc<Self>,
        mut commands: crate::store::Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = commands.recv() => match message {
                    Some(raw) => match serde_json::from_slice::<PoolCommand>(&raw) {
                        Ok(command) => {
                            pool.handle_command(command).await;
                        }
                        Err(e) => warn!("Ignoring malformed pool command: {}", e),
                    },
                    None => {
                        warn!("Command subscription for {} closed", pool.config.worker_id);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Stop the loops, stop every process and deregister
    pub async fn shutdown(&self) {
        info!("Shutting down process pool {}", self.config.worker_id);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for state in [ProcessState::Idle, ProcessState::Busy] {
            for (process_id, _, handle) in self.table.in_state(state) {
                if self.table.mark_killed(&process_id, state).is_ok() {
                    if let Err(e) = handle.shutdown(self.config.shutdown_grace).await {
                        warn!("Failed to stop process {}: {}", process_id, e);
                    }
                }
            }
        }
        self.table.prune_killed();

        let key = self.keys.pool(&self.config.worker_id);
        let deregistered = async {
            self.store.hset_all(&key, &self.record(PoolStatus::Offline).to_fields()).await?;
            self.store.srem(&self.keys.pools(), &self.config.worker_id).await?;
            self.store.del(&self.keys.pool_heartbeat(&self.config.worker_id)).await
        };
        if let Err(e) = deregistered.await {
            warn!("Failed to deregister pool {}: {}", self.config.worker_id, e);
        }
        info!("Process pool {} stopped", self.config.worker_id);
    }
}

#[async_trait]
impl WorkflowExecutor for ProcessPool {
    async fn execute(&self, workflow: &WorkflowRef, input: Value) -> ExecutionResult {
        ProcessPool::execute(self, workflow, input).await
    }
}
