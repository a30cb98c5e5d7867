// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. Optional file (`wfrt.toml` in the working directory, or `--config <path>`)
//! 3. Environment variables prefixed `WFRT`, sections separated by `__`
//!    (e.g. `WFRT__POOL__MIN_WORKERS=4`)

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "wfrt.toml";

/// Environment variable carrying an explicit config path to worker processes
pub const CONFIG_PATH_ENV: &str = "WFRT_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub redis: RedisConfig,
    pub origin: OriginConfig,
    pub database: DatabaseConfig,
    pub module_cache: ModuleCacheSettings,
    pub guard: GuardSettings,
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    pub delivery: DeliverySettings,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Cache store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL; `memory://` selects the in-process store
    pub url: String,

    /// Prefix for every key and channel
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "wfrt".to_string(),
        }
    }
}

/// Code origin (object storage) location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Root directory holding source objects by logical path
    pub root: PathBuf,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./workspace"),
        }
    }
}

/// Relational store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./wfrt.db"),
        }
    }
}

/// Module cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleCacheSettings {
    /// Hot-tier TTL for entries written back from origin (seconds)
    pub ttl_secs: u64,

    /// Maximum age of the in-process index snapshot (seconds)
    pub index_max_age_secs: u64,

    /// Source file extension, without the dot
    pub extension: String,

    /// File name (without extension) that makes a directory a package
    pub package_file: String,

    /// zstd level for hot-tier values
    pub compression_level: i32,

    /// Hot-tier values below this size skip compression
    pub compress_min_bytes: usize,
}

impl Default for ModuleCacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            index_max_age_secs: 60,
            extension: "js".to_string(),
            package_file: "index".to_string(),
            compression_level: 3,
            compress_min_bytes: 512,
        }
    }
}

/// Import boundary rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Dotted namespaces workspace code may not import
    pub blocked_prefixes: Vec<String>,

    /// SDK names that always pass, regardless of caller
    pub allowed_exports: Vec<String>,

    /// Logical-path roots of workspace ("home") code, matched on `/` boundaries;
    /// `""` makes every non-platform path home
    pub home_roots: Vec<String>,

    /// Logical-path roots of trusted first-party code
    pub platform_roots: Vec<String>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            blocked_prefixes: vec!["platform".to_string()],
            allowed_exports: vec!["platform.sdk".to_string()],
            home_roots: vec![String::new()],
            platform_roots: vec![crate::modules::platform::PLATFORM_ROOT.to_string()],
        }
    }
}

/// Worker pool sizing and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,

    /// Supervisor-enforced execution deadline (seconds)
    pub execution_timeout_secs: u64,

    /// How long a dispatch waits for a free process (seconds)
    pub acquire_timeout_secs: u64,

    /// How long a new process has to report ready (seconds)
    pub spawn_timeout_secs: u64,

    /// Heartbeat and supervision interval (seconds)
    pub heartbeat_interval_secs: u64,

    /// Recycle a process after this many executions (0 = never)
    pub max_executions_per_process: u64,

    /// Recycle an idle process whose RSS exceeds this (MB, 0 = unlimited)
    pub memory_limit_mb: u64,

    /// Worker executable; defaults to the current executable
    pub worker_command: Option<PathBuf>,

    /// Worker arguments
    pub worker_args: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            execution_timeout_secs: 300,
            acquire_timeout_secs: 30,
            spawn_timeout_secs: 15,
            heartbeat_interval_secs: 10,
            max_executions_per_process: 500,
            memory_limit_mb: 512,
            worker_command: None,
            worker_args: vec!["worker".to_string()],
        }
    }
}

/// Cron scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,

    /// Tick interval, also the polling window (seconds)
    pub tick_interval_secs: u64,

    /// Schedules firing more often than this are warned about (seconds)
    pub min_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60,
            min_interval_secs: 300,
        }
    }
}

/// Delivery queue processor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter: bool,

    /// RUNNING deliveries older than this are reclaimed (seconds)
    pub running_timeout_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            batch_size: 16,
            concurrency: 8,
            max_attempts: 3,
            base_delay_secs: 30,
            max_delay_secs: 3600,
            jitter: true,
            running_timeout_secs: 900,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener, e.g. `0.0.0.0:9090`; disabled when unset
    pub listen_addr: Option<String>,
}

impl EngineConfig {
    /// Load configuration from defaults, `wfrt.toml` (if present) and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load configuration, reading `path` instead of the default file when given
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let loaded: EngineConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("WFRT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_workers == 0 {
            return Err(EngineError::ConfigError("pool.max_workers must be at least 1".into()));
        }
        if pool.min_workers > pool.max_workers {
            return Err(EngineError::ConfigError(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({})",
                pool.min_workers, pool.max_workers
            )));
        }
        if pool.execution_timeout_secs == 0 || pool.heartbeat_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "pool timeouts and intervals must be non-zero".into(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "scheduler.tick_interval_secs must be non-zero".into(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(EngineError::ConfigError(
                "delivery.max_attempts must be at least 1".into(),
            ));
        }
        if self.delivery.concurrency == 0 || self.delivery.batch_size == 0 {
            return Err(EngineError::ConfigError(
                "delivery.concurrency and delivery.batch_size must be non-zero".into(),
            ));
        }
        // A RUNNING delivery must outlive the worker waiting on it
        let worst_case = pool.acquire_timeout_secs.saturating_add(pool.execution_timeout_secs);
        if self.delivery.running_timeout_secs <= worst_case {
            return Err(EngineError::ConfigError(format!(
                "delivery.running_timeout_secs ({}) must exceed pool.acquire_timeout_secs + pool.execution_timeout_secs ({})",
                self.delivery.running_timeout_secs, worst_case
            )));
        }
        if self.module_cache.extension.is_empty() {
            return Err(EngineError::ConfigError("module_cache.extension must be set".into()));
        }
        Ok(())
    }
}

impl ModuleCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn index_max_age(&self) -> Duration {
        Duration::from_secs(self.index_max_age_secs)
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl DeliverySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
