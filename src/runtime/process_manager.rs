// src/runtime/process_manager.rs
//! Worker process spawning and control
//!
//! The pool never touches OS processes directly; it goes through
//! [`WorkerLauncher`] and [`WorkerHandle`]. [`ProcessLauncher`] is the real
//! implementation: it starts the worker executable, waits for its `ready`
//! line and then exchanges newline-delimited JSON over stdin/stdout. The
//! worker's stderr is inherited so its logs land next to the supervisor's.

use crate::runtime::protocol::{ExecutionRequest, ExecutionResult, WorkerMessage, WorkerRequest};
use crate::runtime::resource_limiter;
use crate::utils::config::{PoolSettings, CONFIG_PATH_ENV};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// Longest accepted protocol line (16 MiB)
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One running worker
#[async_trait]
pub trait WorkerHandle: Send + Sync + 'static {
    fn pid(&self) -> u32;

    /// Run one execution to completion. `Err` means the worker itself broke
    /// (exited, garbled output), never that the workflow failed.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;

    fn is_alive(&self) -> bool;

    /// Forced, immediate termination
    fn kill(&self) -> Result<()>;

    /// Ask politely, then escalate to SIGTERM and finally SIGKILL
    async fn shutdown(&self, grace: Duration) -> Result<()>;

    /// Resident set size in MB, when it can be sampled
    fn memory_mb(&self) -> Option<u64>;
}

/// Starts workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<Arc<dyn WorkerHandle>>;
}

/// Configuration for spawning a worker process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Worker executable
    pub command: PathBuf,

    pub args: Vec<String>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// How long the worker has to report ready
    pub ready_timeout: Duration,
}

impl SpawnConfig {
    /// Worker command from settings, defaulting to this executable
    pub fn from_settings(settings: &PoolSettings, config_path: Option<&Path>) -> Result<Self> {
        let command = match &settings.worker_command {
            Some(command) => command.clone(),
            None => std::env::current_exe().map_err(|e| {
                EngineError::ProcessSpawnFailed(format!("Cannot locate current executable: {}", e))
            })?,
        };

        let mut env_vars = Vec::new();
        if let Some(path) = config_path {
            env_vars.push((CONFIG_PATH_ENV.to_string(), path.display().to_string()));
        }

        Ok(Self {
            command,
            args: settings.worker_args.clone(),
            env_vars,
            work_dir: None,
            ready_timeout: Duration::from_secs(settings.spawn_timeout_secs),
        })
    }
}

/// Launches real OS worker processes
pub struct ProcessLauncher {
    config: SpawnConfig,
}

impl ProcessLauncher {
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Arc<dyn WorkerHandle>> {
        debug!("Spawning worker: {:?} {:?}", self.config.command, self.config.args);

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        for (key, value) in &self.config.env_vars {
            command.env(key, value);
        }
        if let Some(work_dir) = &self.config.work_dir {
            command.current_dir(work_dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to spawn worker: {}", e)))?;

        let pid = child.id().ok_or_else(|| {
            EngineError::ProcessSpawnFailed("Worker exited before reporting a pid".to_string())
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Worker stdout unavailable".to_string()))?;

        let mut reader = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let writer = FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let handshake = tokio::time::timeout(self.config.ready_timeout, read_message(&mut reader)).await;
        match handshake {
            Ok(Ok(WorkerMessage::Ready { .. })) => {}
            Ok(Ok(other)) => {
                let _ = child.start_kill();
                return Err(EngineError::WorkerProtocol(format!(
                    "Expected ready from pid {}, got {:?}",
                    pid, other
                )));
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(e);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(EngineError::ProcessSpawnFailed(format!(
                    "Worker pid {} not ready within {:?}",
                    pid, self.config.ready_timeout
                )));
            }
        }

        info!("Worker process ready (pid {})", pid);
        Ok(Arc::new(ProcessWorker {
            pid,
            child: parking_lot::Mutex::new(child),
            io: tokio::sync::Mutex::new(WorkerIo { reader, writer }),
        }))
    }
}

struct WorkerIo {
    reader: FramedRead<ChildStdout, LinesCodec>,
    writer: FramedWrite<ChildStdin, LinesCodec>,
}

/// Handle to one spawned worker process
pub struct ProcessWorker {
    pid: u32,
    child: parking_lot::Mutex<Child>,
    io: tokio::sync::Mutex<WorkerIo>,
}

impl ProcessWorker {
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(EngineError::RuntimeError(format!(
                "Failed to send {} to pid {}: {}",
                signal, self.pid, e
            ))),
        }
    }

    async fn wait_exit(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !self.is_alive()
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let mut io = self.io.lock().await;

        let line = serde_json::to_string(&WorkerRequest::Execute(request.clone()))?;
        io.writer.send(line).await.map_err(|e| {
            EngineError::WorkerProtocol(format!("Failed to send request to pid {}: {}", self.pid, e))
        })?;

        loop {
            match read_message(&mut io.reader).await? {
                WorkerMessage::Result(result) if result.execution_id == request.execution_id => {
                    return Ok(result)
                }
                other => warn!("Ignoring unexpected message from pid {}: {:?}", self.pid, other),
            }
        }
    }

    fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn kill(&self) -> Result<()> {
        debug!("Sending SIGKILL to pid {}", self.pid);
        self.signal(nix::sys::signal::Signal::SIGKILL)
    }

    async fn shutdown(&self, grace: Duration) -> Result<()> {
        if let Ok(mut io) = self.io.try_lock() {
            if let Ok(line) = serde_json::to_string(&WorkerRequest::Shutdown) {
                let _ = io.writer.send(line).await;
            }
        }
        if self.wait_exit(grace / 2).await {
            return Ok(());
        }

        debug!("Worker pid {} still running, sending SIGTERM", self.pid);
        self.signal(nix::sys::signal::Signal::SIGTERM)?;
        if self.wait_exit(grace / 2).await {
            return Ok(());
        }

        warn!("Worker pid {} ignored SIGTERM, killing", self.pid);
        self.kill()
    }

    fn memory_mb(&self) -> Option<u64> {
        resource_limiter::sample_rss_mb(self.pid)
    }
}

/// Next protocol message, skipping blank lines
async fn read_message(reader: &mut FramedRead<ChildStdout, LinesCodec>) -> Result<WorkerMessage> {
    loop {
        match reader.next().await {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => {
                return serde_json::from_str(&line).map_err(|e| {
                    EngineError::WorkerProtocol(format!("Invalid worker message: {}", e))
                })
            }
            Some(Err(e)) => return Err(EngineError::WorkerProtocol(e.to_string())),
            None => {
                return Err(EngineError::WorkerProtocol(
                    "Worker closed its output".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_launcher(script: &str, ready_timeout: Duration) -> ProcessLauncher {
        ProcessLauncher::new(SpawnConfig {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env_vars: vec![],
            work_dir: None,
            ready_timeout,
        })
    }

    #[test]
    fn test_spawn_config_defaults_to_current_exe() {
        let settings = PoolSettings::default();
        let config = SpawnConfig::from_settings(&settings, Some(Path::new("/etc/wfrt.toml"))).unwrap();
        assert_eq!(config.args, vec!["worker".to_string()]);
        assert_eq!(config.env_vars[0].0, CONFIG_PATH_ENV);
        assert_eq!(config.ready_timeout, Duration::from_secs(settings.spawn_timeout_secs));
    }

    #[tokio::test]
    async fn test_missing_ready_times_out() {
        let launcher = shell_launcher("sleep 5", Duration::from_millis(200));
        let err = launcher.launch().await.err().unwrap();
        assert!(matches!(err, EngineError::ProcessSpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_echo_worker_round_trip() {
        // Replies with a fixed result for execution "e1", then exits on EOF
        let script = r#"
echo '{"type":"ready","pid":0}'
read line
echo '{"type":"result","execution_id":"e1","status":"success","result":42,"duration_ms":1}'
read line
"#;
        let launcher = shell_launcher(script, Duration::from_secs(5));
        let worker = launcher.launch().await.unwrap();
        assert!(worker.is_alive());

        let request = ExecutionRequest {
            execution_id: "e1".to_string(),
            workflow: crate::runtime::protocol::WorkflowRef::new("a.js", "run"),
            input: serde_json::Value::Null,
        };
        let result = worker.execute(&request).await.unwrap();
        assert_eq!(result.result, Some(serde_json::json!(42)));

        worker.kill().unwrap();
        let mut exited = false;
        for _ in 0..50 {
            if !worker.is_alive() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
    }
}
