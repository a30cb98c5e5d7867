// src/runtime/testing.rs
//! In-process worker fakes
//!
//! Lets the pool, the delivery processor and integration tests run without
//! spawning OS processes. Behaviour per execution is scripted.

use crate::runtime::process_manager::{WorkerHandle, WorkerLauncher};
use crate::runtime::protocol::{ExecutionError, ExecutionRequest, ExecutionResult};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a fake worker does with one request
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    Succeed(Value),
    Fail(ExecutionError),
    /// Succeed after a delay (aborted if killed meanwhile)
    Delay(Duration, Value),
    /// Never answer until killed
    Hang,
    /// Die mid-execution
    Crash,
}

pub type Script = Arc<dyn Fn(&ExecutionRequest) -> FakeBehavior + Send + Sync>;

/// Echo the input back
pub fn echo_script() -> Script {
    Arc::new(|request: &ExecutionRequest| FakeBehavior::Succeed(request.input.clone()))
}

pub struct FakeHandle {
    pid: u32,
    alive: AtomicBool,
    executions: AtomicU64,
    memory_mb: AtomicU64,
    script: Script,
}

impl FakeHandle {
    pub fn new(pid: u32) -> Self {
        Self::with_script(pid, echo_script())
    }

    pub fn with_script(pid: u32, script: Script) -> Self {
        Self {
            pid,
            alive: AtomicBool::new(true),
            executions: AtomicU64::new(0),
            memory_mb: AtomicU64::new(0),
            script,
        }
    }

    /// Simulate the process dying on its own
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn set_memory_mb(&self, mb: u64) {
        self.memory_mb.store(mb, Ordering::SeqCst);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    async fn wait_or_killed(&self, duration: Option<Duration>) -> bool {
        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        loop {
            if !self.alive.load(Ordering::SeqCst) {
                return false;
            }
            if let Some(limit) = duration {
                if waited >= limit {
                    return true;
                }
            }
            tokio::time::sleep(step).await;
            waited += step;
        }
    }
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if !self.is_alive() {
            return Err(EngineError::WorkerProtocol("Worker closed its output".to_string()));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        match (self.script)(request) {
            FakeBehavior::Succeed(value) => {
                Ok(ExecutionResult::success(&request.execution_id, value, 1))
            }
            FakeBehavior::Fail(error) => Ok(ExecutionResult::failed(&request.execution_id, error, 1)),
            FakeBehavior::Delay(delay, value) => {
                if self.wait_or_killed(Some(delay)).await {
                    Ok(ExecutionResult::success(
                        &request.execution_id,
                        value,
                        delay.as_millis() as u64,
                    ))
                } else {
                    Err(EngineError::WorkerProtocol("Worker killed".to_string()))
                }
            }
            FakeBehavior::Hang => {
                self.wait_or_killed(None).await;
                Err(EngineError::WorkerProtocol("Worker killed".to_string()))
            }
            FakeBehavior::Crash => {
                self.crash();
                Err(EngineError::WorkerProtocol("Worker closed its output".to_string()))
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kill(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> Result<()> {
        self.kill()
    }

    fn memory_mb(&self) -> Option<u64> {
        match self.memory_mb.load(Ordering::SeqCst) {
            0 => None,
            mb => Some(mb),
        }
    }
}

/// Launcher producing [`FakeHandle`]s that share one script
pub struct FakeLauncher {
    script: Script,
    next_pid: AtomicU32,
    fail: AtomicBool,
    launched: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            next_pid: AtomicU32::new(10_000),
            fail: AtomicBool::new(false),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(echo_script())
    }

    /// Make subsequent launches fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<Arc<FakeHandle>> {
        self.launched.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }

    pub fn by_pid(&self, pid: u32) -> Option<Arc<FakeHandle>> {
        self.launched.lock().iter().find(|h| h.pid == pid).cloned()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn WorkerHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::ProcessSpawnFailed("launch disabled".to_string()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FakeHandle::with_script(pid, self.script.clone()));
        self.launched.lock().push(handle.clone());
        Ok(handle)
    }
}
