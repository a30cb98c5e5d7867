// src/runtime/process_table.rs
//! Process table and state machine
//!
//! ```text
//!   spawn ──▶ IDLE ◀──────▶ BUSY
//!              │              │
//!              └──▶ KILLED ◀──┘   (terminal)
//! ```
//!
//! Every state change goes through [`ProcessTable::transition`] (or a helper
//! built on the same compare-and-set), so a command can never move a process
//! the dispatcher has already claimed.

use crate::runtime::process_manager::WorkerHandle;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Idle,
    Busy,
    Killed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Idle => "IDLE",
            ProcessState::Busy => "BUSY",
            ProcessState::Killed => "KILLED",
        }
    }

    /// Edges of the state machine
    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        matches!(
            (self, next),
            (ProcessState::Idle, ProcessState::Busy)
                | (ProcessState::Busy, ProcessState::Idle)
                | (ProcessState::Idle, ProcessState::Killed)
                | (ProcessState::Busy, ProcessState::Killed)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-process snapshot embedded in the pool heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: String,
    pub pid: u32,
    pub state: ProcessState,

    /// Set iff BUSY
    pub current_execution_id: Option<String>,

    pub executions_completed: u64,
    pub uptime_seconds: u64,
    pub memory_mb: Option<u64>,
}

struct Slot {
    pid: u32,
    state: ProcessState,
    current_execution_id: Option<String>,
    executions_completed: u64,
    started_at: Instant,
    memory_mb: Option<u64>,
    handle: Arc<dyn WorkerHandle>,
}

impl Slot {
    fn record(&self, process_id: &str) -> ProcessRecord {
        ProcessRecord {
            process_id: process_id.to_string(),
            pid: self.pid,
            state: self.state,
            current_execution_id: self.current_execution_id.clone(),
            executions_completed: self.executions_completed,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            memory_mb: self.memory_mb,
        }
    }

    fn apply(&mut self, process_id: &str, expected: ProcessState, next: ProcessState) -> Result<()> {
        if self.state != expected || !expected.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                process_id: process_id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next != ProcessState::Busy {
            self.current_execution_id = None;
        }
        Ok(())
    }
}

/// A process claimed for one execution
pub struct Claimed {
    pub process_id: String,
    pub pid: u32,
    pub handle: Arc<dyn WorkerHandle>,
}

/// Table of every process owned by one pool
#[derive(Default)]
pub struct ProcessTable {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned process as IDLE; returns its new process_id
    pub fn insert(&self, handle: Arc<dyn WorkerHandle>) -> String {
        let process_id = format!("proc_{}", ulid::Ulid::new());
        let slot = Slot {
            pid: handle.pid(),
            state: ProcessState::Idle,
            current_execution_id: None,
            executions_completed: 0,
            started_at: Instant::now(),
            memory_mb: None,
            handle,
        };
        debug!("Registered process {} (pid {})", process_id, slot.pid);
        self.slots.lock().insert(process_id.clone(), slot);
        process_id
    }

    /// The single compare-and-set transition function
    pub fn transition(&self, process_id: &str, expected: ProcessState, next: ProcessState) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(process_id)
            .ok_or_else(|| EngineError::NotFound(format!("process {}", process_id)))?;
        slot.apply(process_id, expected, next)
    }

    /// Claim any IDLE process for `execution_id` (IDLE → BUSY)
    pub fn claim_idle(&self, execution_id: &str) -> Option<Claimed> {
        let mut slots = self.slots.lock();
        let (process_id, slot) = slots
            .iter_mut()
            .find(|(_, slot)| slot.state == ProcessState::Idle)?;
        slot.apply(process_id, ProcessState::Idle, ProcessState::Busy).ok()?;
        slot.current_execution_id = Some(execution_id.to_string());
        Some(Claimed {
            process_id: process_id.clone(),
            pid: slot.pid,
            handle: slot.handle.clone(),
        })
    }

    /// BUSY → IDLE after a completed execution; returns the new completion count
    pub fn release(&self, process_id: &str) -> Result<u64> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(process_id)
            .ok_or_else(|| EngineError::NotFound(format!("process {}", process_id)))?;
        slot.apply(process_id, ProcessState::Busy, ProcessState::Idle)?;
        slot.executions_completed += 1;
        Ok(slot.executions_completed)
    }

    /// `expected` → KILLED; hands back the handle so the caller can terminate it
    pub fn mark_killed(
        &self,
        process_id: &str,
        expected: ProcessState,
    ) -> Result<Arc<dyn WorkerHandle>> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(process_id)
            .ok_or_else(|| EngineError::NotFound(format!("process {}", process_id)))?;
        slot.apply(process_id, expected, ProcessState::Killed)?;
        Ok(slot.handle.clone())
    }

    pub fn state(&self, process_id: &str) -> Option<ProcessState> {
        self.slots.lock().get(process_id).map(|s| s.state)
    }

    pub fn handle(&self, process_id: &str) -> Option<Arc<dyn WorkerHandle>> {
        self.slots.lock().get(process_id).map(|s| s.handle.clone())
    }

    /// Resolve an OS pid to the live (or most recent) process_id using it
    pub fn find_by_pid(&self, pid: u32) -> Option<String> {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|(_, s)| s.pid == pid)
            .max_by_key(|(_, s)| s.state != ProcessState::Killed)
            .map(|(id, _)| id.clone())
    }

    pub fn set_memory(&self, process_id: &str, memory_mb: Option<u64>) {
        if let Some(slot) = self.slots.lock().get_mut(process_id) {
            slot.memory_mb = memory_mb;
        }
    }

    /// `(process_id, pid, handle)` of every process in `state`
    pub fn in_state(&self, state: ProcessState) -> Vec<(String, u32, Arc<dyn WorkerHandle>)> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(id, s)| (id.clone(), s.pid, s.handle.clone()))
            .collect()
    }

    pub fn count(&self, state: ProcessState) -> usize {
        self.slots.lock().values().filter(|s| s.state == state).count()
    }

    /// IDLE + BUSY
    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.state != ProcessState::Killed)
            .count()
    }

    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        self.slots
            .lock()
            .iter()
            .map(|(id, slot)| slot.record(id))
            .collect()
    }

    /// Forget KILLED processes; their ids are never reused
    pub fn prune_killed(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, s| s.state != ProcessState::Killed);
        before - slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::FakeHandle;

    fn table_with(n: usize) -> (ProcessTable, Vec<String>) {
        let table = ProcessTable::new();
        let ids = (0..n)
            .map(|i| table.insert(Arc::new(FakeHandle::new(1000 + i as u32))))
            .collect();
        (table, ids)
    }

    #[test]
    fn test_edges() {
        use ProcessState::*;
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Killed));
        assert!(Busy.can_transition_to(Killed));
        assert!(!Killed.can_transition_to(Idle));
        assert!(!Killed.can_transition_to(Busy));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn test_cas_rejects_stale_expectation() {
        let (table, ids) = table_with(1);
        table.transition(&ids[0], ProcessState::Idle, ProcessState::Busy).unwrap();

        let err = table
            .transition(&ids[0], ProcessState::Idle, ProcessState::Killed)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(table.state(&ids[0]), Some(ProcessState::Busy));
    }

    #[test]
    fn test_killed_is_terminal() {
        let (table, ids) = table_with(1);
        table.mark_killed(&ids[0], ProcessState::Idle).unwrap();

        for next in [ProcessState::Idle, ProcessState::Busy, ProcessState::Killed] {
            assert!(table.transition(&ids[0], ProcessState::Killed, next).is_err());
        }
        assert!(table.claim_idle("exec").is_none());
    }

    #[test]
    fn test_claim_and_release() {
        let (table, _) = table_with(2);
        let first = table.claim_idle("exec_1").unwrap();
        let second = table.claim_idle("exec_2").unwrap();
        assert_ne!(first.process_id, second.process_id);
        assert!(table.claim_idle("exec_3").is_none());

        let record = table
            .snapshot()
            .into_iter()
            .find(|r| r.process_id == first.process_id)
            .unwrap();
        assert_eq!(record.current_execution_id.as_deref(), Some("exec_1"));

        assert_eq!(table.release(&first.process_id).unwrap(), 1);
        assert_eq!(table.count(ProcessState::Idle), 1);
        assert!(table.release(&first.process_id).is_err());
    }

    #[test]
    fn test_prune_and_find_by_pid() {
        let (table, ids) = table_with(2);
        assert_eq!(table.find_by_pid(1001).as_deref(), Some(ids[1].as_str()));

        table.mark_killed(&ids[0], ProcessState::Idle).unwrap();
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.prune_killed(), 1);
        assert!(table.state(&ids[0]).is_none());
    }
}
