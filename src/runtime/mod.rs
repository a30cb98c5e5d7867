// src/runtime/mod.rs
//! Workflow execution runtime
//!
//! - **Process Pool**: pooled worker processes with an explicit state machine
//! - **Process Table**: IDLE/BUSY/KILLED bookkeeping with compare-and-set transitions
//! - **Process Manager**: spawning and signalling worker processes
//! - **Resource Limiter**: memory and rotation limits that trigger recycling
//! - **Sandbox**: embedded interpreter running workspace code
//! - **Worker**: the worker-side protocol loop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── supervisor ────────────────────────┐
//! │  ProcessPool ── ProcessTable ── ResourceLimiter            │
//! │      │  execute(workflow, input) with deadline             │
//! └──────┼─────────────────────────────────────────────────────┘
//!        │ newline-delimited JSON over stdin/stdout
//! ┌──────▼───────────┐  ┌──────────────────┐
//! │ worker process   │  │ worker process   │  ...
//! │  Sandbox (boa)   │  │  Sandbox (boa)   │
//! │  MetaPath chain  │  │  MetaPath chain  │
//! └──────────────────┘  └──────────────────┘
//! ```

pub mod pool;
pub mod process_manager;
pub mod process_table;
pub mod protocol;
pub mod resource_limiter;
pub mod sandbox;
pub mod testing;
pub mod worker;

// Re-export commonly used types
pub use pool::{PoolCommand, PoolConfig, PoolRecord, ProcessPool, RecycleOutcome, WorkflowExecutor};
pub use process_manager::{ProcessLauncher, SpawnConfig, WorkerHandle, WorkerLauncher};
pub use process_table::{ProcessRecord, ProcessState, ProcessTable};
pub use protocol::{ExecutionError, ExecutionResult, ExecutionStatus, WorkflowRef};
pub use resource_limiter::{ResourceLimiter, ResourceLimits};
pub use sandbox::{Sandbox, SandboxConfig};
