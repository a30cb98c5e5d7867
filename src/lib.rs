// src/lib.rs
//! Workflow Runtime
//!
//! Runs user-authored workflows on demand, on a schedule or in response to
//! inbound events, without redeploying the service.
//!
//! # Architecture
//!
//! - **modules**: layered module cache, resolver chain and import boundary guard
//! - **runtime**: worker process pool, worker protocol and embedded interpreter
//! - **events**: cron scheduler, webhook ingestion and the delivery queue
//! - **store**: shared cache/queue store (Redis, or in-process)
//! - **alerts**: operator alerts on the shared store
//! - **admin**: pool and queue views, recycle requests
//! - **observability**: logging and metrics setup
//! - **utils**: configuration, errors, hashing

pub mod admin;
pub mod alerts;
pub mod events;
pub mod modules;
pub mod observability;
pub mod runtime;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use events::{DeliveryProcessor, EventIngestor, EventStore, Scheduler};
pub use modules::{ImportBoundaryGuard, ModuleCache};
pub use runtime::pool::{PoolConfig, ProcessPool};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
