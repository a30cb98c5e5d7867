// src/runtime/resource_limiter.rs
//! Recycling limits for worker processes
//!
//! Two limits trigger a planned recycle of an IDLE process:
//! - Memory: resident set size sampled from `/proc/<pid>/status`
//! - Rotation: number of completed executions

use crate::utils::config::PoolSettings;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Limits applied to every process of a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Recycle when RSS exceeds this many megabytes
    pub memory_limit_mb: Option<u64>,

    /// Recycle after this many completed executions
    pub max_executions: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: Some(512),
            max_executions: Some(500),
        }
    }
}

impl ResourceLimits {
    /// Zero in settings means "no limit"
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            memory_limit_mb: Some(settings.memory_limit_mb).filter(|mb| *mb > 0),
            max_executions: Some(settings.max_executions_per_process).filter(|n| *n > 0),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            memory_limit_mb: None,
            max_executions: None,
        }
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if let Some(memory) = self.memory_limit_mb {
            if memory < 16 {
                return Err("Memory limit cannot be less than 16MB".to_string());
            }
        }
        if self.max_executions == Some(0) {
            return Err("Execution limit cannot be 0".to_string());
        }
        Ok(())
    }
}

/// A limit a process has crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBreach {
    Memory { used_mb: u64, limit_mb: u64 },
    Executions { completed: u64, limit: u64 },
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitBreach::Memory { used_mb, limit_mb } => {
                write!(f, "memory {}MB exceeds limit {}MB", used_mb, limit_mb)
            }
            LimitBreach::Executions { completed, limit } => {
                write!(f, "completed {} executions (limit {})", completed, limit)
            }
        }
    }
}

/// Evaluates processes against [`ResourceLimits`]
#[derive(Debug, Clone, Default)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn check_memory(&self, used_mb: Option<u64>) -> Option<LimitBreach> {
        let limit_mb = self.limits.memory_limit_mb?;
        let used_mb = used_mb?;
        (used_mb > limit_mb).then_some(LimitBreach::Memory { used_mb, limit_mb })
    }

    pub fn check_executions(&self, completed: u64) -> Option<LimitBreach> {
        let limit = self.limits.max_executions?;
        (completed >= limit).then_some(LimitBreach::Executions { completed, limit })
    }
}

/// Extract `VmRSS` (kB) from the contents of `/proc/<pid>/status`
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Resident set size of `pid` in MB
#[cfg(target_os = "linux")]
pub fn sample_rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb / 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_rss_mb(_pid: u32) -> Option<u64> {
    None
}
