// src/utils/mod.rs
//! Common utilities shared by every subsystem
//!
//! - **config**: Layered engine configuration (defaults, file, environment)
//! - **errors**: Crate-wide error type and `Result` alias
//! - **hashing**: Content digests for cached source

pub mod config;
pub mod errors;
pub mod hashing;

pub use self::config::EngineConfig;
pub use errors::{EngineError, Result};
