// src/modules/origin.rs
//! Code origin: object storage holding workspace source by logical path
//!
//! The write side (`put_object`) belongs to the code-distribution subsystem;
//! the engine itself only reads.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Object storage for source code
#[async_trait]
pub trait CodeOrigin: Send + Sync + 'static {
    /// Read the object at `path`; `Ok(None)` when it does not exist
    async fn get_object(&self, path: &str) -> Result<Option<Bytes>>;

    /// Write the object at `path`
    async fn put_object(&self, path: &str, data: Bytes) -> Result<()>;
}

/// Origin backed by a local directory (or a mounted bucket)
#[derive(Debug, Clone)]
pub struct FsOrigin {
    root: PathBuf,
}

impl FsOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a logical path under the root, refusing anything that could escape it
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(EngineError::Origin(format!("Invalid logical path: {:?}", path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl CodeOrigin for FsOrigin {
    async fn get_object(&self, path: &str) -> Result<Option<Bytes>> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => {
                debug!("Read {} bytes from origin {:?}", data.len(), file);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Origin(format!("Failed to read {:?}: {}", file, e))),
        }
    }

    async fn put_object(&self, path: &str, data: Bytes) -> Result<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::Origin(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }
        tokio::fs::write(&file, &data)
            .await
            .map_err(|e| EngineError::Origin(format!("Failed to write {:?}: {}", file, e)))
    }
}

/// In-memory origin for tests and embedded use
#[derive(Debug, Clone, Default)]
pub struct MemoryOrigin {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl CodeOrigin for MemoryOrigin {
    async fn get_object(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.read().await.get(path).cloned())
    }

    async fn put_object(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects.write().await.insert(path.to_string(), data);
        Ok(())
    }
}
