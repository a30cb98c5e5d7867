// src/modules/meta_path.rs
//! Ordered, pluggable resolver chain
//!
//! Finders are consulted in order; the first one returning a spec wins and an
//! error from any finder aborts the import. Guards always sit ahead of
//! resolvers regardless of installation order.

use crate::modules::{validate_module_name, ImportError, ImportRequest, ModuleSpec};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Position class of a finder in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderRole {
    /// Denies imports; never resolves
    Guard,
    /// Resolves imports to source
    Resolver,
}

/// A single resolver in the chain
#[async_trait]
pub trait ModuleFinder: Send + Sync + 'static {
    /// Name reported by [`MetaPath::finder_names`]
    fn name(&self) -> &str;

    fn role(&self) -> FinderRole {
        FinderRole::Resolver
    }

    /// Synchronous admission check, run for every import including ones
    /// already loaded by the caller's execution
    fn check(&self, _request: &ImportRequest<'_>) -> Result<(), ImportError> {
        Ok(())
    }

    /// `Ok(None)` declines and lets the next finder try
    async fn find_spec(&self, request: &ImportRequest<'_>)
        -> Result<Option<ModuleSpec>, ImportError>;
}

/// Handle identifying one installed finder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinderId(u64);

impl fmt::Display for FinderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "finder-{}", self.0)
    }
}

type Entry = (FinderId, Arc<dyn ModuleFinder>);

/// The resolver chain
#[derive(Default)]
pub struct MetaPath {
    finders: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl MetaPath {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> FinderId {
        FinderId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Install at the highest priority allowed by the finder's role.
    ///
    /// Guards go to the very front; resolvers go directly behind the last guard.
    pub fn install_front(&self, finder: Arc<dyn ModuleFinder>) -> FinderId {
        let id = self.allocate_id();
        let mut finders = self.finders.write();
        let position = match finder.role() {
            FinderRole::Guard => 0,
            FinderRole::Resolver => finders
                .iter()
                .take_while(|(_, f)| f.role() == FinderRole::Guard)
                .count(),
        };
        debug!("Installing {} ({}) at position {}", finder.name(), id, position);
        finders.insert(position, (id, finder));
        id
    }

    /// Install at the lowest priority
    pub fn install_back(&self, finder: Arc<dyn ModuleFinder>) -> FinderId {
        let id = self.allocate_id();
        let mut finders = self.finders.write();
        debug!("Installing {} ({}) at the back", finder.name(), id);
        finders.push((id, finder));
        id
    }

    /// Remove exactly the finder installed under `id`
    pub fn remove(&self, id: FinderId) -> bool {
        let mut finders = self.finders.write();
        let before = finders.len();
        finders.retain(|(fid, _)| *fid != id);
        let removed = finders.len() != before;
        if removed {
            debug!("Removed {}", id);
        }
        removed
    }

    pub fn contains(&self, id: FinderId) -> bool {
        self.finders.read().iter().any(|(fid, _)| *fid == id)
    }

    /// Finder names in resolution order
    pub fn finder_names(&self) -> Vec<String> {
        self.finders
            .read()
            .iter()
            .map(|(_, f)| f.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.finders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ModuleFinder>> {
        self.finders.read().iter().map(|(_, f)| f.clone()).collect()
    }

    /// Run every finder's admission check without resolving
    pub fn check(&self, name: &str, caller_file: Option<&str>) -> Result<(), ImportError> {
        validate_module_name(name)?;
        let request = ImportRequest::new(name, caller_file);
        for finder in self.snapshot() {
            finder.check(&request)?;
        }
        Ok(())
    }

    /// Resolve `name` on behalf of `caller_file`
    pub async fn import(
        &self,
        name: &str,
        caller_file: Option<&str>,
    ) -> Result<ModuleSpec, ImportError> {
        validate_module_name(name)?;
        let request = ImportRequest::new(name, caller_file);

        for finder in self.snapshot() {
            finder.check(&request)?;
            if let Some(spec) = finder.find_spec(&request).await? {
                trace!("{} resolved by {} -> {}", name, finder.name(), spec.logical_path);
                return Ok(spec);
            }
        }

        Err(ImportError::NotFound {
            name: name.to_string(),
        })
    }
}
