// src/modules/hook.rs
//! Virtual import hook
//!
//! Resolves dotted names to workspace source held in the module cache. Only
//! paths present in the module index are fetched, so names the workspace
//! never pushed fall through to the platform finder without store traffic.

use crate::modules::cache::ModuleCache;
use crate::modules::meta_path::{FinderId, MetaPath, ModuleFinder};
use crate::modules::{module_candidates, ImportError, ImportRequest, ModuleOrigin, ModuleSpec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Resolver serving workspace modules from the [`ModuleCache`]
pub struct CacheImportHook {
    cache: Arc<ModuleCache>,
    extension: String,
    package_file: String,
}

impl CacheImportHook {
    pub fn new(
        cache: Arc<ModuleCache>,
        extension: impl Into<String>,
        package_file: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            extension: extension.into(),
            package_file: package_file.into(),
        }
    }

    /// Place the hook ahead of the standard resolvers (behind any guards)
    pub fn install(self: Arc<Self>, meta_path: &MetaPath) -> FinderId {
        let id = meta_path.install_front(self);
        info!("Module cache import hook installed ({})", id);
        id
    }

    /// Uninstall the hook installed as `id`; other finders are untouched
    pub fn remove(meta_path: &MetaPath, id: FinderId) -> bool {
        meta_path.remove(id)
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }
}

#[async_trait]
impl ModuleFinder for CacheImportHook {
    fn name(&self) -> &str {
        "module-cache"
    }

    async fn find_spec(
        &self,
        request: &ImportRequest<'_>,
    ) -> Result<Option<ModuleSpec>, ImportError> {
        for (path, is_package) in module_candidates(request.name, &self.extension, &self.package_file)
        {
            if !self.cache.is_indexed(&path).await {
                continue;
            }

            match self.cache.get(&path).await {
                Some(cached) => {
                    debug!("{} -> {} ({:?})", request.name, path, cached.tier);
                    return Ok(Some(ModuleSpec {
                        name: request.name.to_string(),
                        logical_path: path,
                        source: cached.entry.content,
                        content_hash: cached.entry.content_hash,
                        origin: ModuleOrigin::Workspace,
                        is_package,
                    }));
                }
                None => debug!("{} is indexed but unavailable, declining", path),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::cache::ModuleCacheConfig;
    use crate::modules::origin::{CodeOrigin, MemoryOrigin};
    use crate::store::MemoryStore;

    async fn setup() -> (MetaPath, Arc<ModuleCache>) {
        let cache = Arc::new(ModuleCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryOrigin::new()) as Arc<dyn CodeOrigin>,
            ModuleCacheConfig::default(),
        ));
        (MetaPath::new(), cache)
    }

    #[tokio::test]
    async fn test_resolves_module_and_package() {
        let (meta, cache) = setup().await;
        cache.push("workflows/billing.js", "exports.a = 1;").await.unwrap();
        cache.push("shared/index.js", "exports.b = 2;").await.unwrap();
        Arc::new(CacheImportHook::new(cache, "js", "index")).install(&meta);

        let module = meta.import("workflows.billing", None).await.unwrap();
        assert_eq!(module.logical_path, "workflows/billing.js");
        assert!(!module.is_package);
        assert_eq!(module.origin, ModuleOrigin::Workspace);

        let package = meta.import("shared", None).await.unwrap();
        assert_eq!(package.logical_path, "shared/index.js");
        assert!(package.is_package);
    }

    #[tokio::test]
    async fn test_unindexed_name_declines() {
        let (meta, cache) = setup().await;
        Arc::new(CacheImportHook::new(cache, "js", "index")).install(&meta);

        let err = meta.import("json", None).await.unwrap_err();
        assert_eq!(err.kind(), "ModuleNotFoundError");
    }

    #[tokio::test]
    async fn test_remove_uninstalls_only_the_hook() {
        let (meta, cache) = setup().await;
        let first = Arc::new(CacheImportHook::new(cache.clone(), "js", "index")).install(&meta);
        let second = Arc::new(CacheImportHook::new(cache, "js", "index")).install(&meta);
        assert_eq!(meta.len(), 2);

        assert!(CacheImportHook::remove(&meta, first));
        assert!(!meta.contains(first));
        assert!(meta.contains(second));
        assert!(!CacheImportHook::remove(&meta, first));
    }
}
