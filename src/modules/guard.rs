// src/modules/guard.rs
//! Import boundary guard
//!
//! A guard never resolves anything. It sits ahead of every resolver and
//! rejects imports of platform-internal namespaces made by workspace code.
//!
//! Rules, evaluated in order:
//!
//! 1. Name under an allowed SDK export → allow
//! 2. Name not under any blocked prefix → allow
//! 3. Caller unknown → allow
//! 4. Caller under a platform root → allow
//! 5. Caller under a home root → block
//! 6. Otherwise → allow

use crate::modules::meta_path::{FinderId, FinderRole, MetaPath, ModuleFinder};
use crate::modules::{BoundaryViolation, ImportError, ImportRequest, ModuleSpec};
use crate::utils::config::GuardSettings;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Guard rules
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Dotted namespaces closed to workspace code
    pub blocked_prefixes: Vec<String>,

    /// Names that always pass, whoever the caller
    pub allowed_exports: Vec<String>,

    /// Logical-path roots of workspace code (`""` matches every path)
    pub home_roots: Vec<String>,

    /// Logical-path roots of trusted first-party code
    pub platform_roots: Vec<String>,

    /// Remediation appended to every violation
    pub sdk_hint: String,
}

impl From<&GuardSettings> for GuardConfig {
    fn from(settings: &GuardSettings) -> Self {
        let sdk_hint = match settings.allowed_exports.as_slice() {
            [] => "Workspace code has no access to platform internals.".to_string(),
            exports => format!(
                "Use the platform SDK instead: {}.",
                exports
                    .iter()
                    .map(|e| format!("require(\"{}\")", e))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };

        Self {
            blocked_prefixes: settings.blocked_prefixes.clone(),
            allowed_exports: settings.allowed_exports.clone(),
            home_roots: settings.home_roots.clone(),
            platform_roots: settings.platform_roots.clone(),
            sdk_hint,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from(&GuardSettings::default())
    }
}

/// `name` equals `prefix` or lives below it, on whole dotted segments
pub fn matches_prefix(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// `path` is `root` or lies below it on a `/` boundary
///
/// The empty root matches every path: with `home_roots = [""]` all code outside
/// the platform roots counts as workspace code.
fn under_root(path: &str, root: &str) -> bool {
    if root.is_empty() {
        return true;
    }
    match path.strip_prefix(root) {
        Some(rest) => root.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Denying finder enforcing the workspace/platform boundary
pub struct ImportBoundaryGuard {
    config: GuardConfig,
}

impl ImportBoundaryGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Install ahead of every resolver; returns the handle for [`MetaPath::remove`]
    pub fn install(meta_path: &MetaPath, config: GuardConfig) -> FinderId {
        let id = meta_path.install_front(Arc::new(Self::new(config)));
        info!("Import boundary guard installed ({})", id);
        id
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// `caller_file` is `None` only for host-originated imports; the sandbox
    /// always passes the logical path of the requiring module.
    pub fn should_block(&self, name: &str, caller_file: Option<&str>) -> bool {
        let config = &self.config;

        if config.allowed_exports.iter().any(|e| matches_prefix(name, e)) {
            return false;
        }
        if !config.blocked_prefixes.iter().any(|p| matches_prefix(name, p)) {
            return false;
        }
        let caller = match caller_file {
            Some(caller) => caller,
            None => return false,
        };
        if config.platform_roots.iter().any(|r| under_root(caller, r)) {
            return false;
        }
        config.home_roots.iter().any(|r| under_root(caller, r))
    }
}

#[async_trait]
impl ModuleFinder for ImportBoundaryGuard {
    fn name(&self) -> &str {
        "import-boundary-guard"
    }

    fn role(&self) -> FinderRole {
        FinderRole::Guard
    }

    fn check(&self, request: &ImportRequest<'_>) -> Result<(), ImportError> {
        if !self.should_block(request.name, request.caller_file) {
            return Ok(());
        }

        let caller_file = request.caller_file.unwrap_or_default().to_string();
        warn!("Blocked import of {} from {}", request.name, caller_file);
        metrics::counter!("import_boundary_violations_total").increment(1);

        Err(ImportError::Boundary(BoundaryViolation {
            module: request.name.to_string(),
            caller_file,
            hint: self.config.sdk_hint.clone(),
        }))
    }

    async fn find_spec(
        &self,
        request: &ImportRequest<'_>,
    ) -> Result<Option<ModuleSpec>, ImportError> {
        self.check(request)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::platform::PLATFORM_ROOT;
    use proptest::prelude::*;

    fn guard() -> ImportBoundaryGuard {
        ImportBoundaryGuard::new(GuardConfig::default())
    }

    #[test]
    fn test_matches_whole_segments() {
        assert!(matches_prefix("platform", "platform"));
        assert!(matches_prefix("platform.internal.db", "platform"));
        assert!(!matches_prefix("platforms", "platform"));
        assert!(!matches_prefix("plat", "platform"));
    }

    #[test]
    fn test_home_caller_blocked() {
        assert!(guard().should_block("platform.internal.db", Some("workflows/report.js")));
    }

    #[test]
    fn test_platform_caller_allowed() {
        let caller = format!("{}platform/sdk.js", PLATFORM_ROOT);
        assert!(!guard().should_block("platform.internal.db", Some(&caller)));
    }

    #[test]
    fn test_roots_match_on_path_boundaries() {
        assert!(under_root("workspace/a.js", "workspace"));
        assert!(under_root("workspace", "workspace"));
        assert!(!under_root("workspaces/a.js", "workspace"));
        assert!(under_root("workspace/a.js", "workspace/"));
        assert!(!under_root("workspace.js", "workspace/"));
        assert!(under_root("anything/at/all.js", ""));

        let config = GuardConfig {
            home_roots: vec!["workspace".to_string()],
            ..GuardConfig::default()
        };
        let guard = ImportBoundaryGuard::new(config);
        assert!(guard.should_block("platform.db", Some("workspace/a.js")));
        assert!(!guard.should_block("platform.db", Some("workspaces/a.js")));
    }

    #[test]
    fn test_host_import_without_caller_allowed() {
        assert!(!guard().should_block("platform.internal.db", None));
    }

    #[test]
    fn test_sdk_always_allowed() {
        assert!(!guard().should_block("platform.sdk", Some("workflows/report.js")));
        assert!(!guard().should_block("platform.sdk.http", Some("workflows/report.js")));
    }

    #[test]
    fn test_caller_outside_home_allowed() {
        let config = GuardConfig {
            home_roots: vec!["workspace/".to_string()],
            ..GuardConfig::default()
        };
        let guard = ImportBoundaryGuard::new(config);
        assert!(guard.should_block("platform.db", Some("workspace/a.js")));
        assert!(!guard.should_block("platform.db", Some("vendor/a.js")));
    }

    #[test]
    fn test_violation_carries_hint() {
        let request = ImportRequest::new("platform.internal.db", Some("workflows/a.js"));
        match guard().check(&request) {
            Err(ImportError::Boundary(violation)) => {
                assert_eq!(violation.module, "platform.internal.db");
                assert_eq!(violation.caller_file, "workflows/a.js");
                assert!(violation.hint.contains("platform.sdk"));
            }
            other => panic!("expected boundary error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nested_guards_individually_removable() {
        let meta = MetaPath::new();
        let outer = ImportBoundaryGuard::install(&meta, GuardConfig::default());
        let inner = ImportBoundaryGuard::install(
            &meta,
            GuardConfig {
                blocked_prefixes: vec!["vendor".to_string()],
                ..GuardConfig::default()
            },
        );

        assert!(meta.check("vendor.x", Some("a.js")).is_err());
        assert!(meta.remove(inner));
        assert!(meta.check("vendor.x", Some("a.js")).is_ok());
        assert!(meta.check("platform.x", Some("a.js")).is_err());
        assert!(meta.remove(outer));
        assert!(meta.is_empty());
    }

    proptest! {
        #[test]
        fn prop_scope_sensitivity(
            tail in proptest::collection::vec("[a-z][a-z0-9_]{0,8}", 0..4),
            file in "[a-z]{1,8}/[a-z]{1,8}\\.js",
        ) {
            let mut segments = vec!["platform".to_string(), "internal".to_string()];
            segments.extend(tail);
            let name = segments.join(".");
            let guard = guard();

            prop_assert!(guard.should_block(&name, Some(&file)));
            let platform_file = format!("{}{}", PLATFORM_ROOT, file);
            prop_assert!(!guard.should_block(&name, Some(&platform_file)));
        }

        #[test]
        fn prop_sibling_namespace_not_matched(suffix in "[a-z0-9_]{1,8}") {
            let name = format!("platform{}", suffix);
            prop_assert!(!matches_prefix(&name, "platform"));
            prop_assert!(!guard().should_block(&name, Some("workflows/a.js")));
        }
    }
}
