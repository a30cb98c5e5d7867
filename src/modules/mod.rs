// src/modules/mod.rs
//! Workspace code distribution and import resolution
//!
//! - **Origin**: object-storage source of truth for module bytes
//! - **EntryCodec**: byte framing for hot-tier entries
//! - **Module Cache**: read-through cache (hot tier → origin) plus module index
//! - **MetaPath**: ordered, pluggable resolver chain
//! - **Import Hook**: resolver serving workspace modules from the cache
//! - **Boundary Guard**: resolver that denies platform-internal imports to workspace code
//! - **Platform modules**: the standard resolver for trusted first-party modules
//!
//! # Resolver chain
//!
//! ```text
//! require("workflows.billing")
//!        │
//!        ▼
//! ┌────────────────┐  Err(Boundary)  ┌──────────────────┐
//! │ Boundary Guard │ ──────────────▶ │ ImportBoundary   │
//! └────────────────┘                 │ error to caller  │
//!        │ decline                   └──────────────────┘
//!        ▼
//! ┌────────────────┐  hit   ┌──────────────┐
//! │  Import Hook   │ ─────▶ │ Module Cache │ ── miss ──▶ origin
//! └────────────────┘        └──────────────┘
//!        │ decline
//!        ▼
//! ┌────────────────┐
//! │ Platform finder│ ── decline ──▶ ModuleNotFound
//! └────────────────┘
//! ```

pub mod cache;
pub mod entry_codec;
pub mod guard;
pub mod hook;
pub mod meta_path;
pub mod origin;
pub mod platform;

pub use cache::{CachedModule, ModuleCache, ModuleCacheConfig, ModuleCacheEntry};
pub use guard::{GuardConfig, ImportBoundaryGuard};
pub use hook::CacheImportHook;
pub use meta_path::{FinderId, MetaPath, ModuleFinder};
pub use origin::{CodeOrigin, FsOrigin, MemoryOrigin};
pub use platform::PlatformFinder;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a resolved module came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleOrigin {
    /// Served from the module cache (untrusted workspace code)
    Workspace,
    /// Registered first-party module
    Platform,
}

/// A resolved module, ready to be compiled and executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Fully-qualified dotted name
    pub name: String,

    /// Logical path; becomes the module's `__file__`
    pub logical_path: String,

    /// Module source
    pub source: String,

    /// Digest of `source`
    pub content_hash: String,

    pub origin: ModuleOrigin,

    /// Resolved through the package file (`a/b/index.js`)
    pub is_package: bool,
}

/// One import being resolved
#[derive(Debug, Clone, Copy)]
pub struct ImportRequest<'a> {
    /// Fully-qualified dotted name being imported
    pub name: &'a str,

    /// Logical path of the importing module, when known
    pub caller_file: Option<&'a str>,
}

impl<'a> ImportRequest<'a> {
    pub fn new(name: &'a str, caller_file: Option<&'a str>) -> Self {
        Self { name, caller_file }
    }
}

/// A blocked import, with the sanctioned alternative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryViolation {
    pub module: String,
    pub caller_file: String,
    pub hint: String,
}

impl fmt::Display for BoundaryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Import of '{}' is not allowed from workspace code ({}). {}",
            self.module, self.caller_file, self.hint
        )
    }
}

/// Import resolution failures
///
/// `Boundary` is a contract violation and is never retried or collapsed into
/// `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("No module named '{name}'")]
    NotFound { name: String },

    #[error("{0}")]
    Boundary(BoundaryViolation),

    #[error("Invalid module name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl ImportError {
    /// Error type name surfaced to workspace code and execution results
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::NotFound { .. } => "ModuleNotFoundError",
            ImportError::Boundary(_) => "ImportBoundaryError",
            ImportError::InvalidName { .. } => "ImportError",
        }
    }
}

/// Check that `name` is a well-formed dotted module name
pub fn validate_module_name(name: &str) -> std::result::Result<(), ImportError> {
    let invalid = |reason: &str| ImportError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("segments may only contain letters, digits, '_' and '-'"));
        }
    }
    Ok(())
}

/// Logical paths a module name may live at, in resolution order.
///
/// `a.b.c` → `a/b/c.<ext>` (module), then `a/b/c/<package_file>.<ext>` (package).
pub fn module_candidates(name: &str, extension: &str, package_file: &str) -> [(String, bool); 2] {
    let base = name.replace('.', "/");
    [
        (format!("{}.{}", base, extension), false),
        (format!("{}/{}.{}", base, package_file, extension), true),
    ]
}

/// Inverse of [`module_candidates`]: the dotted name served at `path`
pub fn module_name_for_path(path: &str, extension: &str, package_file: &str) -> Option<String> {
    let stem = path.strip_suffix(&format!(".{}", extension))?;
    let stem = match stem.strip_suffix(&format!("/{}", package_file)) {
        Some(package) => package,
        None => stem,
    };
    let name = stem.replace('/', ".");
    validate_module_name(&name).ok()?;
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_module_name() {
        assert!(validate_module_name("workflows.billing.sync").is_ok());
        assert!(validate_module_name("shared_utils").is_ok());
        assert!(validate_module_name("").is_err());
        assert!(validate_module_name("a..b").is_err());
        assert!(validate_module_name("../etc/passwd").is_err());
        assert!(validate_module_name("a/b").is_err());
    }

    #[test]
    fn test_module_candidates() {
        let [module, package] = module_candidates("a.b.c", "js", "index");
        assert_eq!(module, ("a/b/c.js".to_string(), false));
        assert_eq!(package, ("a/b/c/index.js".to_string(), true));
    }

    #[test]
    fn test_module_name_for_path() {
        assert_eq!(
            module_name_for_path("workflows/billing.js", "js", "index").as_deref(),
            Some("workflows.billing")
        );
        assert_eq!(
            module_name_for_path("shared/index.js", "js", "index").as_deref(),
            Some("shared")
        );
        assert_eq!(module_name_for_path("notes.txt", "js", "index"), None);
    }

    #[test]
    fn test_boundary_message_names_module_and_hint() {
        let err = ImportError::Boundary(BoundaryViolation {
            module: "platform.internal.db".to_string(),
            caller_file: "workflows/report.js".to_string(),
            hint: "Use 'platform.sdk' instead.".to_string(),
        });
        let message = err.to_string();
        assert!(message.contains("platform.internal.db"));
        assert!(message.contains("platform.sdk"));
        assert_eq!(err.kind(), "ImportBoundaryError");
    }
}
