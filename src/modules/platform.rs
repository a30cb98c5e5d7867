// src/modules/platform.rs
//! Standard resolver for trusted first-party modules
//!
//! Platform modules ship inside the binary. Their logical paths live under
//! [`PLATFORM_ROOT`], which the boundary guard treats as trusted, so the SDK
//! may reach internal namespaces that workspace code cannot.

use crate::modules::meta_path::{FinderId, MetaPath, ModuleFinder};
use crate::modules::{ImportError, ImportRequest, ModuleOrigin, ModuleSpec};
use crate::utils::hashing::sha256_hex;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Logical-path root of platform code
pub const PLATFORM_ROOT: &str = "@platform/";

/// The one sanctioned integration surface for workspace code
pub const SDK_MODULE: &str = "platform.sdk";

const RUNTIME_MODULE: &str = "platform.internal.runtime";

const RUNTIME_SOURCE: &str = r#"
exports.runtime = "wfrt";
exports.log = function (level, message) {
  __host_log(String(level), String(message));
};
"#;

const SDK_SOURCE: &str = r#"
const runtime = require("platform.internal.runtime");

exports.runtime = runtime.runtime;

exports.log = function () {
  const parts = Array.prototype.slice.call(arguments).map(function (part) {
    return typeof part === "string" ? part : JSON.stringify(part);
  });
  runtime.log("info", parts.join(" "));
};

exports.warn = function () {
  const parts = Array.prototype.slice.call(arguments).map(String);
  runtime.log("warn", parts.join(" "));
};

exports.now = function () {
  return new Date().toISOString();
};
"#;

/// Registry of first-party modules
pub struct PlatformFinder {
    modules: RwLock<HashMap<String, ModuleSpec>>,
}

impl PlatformFinder {
    /// Registry preloaded with the SDK and the runtime module it uses
    pub fn new() -> Self {
        let finder = Self {
            modules: RwLock::new(HashMap::new()),
        };
        finder.register(RUNTIME_MODULE, RUNTIME_SOURCE);
        finder.register(SDK_MODULE, SDK_SOURCE);
        finder
    }

    /// Register (or replace) a platform module
    pub fn register(&self, name: &str, source: &str) {
        let spec = ModuleSpec {
            name: name.to_string(),
            logical_path: format!("{}{}.js", PLATFORM_ROOT, name.replace('.', "/")),
            source: source.to_string(),
            content_hash: sha256_hex(source.as_bytes()),
            origin: ModuleOrigin::Platform,
            is_package: false,
        };
        self.modules.write().insert(name.to_string(), spec);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Install at the back of the chain
    pub fn install(self: Arc<Self>, meta_path: &MetaPath) -> FinderId {
        meta_path.install_back(self)
    }
}

impl Default for PlatformFinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleFinder for PlatformFinder {
    fn name(&self) -> &str {
        "platform"
    }

    async fn find_spec(
        &self,
        request: &ImportRequest<'_>,
    ) -> Result<Option<ModuleSpec>, ImportError> {
        Ok(self.modules.read().get(request.name).cloned())
    }
}
