// src/runtime/sandbox.rs
//! Embedded interpreter for workspace code
//!
//! Each worker process owns one [`Sandbox`]: a boa `Context` living on a
//! dedicated thread. Module loading happens on the host side, so every
//! `require` goes through the process-wide [`MetaPath`] (boundary guard first,
//! then the module cache hook, then platform modules).
//!
//! ```text
//!  execute(request) ──▶ job channel ──▶ interpreter thread
//!                                          │ load_module(entry)
//!                                          │   require(x) ─▶ MetaPath::import(x, module file)
//!                                          ▼
//!  ExecutionResult ◀── oneshot ◀───── outcome JSON
//! ```
//!
//! Modules are CommonJS-style: the source is wrapped in
//! `function (module, exports, require, __file__, __name__)` and its
//! `module.exports` is what `require` returns. Each module gets its own native
//! `require` that carries the module's logical path on the host side; script
//! code never names the caller the guard sees. The module registry lives on
//! the host and is reset around every execution so a pushed module is visible
//! to the next run.

use crate::modules::meta_path::MetaPath;
use crate::modules::{module_name_for_path, ImportError};
use crate::runtime::protocol::{ExecutionError, ExecutionRequest, ExecutionResult};
use crate::utils::config::ModuleCacheSettings;
use crate::utils::errors::{EngineError, Result};
use boa_engine::object::builtins::JsFunction;
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const INTERPRETER_STACK_SIZE: usize = 16 * 1024 * 1024;

const CONSOLE: &str = r#"
var console = (function () {
  function format(args) {
    return Array.prototype.slice.call(args).map(function (part) {
      return typeof part === "string" ? part : JSON.stringify(part);
    }).join(" ");
  }
  function emit(level) {
    return function () { __host_log(level, format(arguments)); };
  }
  return {
    log: emit("info"),
    info: emit("info"),
    debug: emit("debug"),
    warn: emit("warn"),
    error: emit("error")
  };
})();
"#;

// Evaluated once; the returned functions are held by the host and never
// bound to a global name.
const HELPERS: &str = r#"
(function () {
  function describe(e) {
    if (e instanceof Error) {
      return {
        error_type: e.name || "Error",
        message: String(e.message),
        traceback: e.stack === undefined ? null : String(e.stack)
      };
    }
    return { error_type: "Error", message: String(e), traceback: null };
  }

  return {
    describe: function (e) {
      return JSON.stringify(describe(e));
    },

    run: function (entry, input) {
      var outcome = { settled: false };
      function succeed(value) {
        outcome.settled = true;
        outcome.status = "success";
        outcome.result = value === undefined ? null : value;
      }
      function fail(e) {
        outcome.settled = true;
        outcome.status = "failed";
        outcome.error = describe(e);
      }
      try {
        var value = entry(input);
        if (value !== null && typeof value === "object" && typeof value.then === "function") {
          value.then(succeed, fail);
        } else {
          succeed(value);
        }
      } catch (e) {
        fail(e);
      }
      return outcome;
    },

    collect: function (outcome) {
      if (!outcome.settled) {
        return JSON.stringify({
          status: "failed",
          error: {
            error_type: "UnresolvedPromise",
            message: "Workflow returned a promise that never settled",
            traceback: null
          }
        });
      }
      try {
        return JSON.stringify({ status: outcome.status, result: outcome.result, error: outcome.error });
      } catch (e) {
        return JSON.stringify({
          status: "failed",
          error: { error_type: "SerializationError", message: String(e), traceback: null }
        });
      }
    }
  };
})()
"#;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Source file extension, without the dot
    pub extension: String,

    /// Package file name, without extension
    pub package_file: String,
}

impl SandboxConfig {
    pub fn from_settings(settings: &ModuleCacheSettings) -> Self {
        Self {
            extension: settings.extension.clone(),
            package_file: settings.package_file.clone(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_settings(&ModuleCacheSettings::default())
    }
}

struct HostState {
    meta_path: Arc<MetaPath>,
    handle: Handle,
}

thread_local! {
    static HOST: RefCell<Option<HostState>> = const { RefCell::new(None) };

    /// `module` objects of the current execution, by dotted name
    static LOADED: RefCell<HashMap<String, JsObject>> = RefCell::new(HashMap::new());
}

fn host() -> Option<(Arc<MetaPath>, Handle)> {
    HOST.with(|host| {
        host.borrow()
            .as_ref()
            .map(|state| (state.meta_path.clone(), state.handle.clone()))
    })
}

fn reset_modules() {
    LOADED.with(|loaded| loaded.borrow_mut().clear());
}

/// Error object with `name` set to `kind`, thrown into script code
fn throw_named(context: &mut Context, kind: &str, message: String) -> JsError {
    let error = JsNativeError::error().with_message(message).to_opaque(context);
    if let Err(e) = error.set(js_string!("name"), JsString::from(kind), false, context) {
        return e;
    }
    JsError::from_opaque(error.into())
}

fn throw_import(context: &mut Context, error: &ImportError) -> JsError {
    throw_named(context, error.kind(), error.to_string())
}

/// Resolve, compile and run `name` on behalf of `caller`; returns its exports
fn load_module(context: &mut Context, name: &str, caller: Option<&str>) -> JsResult<JsValue> {
    let Some((meta_path, handle)) = host() else {
        return Err(throw_named(
            context,
            "ImportError",
            "module loader unavailable".to_string(),
        ));
    };

    if let Some(module) = LOADED.with(|loaded| loaded.borrow().get(name).cloned()) {
        // Already loaded by someone else; this caller must still be admitted
        if let Err(e) = meta_path.check(name, caller) {
            return Err(throw_import(context, &e));
        }
        return module.get(js_string!("exports"), context);
    }

    let spec = match handle.block_on(meta_path.import(name, caller)) {
        Ok(spec) => spec,
        Err(e) => return Err(throw_import(context, &e)),
    };

    let wrapped = format!(
        "(function (module, exports, require, __file__, __name__) {{\n{}\n}})",
        spec.source
    );
    let factory = context.eval(Source::from_bytes(&wrapped))?;
    let Some(factory) = factory.as_callable().cloned() else {
        return Err(throw_named(
            context,
            "ImportError",
            format!("'{}' did not compile to a module", name),
        ));
    };

    let exports = ObjectInitializer::new(context).build();
    let module = ObjectInitializer::new(context).build();
    module.set(js_string!("exports"), exports.clone(), true, context)?;
    LOADED.with(|loaded| loaded.borrow_mut().insert(name.to_string(), module.clone()));

    let require = require_function(context, &spec.logical_path);
    let args = [
        JsValue::from(module.clone()),
        JsValue::from(exports.clone()),
        JsValue::from(require),
        JsValue::from(JsString::from(spec.logical_path.as_str())),
        JsValue::from(JsString::from(name)),
    ];
    if let Err(e) = factory.call(&JsValue::from(exports), &args, context) {
        LOADED.with(|loaded| loaded.borrow_mut().remove(name));
        return Err(e);
    }
    module.get(js_string!("exports"), context)
}

/// `require` bound to the module at `caller`
fn require_function(context: &mut Context, caller: &str) -> JsFunction {
    let native = NativeFunction::from_copy_closure_with_captures(require_from, JsString::from(caller));
    FunctionObjectBuilder::new(context.realm(), native)
        .name(js_string!("require"))
        .length(1)
        .constructor(false)
        .build()
}

fn require_from(
    _this: &JsValue,
    args: &[JsValue],
    caller: &JsString,
    context: &mut Context,
) -> JsResult<JsValue> {
    let name = match args.first() {
        Some(value) => value.to_string(context)?.to_std_string_escaped(),
        None => String::new(),
    };
    let caller = caller.to_std_string_escaped();
    load_module(context, &name, Some(&caller))
}

fn host_log(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let arg = |index: usize| {
        args.get(index)
            .and_then(|v| v.as_string())
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_default()
    };
    let level = arg(0);
    let message = arg(1);

    match level.as_str() {
        "error" => error!(target: "workspace", "{}", message),
        "warn" => warn!(target: "workspace", "{}", message),
        "debug" => debug!(target: "workspace", "{}", message),
        _ => info!(target: "workspace", "{}", message),
    }
    Ok(JsValue::undefined())
}

/// Host-held script helpers
struct Helpers {
    run: JsObject,
    collect: JsObject,
    describe: JsObject,
}

fn helper(helpers: &JsValue, name: &str, context: &mut Context) -> JsResult<JsObject> {
    let value = match helpers.as_object() {
        Some(object) => object.get(JsString::from(name), context)?,
        None => JsValue::undefined(),
    };
    value.as_callable().cloned().ok_or_else(|| {
        JsNativeError::typ()
            .with_message(format!("sandbox helper '{}' missing", name))
            .into()
    })
}

fn build_context() -> JsResult<(Context, Helpers)> {
    let mut context = Context::default();

    let log = FunctionObjectBuilder::new(context.realm(), NativeFunction::from_fn_ptr(host_log))
        .name(js_string!("__host_log"))
        .length(2)
        .constructor(false)
        .build();
    // Read-only, non-enumerable, non-configurable
    context.register_global_property(js_string!("__host_log"), log, Attribute::empty())?;
    context.eval(Source::from_bytes(CONSOLE))?;

    let helpers = context.eval(Source::from_bytes(HELPERS))?;
    let helpers = Helpers {
        run: helper(&helpers, "run", &mut context)?,
        collect: helper(&helpers, "collect", &mut context)?,
        describe: helper(&helpers, "describe", &mut context)?,
    };
    Ok((context, helpers))
}

fn describe_error(context: &mut Context, helpers: &Helpers, error: JsError) -> ExecutionError {
    let thrown = error.to_opaque(context);
    helpers
        .describe
        .call(&JsValue::undefined(), &[thrown], context)
        .ok()
        .and_then(|value| value.as_string().map(|s| s.to_std_string_escaped()))
        .and_then(|raw| serde_json::from_str::<ExecutionError>(&raw).ok())
        .unwrap_or_else(|| ExecutionError::new("RuntimeError", error.to_string()))
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Success {
        #[serde(default)]
        result: Value,
    },
    Failed {
        error: ExecutionError,
    },
}

fn run_job(
    context: &mut Context,
    helpers: &Helpers,
    config: &SandboxConfig,
    request: &ExecutionRequest,
) -> ExecutionResult {
    reset_modules();
    let started = Instant::now();
    let outcome = run_entry(context, helpers, config, request);
    reset_modules();

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(result) => ExecutionResult::success(&request.execution_id, result, duration_ms),
        Err(error) => ExecutionResult::failed(&request.execution_id, error, duration_ms),
    }
}

fn run_entry(
    context: &mut Context,
    helpers: &Helpers,
    config: &SandboxConfig,
    request: &ExecutionRequest,
) -> std::result::Result<Value, ExecutionError> {
    let workflow = &request.workflow;

    let Some(name) = module_name_for_path(&workflow.logical_path, &config.extension, &config.package_file)
    else {
        return Err(ExecutionError::new(
            "ImportError",
            format!("'{}' is not a module path", workflow.logical_path),
        ));
    };

    // The entry module is workspace code; it is admitted as its own caller
    let exports = load_module(context, &name, Some(&workflow.logical_path))
        .map_err(|e| describe_error(context, helpers, e))?;

    let entry = match exports.as_object() {
        Some(object) => object
            .get(JsString::from(workflow.entry_symbol.as_str()), context)
            .map_err(|e| describe_error(context, helpers, e))?,
        None => JsValue::undefined(),
    };
    if !entry.is_callable() {
        return Err(ExecutionError::new(
            "EntryPointError",
            format!("Module '{}' has no function '{}'", name, workflow.entry_symbol),
        ));
    }

    let input = JsValue::from_json(&request.input, context)
        .map_err(|e| ExecutionError::new("RuntimeError", format!("Unusable input: {}", e)))?;

    let outcome = helpers
        .run
        .call(&JsValue::undefined(), &[entry, input], context)
        .map_err(|e| describe_error(context, helpers, e))?;
    context.run_jobs();

    let raw = helpers
        .collect
        .call(&JsValue::undefined(), &[outcome], context)
        .map_err(|e| describe_error(context, helpers, e))?;
    let raw = raw
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| ExecutionError::new("RuntimeError", "Unreadable outcome: not a string"))?;

    match serde_json::from_str::<Outcome>(&raw) {
        Ok(Outcome::Success { result }) => Ok(result),
        Ok(Outcome::Failed { error }) => Err(error),
        Err(e) => Err(ExecutionError::new(
            "RuntimeError",
            format!("Unreadable outcome: {}", e),
        )),
    }
}

struct Job {
    request: ExecutionRequest,
    reply: oneshot::Sender<ExecutionResult>,
}

/// Handle to the interpreter thread
pub struct Sandbox {
    jobs: crossbeam_channel::Sender<Job>,
}

impl Sandbox {
    /// Start the interpreter thread; `handle` drives module loading
    pub fn start(meta_path: Arc<MetaPath>, handle: Handle, config: SandboxConfig) -> Result<Self> {
        let (jobs, incoming) = crossbeam_channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);

        std::thread::Builder::new()
            .name("wfrt-sandbox".to_string())
            .stack_size(INTERPRETER_STACK_SIZE)
            .spawn(move || {
                HOST.with(|host| *host.borrow_mut() = Some(HostState { meta_path, handle }));

                let (mut context, helpers) = match build_context() {
                    Ok(built) => {
                        let _ = ready_tx.send(Ok(()));
                        built
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                while let Ok(job) = incoming.recv() {
                    debug!("Running {} ({})", job.request.execution_id, job.request.workflow);
                    let result = run_job(&mut context, &helpers, &config, &job.request);
                    let _ = job.reply.send(result);
                }
                reset_modules();
                debug!("Sandbox thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { jobs }),
            Ok(Err(e)) => Err(EngineError::Script(format!("Sandbox prelude failed: {}", e))),
            Err(_) => Err(EngineError::Script("Sandbox thread exited during startup".to_string())),
        }
    }

    /// Run one request to completion
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = request.execution_id.clone();
        let (reply, result) = oneshot::channel();

        if self.jobs.send(Job { request, reply }).is_err() {
            return ExecutionResult::failed(
                execution_id,
                ExecutionError::new("SandboxUnavailable", "Interpreter thread has stopped"),
                0,
            );
        }
        match result.await {
            Ok(result) => result,
            Err(_) => ExecutionResult::failed(
                execution_id,
                ExecutionError::new("SandboxUnavailable", "Interpreter dropped the execution"),
                0,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{
        CacheImportHook, GuardConfig, ImportBoundaryGuard, MemoryOrigin, ModuleCache,
        ModuleCacheConfig, PlatformFinder,
    };
    use crate::runtime::protocol::{ExecutionStatus, WorkflowRef};
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn sandbox_with(modules: &[(&str, &str)]) -> (Sandbox, Arc<ModuleCache>) {
        let cache = Arc::new(ModuleCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryOrigin::new()),
            ModuleCacheConfig::default(),
        ));
        for (path, source) in modules {
            cache.push(path, source).await.unwrap();
        }

        let meta_path = Arc::new(MetaPath::new());
        Arc::new(PlatformFinder::new()).install(&meta_path);
        Arc::new(CacheImportHook::new(cache.clone(), "js", "index")).install(&meta_path);
        ImportBoundaryGuard::install(&meta_path, GuardConfig::default());

        let sandbox = Sandbox::start(meta_path, Handle::current(), SandboxConfig::default()).unwrap();
        (sandbox, cache)
    }

    fn request(path: &str, symbol: &str, input: Value) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: "exec_test".to_string(),
            workflow: WorkflowRef::new(path, symbol),
            input,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_entry_with_input() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/add.js",
            "exports.run = function (input) { return { sum: input.a + input.b }; };",
        )])
        .await;

        let result = sandbox
            .execute(request("workflows/add.js", "run", json!({"a": 2, "b": 3})))
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.result, Some(json!({"sum": 5})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_require_between_workspace_modules() {
        let (sandbox, _) = sandbox_with(&[
            ("shared/index.js", "exports.double = function (n) { return n * 2; };"),
            (
                "workflows/calc.js",
                "const shared = require('shared');\nexports.run = function (n) { return shared.double(n); };",
            ),
        ])
        .await;

        let result = sandbox.execute(request("workflows/calc.js", "run", json!(21))).await;
        assert_eq!(result.result, Some(json!(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_boundary_violation_is_structured() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/sneaky.js",
            "exports.run = function () { return require('platform.internal.runtime').runtime; };",
        )])
        .await;

        let result = sandbox.execute(request("workflows/sneaky.js", "run", json!({}))).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.error_type, "ImportBoundaryError");
        assert!(error.message.contains("platform.sdk"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loader_internals_are_not_globals() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/globals.js",
            r#"exports.run = function () {
  __host_log = null;
  return {
    requireFrom: typeof __requireFrom,
    load: typeof __load,
    hostImport: typeof __host_import,
    hostCheck: typeof __host_check,
    modules: typeof __modules,
    hostLog: typeof __host_log,
    enumerable: Object.keys(globalThis).indexOf("__host_log") >= 0
  };
};"#,
        )])
        .await;

        let result = sandbox.execute(request("workflows/globals.js", "run", json!({}))).await;
        assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({
                "requireFrom": "undefined",
                "load": "undefined",
                "hostImport": "undefined",
                "hostCheck": "undefined",
                "modules": "undefined",
                "hostLog": "function",
                "enumerable": false
            }))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_require_ignores_claimed_caller() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/forged.js",
            r#"exports.run = function () {
  return require.call({ file: "@platform/platform/sdk.js" }, "platform.internal.runtime").runtime;
};"#,
        )])
        .await;

        let result = sandbox.execute(request("workflows/forged.js", "run", json!({}))).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().error_type, "ImportBoundaryError");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loaded_internal_module_still_guarded() {
        // The SDK pulls in the runtime module first; the workspace module
        // asking for it afterwards is still refused
        let (sandbox, _) = sandbox_with(&[(
            "workflows/after_sdk.js",
            r#"const sdk = require("platform.sdk");
exports.run = function () {
  return [sdk.runtime, require("platform.internal.runtime").runtime];
};"#,
        )])
        .await;

        let result = sandbox.execute(request("workflows/after_sdk.js", "run", json!({}))).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().error_type, "ImportBoundaryError");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entry_in_platform_namespace_is_blocked() {
        let (sandbox, _) = sandbox_with(&[(
            "platform/internal/runtime.js",
            "exports.run = function () { return 'shadowed'; };",
        )])
        .await;

        let result = sandbox
            .execute(request("platform/internal/runtime.js", "run", json!({})))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().error_type, "ImportBoundaryError");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sdk_reaches_internals() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/sdk.js",
            "const sdk = require('platform.sdk');\nexports.run = function () { sdk.log('hello', {n: 1}); return sdk.runtime; };",
        )])
        .await;

        let result = sandbox.execute(request("workflows/sdk.js", "run", json!(null))).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.result, Some(json!("wfrt")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_module_and_entry() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/lonely.js",
            "exports.run = function () { return require('does.not.exist'); };",
        )])
        .await;

        let result = sandbox.execute(request("workflows/lonely.js", "run", json!({}))).await;
        assert_eq!(result.error_type(), Some("ModuleNotFoundError"));

        let result = sandbox.execute(request("workflows/lonely.js", "missing", json!({}))).await;
        assert_eq!(result.error_type(), Some("EntryPointError"));

        let result = sandbox.execute(request("workflows/absent.js", "run", json!({}))).await;
        assert_eq!(result.error_type(), Some("ModuleNotFoundError"));

        let result = sandbox.execute(request("notes.txt", "run", json!({}))).await;
        assert_eq!(result.error_type(), Some("ImportError"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thrown_error_carries_type() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/boom.js",
            "exports.run = function () { throw new TypeError('bad input'); };",
        )])
        .await;

        let result = sandbox.execute(request("workflows/boom.js", "run", json!({}))).await;
        let error = result.error.unwrap();
        assert_eq!(error.error_type, "TypeError");
        assert_eq!(error.message, "bad input");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_entry_resolves() {
        let (sandbox, _) = sandbox_with(&[(
            "workflows/later.js",
            "exports.run = async function (input) { return input.name.toUpperCase(); };",
        )])
        .await;

        let result = sandbox
            .execute(request("workflows/later.js", "run", json!({"name": "ada"})))
            .await;
        assert_eq!(result.result, Some(json!("ADA")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pushed_module_visible_to_next_run() {
        let (sandbox, cache) = sandbox_with(&[(
            "workflows/version.js",
            "exports.run = function () { return 1; };",
        )])
        .await;

        let first = sandbox.execute(request("workflows/version.js", "run", json!({}))).await;
        assert_eq!(first.result, Some(json!(1)));

        cache
            .push("workflows/version.js", "exports.run = function () { return 2; };")
            .await
            .unwrap();
        let second = sandbox.execute(request("workflows/version.js", "run", json!({}))).await;
        assert_eq!(second.result, Some(json!(2)));
    }
}
