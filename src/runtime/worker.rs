// src/runtime/worker.rs
//! Worker process entry point
//!
//! A worker is the same binary started with the `worker` subcommand. It
//! builds the module stack, starts a [`Sandbox`], announces `ready` on stdout
//! and then answers one `execute` line at a time until told to shut down or
//! until stdin closes. Logs go to stderr; stdout carries protocol only.

use crate::modules::{
    CacheImportHook, CodeOrigin, FinderId, FsOrigin, GuardConfig, ImportBoundaryGuard, MetaPath,
    ModuleCache, ModuleCacheConfig, PlatformFinder,
};
use crate::runtime::process_manager::MAX_LINE_LENGTH;
use crate::runtime::protocol::{ExecutionError, ExecutionResult, WorkerMessage, WorkerRequest};
use crate::runtime::sandbox::{Sandbox, SandboxConfig};
use crate::store::{self, CacheStore};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// Resolver chain of one process, with the handles needed to uninstall parts of it
pub struct ModuleStack {
    pub meta_path: Arc<MetaPath>,
    pub cache: Arc<ModuleCache>,
    pub hook: FinderId,
    pub guard: FinderId,
}

impl ModuleStack {
    /// Platform finder at the back, cache hook ahead of it, guard in front
    pub fn build(
        store: Arc<dyn CacheStore>,
        origin: Arc<dyn CodeOrigin>,
        config: &EngineConfig,
    ) -> Self {
        let cache = Arc::new(ModuleCache::new(
            store,
            origin,
            ModuleCacheConfig::from_settings(&config.module_cache, &config.redis.key_prefix),
        ));

        let meta_path = Arc::new(MetaPath::new());
        Arc::new(PlatformFinder::new()).install(&meta_path);
        let hook = Arc::new(CacheImportHook::new(
            cache.clone(),
            config.module_cache.extension.clone(),
            config.module_cache.package_file.clone(),
        ))
        .install(&meta_path);
        let guard = ImportBoundaryGuard::install(&meta_path, GuardConfig::from(&config.guard));

        Self {
            meta_path,
            cache,
            hook,
            guard,
        }
    }
}

/// Run a worker over stdin/stdout until shutdown
pub async fn run_worker(config: &EngineConfig) -> Result<()> {
    info!("Worker process {} starting", std::process::id());

    let store = store::connect(&config.redis.url).await?;
    let origin: Arc<dyn CodeOrigin> = Arc::new(FsOrigin::new(&config.origin.root));
    let stack = ModuleStack::build(store, origin, config);

    if let Err(e) = stack.cache.clone().watch_invalidations().await {
        warn!("Module invalidations unavailable, relying on snapshot expiry: {}", e);
    }

    let sandbox = Sandbox::start(
        stack.meta_path.clone(),
        Handle::current(),
        SandboxConfig::from_settings(&config.module_cache),
    )?;

    serve(tokio::io::stdin(), tokio::io::stdout(), &sandbox).await?;
    info!("Worker process {} exiting", std::process::id());
    Ok(())
}

/// Speak the worker protocol over `reader`/`writer`
pub async fn serve<R, W>(reader: R, writer: W, sandbox: &Sandbox) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut replies = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    send(&mut replies, &WorkerMessage::Ready { pid: std::process::id() }).await?;

    while let Some(line) = requests.next().await {
        let line = line.map_err(|e| EngineError::WorkerProtocol(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Execute(request)) => {
                debug!("Executing {} ({})", request.execution_id, request.workflow);
                let result = sandbox.execute(request).await;
                send(&mut replies, &WorkerMessage::Result(result)).await?;
            }
            Ok(WorkerRequest::Shutdown) => {
                info!("Shutdown requested");
                break;
            }
            Err(e) => {
                warn!("Malformed request: {}", e);
                let execution_id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("execution_id").and_then(Value::as_str).map(String::from));
                if let Some(execution_id) = execution_id {
                    let result = ExecutionResult::failed(
                        execution_id,
                        ExecutionError::new("ProtocolError", e.to_string()),
                        0,
                    );
                    send(&mut replies, &WorkerMessage::Result(result)).await?;
                }
            }
        }
    }

    Ok(())
}

async fn send<W>(replies: &mut FramedWrite<W, LinesCodec>, message: &WorkerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(message)?;
    replies
        .send(line)
        .await
        .map_err(|e| EngineError::WorkerProtocol(format!("Failed to write reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::MemoryOrigin;
    use crate::runtime::protocol::{ExecutionRequest, ExecutionStatus, WorkflowRef};
    use crate::store::MemoryStore;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_round_trip() {
        let mut config = EngineConfig::default();
        config.redis.url = "memory://".to_string();
        let stack = ModuleStack::build(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryOrigin::new()),
            &config,
        );
        stack
            .cache
            .push("workflows/greet.js", "exports.run = function (p) { return 'hi ' + p.name; };")
            .await
            .unwrap();
        let sandbox = Sandbox::start(stack.meta_path.clone(), Handle::current(), SandboxConfig::default())
            .unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);
        let serving = tokio::spawn(async move { serve(server_read, server_write, &sandbox).await });

        let mut lines = BufReader::new(client_read).lines();
        let ready: WorkerMessage = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(ready, WorkerMessage::Ready { .. }));

        let request = WorkerRequest::Execute(ExecutionRequest {
            execution_id: "exec_1".to_string(),
            workflow: WorkflowRef::new("workflows/greet.js", "run"),
            input: serde_json::json!({"name": "ada"}),
        });
        let line = serde_json::to_string(&request).unwrap() + "\n";
        client_write.write_all(line.as_bytes()).await.unwrap();
        client_write.write_all(b"{\"type\":\"bogus\",\"execution_id\":\"exec_2\"}\n").await.unwrap();

        match serde_json::from_str::<WorkerMessage>(&lines.next_line().await.unwrap().unwrap()).unwrap() {
            WorkerMessage::Result(result) => {
                assert_eq!(result.execution_id, "exec_1");
                assert_eq!(result.status, ExecutionStatus::Success);
                assert_eq!(result.result, Some(serde_json::json!("hi ada")));
            }
            other => panic!("unexpected {:?}", other),
        }
        match serde_json::from_str::<WorkerMessage>(&lines.next_line().await.unwrap().unwrap()).unwrap() {
            WorkerMessage::Result(result) => {
                assert_eq!(result.execution_id, "exec_2");
                assert_eq!(result.error_type(), Some("ProtocolError"));
            }
            other => panic!("unexpected {:?}", other),
        }

        client_write.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn test_stack_order() {
        let stack = ModuleStack::build(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryOrigin::new()),
            &EngineConfig::default(),
        );
        assert_eq!(
            stack.meta_path.finder_names(),
            vec!["import-boundary-guard", "module-cache", "platform"]
        );
        assert!(CacheImportHook::remove(&stack.meta_path, stack.hook));
        assert!(stack.meta_path.contains(stack.guard));
        assert_eq!(stack.meta_path.len(), 2);
    }
}
