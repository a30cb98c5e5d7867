// src/runtime/protocol.rs
//! Supervisor ↔ worker wire protocol
//!
//! One JSON document per line. The worker speaks first with `ready`, then
//! answers every `execute` with exactly one `result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What to run: module by logical path plus the exported function to call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub logical_path: String,
    pub entry_symbol: String,
}

impl WorkflowRef {
    pub fn new(logical_path: impl Into<String>, entry_symbol: impl Into<String>) -> Self {
        Self {
            logical_path: logical_path.into(),
            entry_symbol: entry_symbol.into(),
        }
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.logical_path, self.entry_symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub workflow: WorkflowRef,
    pub input: Value,
}

/// Supervisor → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Execute(ExecutionRequest),
    Shutdown,
}

/// Worker → supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { pid: u32 },
    Result(ExecutionResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// Structured failure: exception type, message and trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl ExecutionError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: None,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Outcome of one execution; every dispatch produces exactly one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,

    /// Process that ran it; filled in by the pool
    #[serde(default)]
    pub process_id: Option<String>,

    pub status: ExecutionStatus,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<ExecutionError>,

    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(execution_id: impl Into<String>, result: Value, duration_ms: u64) -> Self {
        Self {
            execution_id: execution_id.into(),
            process_id: None,
            status: ExecutionStatus::Success,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(execution_id: impl Into<String>, error: ExecutionError, duration_ms: u64) -> Self {
        Self {
            execution_id: execution_id.into(),
            process_id: None,
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn timeout(execution_id: impl Into<String>, limit_ms: u64) -> Self {
        Self {
            execution_id: execution_id.into(),
            process_id: None,
            status: ExecutionStatus::Timeout,
            result: None,
            error: Some(ExecutionError::new(
                "ExecutionTimeout",
                format!("Execution exceeded {}ms and its process was recycled", limit_ms),
            )),
            duration_ms: limit_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.error_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = WorkerRequest::Execute(ExecutionRequest {
            execution_id: "exec_1".to_string(),
            workflow: WorkflowRef::new("workflows/a.js", "run"),
            input: json!({"n": 1}),
        });
        let line = serde_json::to_value(&request).unwrap();
        assert_eq!(line["type"], "execute");
        assert_eq!(line["workflow"]["entry_symbol"], "run");

        let shutdown = serde_json::to_string(&WorkerRequest::Shutdown).unwrap();
        assert_eq!(shutdown, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_worker_result_parses() {
        let line = r#"{"type":"result","execution_id":"e","status":"failed",
            "error":{"error_type":"TypeError","message":"x is undefined"},"duration_ms":4}"#;
        match serde_json::from_str::<WorkerMessage>(line).unwrap() {
            WorkerMessage::Result(result) => {
                assert_eq!(result.status, ExecutionStatus::Failed);
                assert_eq!(result.error_type(), Some("TypeError"));
                assert!(result.process_id.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_timeout_result() {
        let result = ExecutionResult::timeout("e", 1500);
        assert_eq!(result.status.as_str(), "timeout");
        assert_eq!(result.error_type(), Some("ExecutionTimeout"));
    }
}
