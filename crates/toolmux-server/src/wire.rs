//! JSON wire types for the execute operation (C12), shared by the stdio and
//! HTTP front-ends so both transports serialize identically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use toolmux_sandbox::{ExecutionOutcome, ExecutionStatus, ToolCallSummary};

fn default_client_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsRequest {
    #[serde(default)]
    pub read_paths: Vec<String>,
    #[serde(default)]
    pub write_paths: Option<serde_json::Value>,
    #[serde(default)]
    pub network_hosts: Option<serde_json::Value>,
}

/// One inbound execute-request, identical on both wire surfaces.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub language: String,
    pub code: String,
    pub allowed_tools: Vec<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub permissions: Option<PermissionsRequest>,
    /// Not named by the public wire contract; accepted so a caller that
    /// multiplexes several logical clients over one connection (the HTTP
    /// front-end) can still get per-client rate limiting. Defaults to a
    /// single shared bucket when absent, matching the stdio front-end's
    /// single-peer assumption.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Succeeded,
    Failed,
    #[serde(rename = "timed-out")]
    TimedOut,
    Cancelled,
}

impl From<ExecutionStatus> for ExecuteStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded => Self::Succeeded,
            ExecutionStatus::Failed => Self::Failed,
            ExecutionStatus::TimedOut => Self::TimedOut,
            ExecutionStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummaryWire {
    pub total: u64,
    pub per_tool: HashMap<String, u64>,
}

impl From<ToolCallSummary> for ToolCallSummaryWire {
    fn from(summary: ToolCallSummary) -> Self {
        Self {
            total: summary.total,
            per_tool: summary.per_tool,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteErrorWire {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub status: ExecuteStatus,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub tool_call_summary: ToolCallSummaryWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecuteErrorWire>,
}

impl ExecuteResponse {
    pub fn rejected(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Failed,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            tool_call_summary: ToolCallSummaryWire {
                total: 0,
                per_tool: HashMap::new(),
            },
            error: Some(ExecuteErrorWire {
                kind,
                message: message.into(),
            }),
        }
    }
}

impl From<ExecutionOutcome> for ExecuteResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        Self {
            status: outcome.status.into(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            execution_time_ms: outcome.execution_time_ms,
            tool_call_summary: outcome.tool_call_summary.into(),
            error: outcome.error.map(|err| ExecuteErrorWire {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}
