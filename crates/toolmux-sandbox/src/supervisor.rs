use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use toolmux_core::OrchestratorError;
use toolmux_dispatcher::{Dispatcher, ToolCallRequest};
use toolmux_downstream::DownstreamPool;

use crate::bridge::{BridgeCallHandler, ToolBridge};
use crate::capture::{truncate_output, OutputCapture, TruncationDirection};
use crate::engine::{SandboxEngine, SandboxSpawnSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallSummary {
    pub total: u64,
    pub per_tool: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub execution_time_ms: u64,
    pub tool_call_summary: ToolCallSummary,
    pub error: Option<OrchestratorError>,
}

/// Everything the front-end (C12) needs to start one Execution.
pub struct ExecutionSpec {
    pub correlation_id: String,
    pub client_id: String,
    pub code: String,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub extra_env: HashMap<String, String>,
}

/// Default per-stream capture cap: a few megabytes, per spec §4.9.
const DEFAULT_CAPTURE_CAP_BYTES: usize = 4 * 1024 * 1024;
/// Grace period between the wall-clock deadline firing and the forcible
/// termination signal landing, used only to bound the "timed out by
/// timeoutMs + grace" testable property; the kill itself is sent
/// immediately, this is how long we wait for the child to actually die.
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Launches and babysits one sandbox subprocess per Execution (C10):
/// binds a fresh [`ToolBridge`], spawns the configured [`SandboxEngine`],
/// enforces the wall-clock deadline with the OS's forcible-termination
/// signal, and captures stdout/stderr into bounded buffers.
pub struct SandboxSupervisor {
    engine: Arc<dyn SandboxEngine>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<DownstreamPool>,
    stdout_cap: usize,
    stderr_cap: usize,
}

impl SandboxSupervisor {
    pub fn new(engine: Arc<dyn SandboxEngine>, dispatcher: Arc<Dispatcher>, pool: Arc<DownstreamPool>) -> Self {
        Self {
            engine,
            dispatcher,
            pool,
            stdout_cap: DEFAULT_CAPTURE_CAP_BYTES,
            stderr_cap: DEFAULT_CAPTURE_CAP_BYTES,
        }
    }

    pub fn with_capture_caps(mut self, stdout_cap: usize, stderr_cap: usize) -> Self {
        self.stdout_cap = stdout_cap;
        self.stderr_cap = stderr_cap;
        self
    }

    /// Runs one Execution to completion. `cancellation` is the single token
    /// propagated down from graceful shutdown (§5); it cancels the
    /// Execution the same way a deadline does, except the terminal status
    /// is `Cancelled` rather than `TimedOut`.
    pub async fn run(&self, spec: ExecutionSpec, cancellation: CancellationToken) -> ExecutionOutcome {
        let start = Instant::now();
        let deadline = start + spec.timeout;

        let handler = Arc::new(ExecutionBridgeHandler {
            dispatcher: Arc::clone(&self.dispatcher),
            pool: Arc::clone(&self.pool),
            execution_id: spec.correlation_id.clone(),
            client_id: spec.client_id.clone(),
            allowed_patterns: spec.allowed_tools.clone(),
            deadline,
            cancellation: cancellation.clone(),
            counts: DashMap::new(),
            total: AtomicU64::new(0),
        });

        let bridge = match ToolBridge::bind(spec.correlation_id.clone(), handler.clone()).await {
            Ok(bridge) => bridge,
            Err(err) => {
                return ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    stdout: String::new(),
                    stdout_truncated: false,
                    stderr: String::new(),
                    stderr_truncated: false,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    tool_call_summary: ToolCallSummary::default(),
                    error: Some(OrchestratorError::Internal(format!(
                        "failed to bind tool bridge: {err}"
                    ))),
                };
            }
        };

        let spawn_spec = SandboxSpawnSpec {
            code: spec.code,
            bridge_url: bridge.url(),
            bearer_token: bridge.session.token_hex(),
            allowed_tools: spec.allowed_tools,
            working_dir: spec.working_dir,
            extra_env: spec.extra_env,
        };

        let mut child = match self.engine.spawn(&spawn_spec) {
            Ok(child) => child,
            Err(err) => {
                bridge.shutdown().await;
                return ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    stdout: String::new(),
                    stdout_truncated: false,
                    stderr: String::new(),
                    stderr_truncated: false,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    tool_call_summary: ToolCallSummary::default(),
                    error: Some(OrchestratorError::Internal(err.to_string())),
                };
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let code = spawn_spec.code.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(code.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_capture = Arc::new(Mutex::new(OutputCapture::new(self.stdout_cap)));
        let stderr_capture = Arc::new(Mutex::new(OutputCapture::new(self.stderr_cap)));

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain_into(pipe, Arc::clone(&stdout_capture))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain_into(pipe, Arc::clone(&stderr_capture))));

        let outcome_status = tokio::select! {
            wait_result = child.wait() => {
                match wait_result {
                    Ok(status) if status.success() => ExecutionStatus::Succeeded,
                    Ok(_) => ExecutionStatus::Failed,
                    Err(_) => ExecutionStatus::Failed,
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                terminate(&mut child).await;
                ExecutionStatus::TimedOut
            }
            _ = cancellation.cancelled() => {
                terminate(&mut child).await;
                ExecutionStatus::Cancelled
            }
        };

        if let Some(task) = stdout_task {
            let _ = tokio::time::timeout(TERMINATION_GRACE, task).await;
        }
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(TERMINATION_GRACE, task).await;
        }

        bridge.shutdown().await;

        let stdout_result = into_capture(stdout_capture).await.finish();
        let stderr_result = into_capture(stderr_capture).await.finish();

        let tool_call_summary = handler.summary();

        ExecutionOutcome {
            status: outcome_status,
            stdout: stdout_result.content,
            stdout_truncated: stdout_result.was_truncated,
            stderr: stderr_result.content,
            stderr_truncated: stderr_result.was_truncated,
            execution_time_ms: start.elapsed().as_millis() as u64,
            tool_call_summary,
            error: None,
        }
    }
}

async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    let _ = tokio::time::timeout(TERMINATION_GRACE, child.wait()).await;
}

/// Reclaims the capture buffer after its draining task has joined. The
/// draining task holds the only other clone of the `Arc`, so by the time
/// this runs the unwrap always succeeds; the locked fallback only exists to
/// avoid ever panicking on a timed-out drain task that didn't get to drop
/// its clone yet.
async fn into_capture(capture: Arc<Mutex<OutputCapture>>) -> OutputCapture {
    match Arc::try_unwrap(capture) {
        Ok(mutex) => mutex.into_inner(),
        Err(arc) => arc.lock().await.clone(),
    }
}

async fn drain_into<R: tokio::io::AsyncRead + Unpin>(mut reader: R, capture: Arc<Mutex<OutputCapture>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut guard = capture.lock().await;
                guard.push(&buf[..n]);
            }
            Err(_) => break,
        }
    }
}

/// Bridges the HTTP tool-call/list-tools requests into the dispatcher
/// pipeline (C9), tallying the per-Execution tool-call summary the response
/// carries back to the client.
struct ExecutionBridgeHandler {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<DownstreamPool>,
    execution_id: String,
    client_id: String,
    allowed_patterns: Vec<String>,
    deadline: Instant,
    cancellation: CancellationToken,
    counts: DashMap<String, u64>,
    total: AtomicU64,
}

impl ExecutionBridgeHandler {
    fn summary(&self) -> ToolCallSummary {
        ToolCallSummary {
            total: self.total.load(Ordering::SeqCst),
            per_tool: self
                .counts
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl BridgeCallHandler for ExecutionBridgeHandler {
    async fn call_tool(
        &self,
        request_id: String,
        tool_name: String,
        args: Value,
    ) -> Result<Value, OrchestratorError> {
        let request = ToolCallRequest {
            execution_id: self.execution_id.clone(),
            request_id,
            client_id: self.client_id.clone(),
            tool_name: tool_name.clone(),
            args,
            allowed_patterns: self.allowed_patterns.clone(),
            deadline: self.deadline,
            cancellation: self.cancellation.clone(),
        };
        let result = self.dispatcher.dispatch(request).await;
        if result.is_ok() {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.counts.entry(tool_name).or_insert(0) += 1;
        }
        result
    }

    async fn list_tools(&self) -> Result<Value, OrchestratorError> {
        let mut all = Vec::new();
        for server in self.pool.server_names() {
            if let Ok(descriptors) = self.pool.list_tools(&server).await {
                all.extend(descriptors);
            }
        }
        let filtered: Vec<_> = all
            .into_iter()
            .filter(|d| {
                let full_name = d.full_name();
                self.allowed_patterns.iter().any(|pattern| {
                    glob::Pattern::new(pattern)
                        .map(|p| p.matches(&full_name))
                        .unwrap_or(false)
                })
            })
            .collect();
        serde_json::to_value(filtered)
            .map_err(|err| OrchestratorError::Internal(format!("failed to serialize tool list: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_direction_defaults_sane() {
        let result = truncate_output("hello", 100, TruncationDirection::Tail);
        assert!(!result.was_truncated);
    }
}
