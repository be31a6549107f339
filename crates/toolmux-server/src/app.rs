//! Shared server state (C9-C13 composition root) and the single `execute`
//! entry point both front-ends call into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use toolmux_admission::{CircuitBreakerRegistry, ConnectionQueue, RateLimiter};
use toolmux_cache::{AuditLog, SchemaCache};
use toolmux_core::{OrchestratorError, ToolmuxConfig};
use toolmux_dispatcher::Dispatcher;
use toolmux_downstream::{ConcurrencyGuard, DownstreamPool, SchemaValidator};
use toolmux_sandbox::{CommandSandboxEngine, ExecutionSpec, SandboxSupervisor};

use crate::wire::{ExecuteRequest, ExecuteResponse};

/// Tracks in-flight Executions so graceful shutdown (C13) can drain them
/// with a deadline rather than guessing when the last one finished.
struct ActiveExecutions {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveExecutions {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    async fn wait_until_drained(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            loop {
                let notified = self.idle.notified();
                if self.count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;
    }
}

struct ActiveGuard {
    tracker: Arc<ActiveExecutions>,
}

impl ActiveGuard {
    fn new(tracker: &Arc<ActiveExecutions>) -> Self {
        tracker.count.fetch_add(1, Ordering::SeqCst);
        Self {
            tracker: Arc::clone(tracker),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Everything the front-ends share: the admission/cache/dispatch pipeline,
/// one `SandboxSupervisor` per configured sandbox engine, and the
/// coordination state for graceful shutdown.
pub struct AppState {
    config: ToolmuxConfig,
    supervisors: HashMap<String, SandboxSupervisor>,
    audit: Arc<AuditLog>,
    schema_cache: Arc<SchemaCache>,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<ConnectionQueue<ConcurrencyGuard>>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    active: Arc<ActiveExecutions>,
}

impl AppState {
    pub async fn build(config: ToolmuxConfig, state_dir: std::path::PathBuf) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&state_dir).await?;

        let audit = Arc::new(AuditLog::new(&state_dir).await?);
        let schema_cache = Arc::new(SchemaCache::new(
            &state_dir,
            config.schema_cache.max_entries,
            Duration::from_secs(config.schema_cache.ttl_seconds),
        ));
        schema_cache.load_from_disk().await;

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window_ms,
        ));
        let queue = Arc::new(ConnectionQueue::new(config.admission.queue_size));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.threshold,
            config.circuit_breaker.cooldown_ms,
        ));
        let pool = Arc::new(DownstreamPool::new(
            config.downstream_servers.clone(),
            config.admission.max_concurrent,
        ));
        let validator = Arc::new(SchemaValidator::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&rate_limiter),
            Arc::clone(&queue),
            breakers,
            Arc::clone(&schema_cache),
            validator,
            Arc::clone(&pool),
            Arc::clone(&audit),
        ));

        let mut supervisors = HashMap::new();
        for (language, engine_config) in &config.sandbox.engines {
            if !engine_config.enabled {
                continue;
            }
            let engine = Arc::new(CommandSandboxEngine {
                command: engine_config.command.clone(),
                args: engine_config.args.clone(),
            });
            supervisors.insert(
                language.clone(),
                SandboxSupervisor::new(engine, Arc::clone(&dispatcher), Arc::clone(&pool)),
            );
        }

        Ok(Arc::new(Self {
            config,
            supervisors,
            audit,
            schema_cache,
            rate_limiter,
            queue,
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            active: Arc::new(ActiveExecutions::new()),
        }))
    }

    /// Spawns the periodic housekeeping tasks (C3 bucket sweep, C7 expired-
    /// entry cleanup, C2 retention sweep). Each stops as soon as `shutdown`
    /// fires.
    pub fn spawn_background_tasks(&self) {
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => rate_limiter.sweep_idle(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.cleanup_expired().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        if self.config.audit.enabled {
            let audit = Arc::clone(&self.audit);
            let retention_days = self.config.audit.retention_days;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = audit.sweep(retention_days).await {
                                tracing::warn!(error = %err, "audit retention sweep failed");
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            });
        }
    }

    /// Runs one execute-request end to end, mapping every rejection reason
    /// onto the wire's `{status: failed, error: {kind, message}}` shape
    /// instead of ever returning a transport-level error for a well-formed
    /// request.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        if !self.accepting.load(Ordering::SeqCst) {
            return ExecuteResponse::rejected("shutdown", "server is shutting down");
        }

        let supervisor = match self.supervisors.get(&request.language) {
            Some(supervisor) => supervisor,
            None => {
                return ExecuteResponse::rejected(
                    "validation-failed",
                    format!("unknown or disabled sandbox engine '{}'", request.language),
                );
            }
        };

        if request.code.len() > self.config.sandbox.max_code_bytes {
            return ExecuteResponse::rejected(
                "validation-failed",
                format!(
                    "code exceeds the {}-byte limit",
                    self.config.sandbox.max_code_bytes
                ),
            );
        }

        let max_timeout_ms = self.config.sandbox.max_timeout_ms;
        if request.timeout_ms < 1000 || request.timeout_ms > max_timeout_ms {
            return ExecuteResponse::rejected(
                "validation-failed",
                format!("timeoutMs must be between 1000 and {max_timeout_ms}"),
            );
        }

        let rate_check = self.rate_limiter.check(&request.client_id);
        if !rate_check.allowed {
            let err = OrchestratorError::RateLimited {
                reset_in_ms: rate_check.reset_in_ms,
            };
            return ExecuteResponse::rejected(err.kind(), err.to_string());
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut extra_env = HashMap::new();
        if let Some(permissions) = &request.permissions {
            if let Ok(serialized) = serde_json::to_string(permissions) {
                extra_env.insert("TOOLMUX_PERMISSIONS".to_string(), serialized);
            }
        }

        let spec = ExecutionSpec {
            correlation_id,
            client_id: request.client_id,
            code: request.code,
            allowed_tools: request.allowed_tools,
            timeout: Duration::from_millis(request.timeout_ms),
            working_dir: None,
            extra_env,
        };

        let _guard = ActiveGuard::new(&self.active);
        let execution_token = self.shutdown.child_token();
        supervisor.run(spec, execution_token).await.into()
    }

    /// The ordered shutdown sequence (C13): stop accepting, cancel every
    /// active Execution, drain with a deadline, flush the audit log and
    /// persist the schema cache.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.queue.cancel_all().await;
        self.active.wait_until_drained(deadline).await;
        self.schema_cache.persist_to_disk().await;
    }
}
