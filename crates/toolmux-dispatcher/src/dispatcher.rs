use dashmap::DashMap;
use glob::Pattern;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use toolmux_admission::{CircuitBreakerRegistry, ConnectionQueue, QueueOutcome, RateLimiter};
use toolmux_cache::{hash_args, AuditEvent, AuditEventKind, AuditLog, AuditOutcome, SchemaCache};
use toolmux_core::OrchestratorError;
use toolmux_downstream::{server_name_from_tool, ConcurrencyGuard, DownstreamPool, SchemaValidator};

/// One incoming tool call from the sandbox, carrying everything the
/// pipeline needs to decide admission and routing.
pub struct ToolCallRequest {
    pub execution_id: String,
    pub request_id: String,
    pub client_id: String,
    pub tool_name: String,
    pub args: Value,
    pub allowed_patterns: Vec<String>,
    pub deadline: Instant,
    pub cancellation: CancellationToken,
}

struct DedupSlot {
    notify: Notify,
    result: Mutex<Option<Result<Value, OrchestratorError>>>,
}

/// Composes C3 -> C7 -> C6 -> C5 -> C4 -> C8 for every tool call, and
/// deduplicates concurrent calls sharing the same `(executionId,
/// requestId)` so a retry issued by a faulty sandbox never reaches the
/// downstream server twice.
pub struct Dispatcher {
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<ConnectionQueue<ConcurrencyGuard>>,
    breakers: Arc<CircuitBreakerRegistry>,
    schema_cache: Arc<SchemaCache>,
    validator: Arc<SchemaValidator>,
    pool: Arc<DownstreamPool>,
    audit: Arc<AuditLog>,
    in_flight: DashMap<(String, String), Arc<DedupSlot>>,
}

impl Dispatcher {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        queue: Arc<ConnectionQueue<ConcurrencyGuard>>,
        breakers: Arc<CircuitBreakerRegistry>,
        schema_cache: Arc<SchemaCache>,
        validator: Arc<SchemaValidator>,
        pool: Arc<DownstreamPool>,
        audit: Arc<AuditLog>,
    ) -> Self {
        spawn_queue_pump(Arc::clone(&pool), Arc::clone(&queue));
        Self {
            rate_limiter,
            queue,
            breakers,
            schema_cache,
            validator,
            pool,
            audit,
            in_flight: DashMap::new(),
        }
    }

    pub async fn dispatch(&self, request: ToolCallRequest) -> Result<Value, OrchestratorError> {
        let key = (request.execution_id.clone(), request.request_id.clone());

        let existing = self.in_flight.get(&key).map(|slot| Arc::clone(&slot));
        if let Some(slot) = existing {
            return wait_for_slot(&slot).await;
        }

        let slot = Arc::new(DedupSlot {
            notify: Notify::new(),
            result: Mutex::new(None),
        });
        let inserted = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::clone(&slot));
        if !Arc::ptr_eq(&inserted, &slot) {
            // Lost the race to install the slot; attach to the winner.
            let winner = Arc::clone(&inserted);
            drop(inserted);
            return wait_for_slot(&winner).await;
        }
        drop(inserted);

        let outcome = self.run_pipeline(&request).await;

        {
            let mut guard = slot.result.lock().await;
            *guard = Some(outcome.clone());
        }
        slot.notify.notify_waiters();
        self.in_flight.remove(&key);

        outcome
    }

    async fn run_pipeline(&self, request: &ToolCallRequest) -> Result<Value, OrchestratorError> {
        let start = Instant::now();

        let rate_check = self.rate_limiter.check(&request.client_id);
        if !rate_check.allowed {
            self.audit_rejected(request, AuditEventKind::RateLimited).await;
            return Err(OrchestratorError::RateLimited {
                reset_in_ms: rate_check.reset_in_ms,
            });
        }

        if !tool_name_allowed(&request.tool_name, &request.allowed_patterns) {
            self.audit_rejected(request, AuditEventKind::ToolCall).await;
            return Err(OrchestratorError::ToolNotPermitted {
                tool: request.tool_name.clone(),
            });
        }

        let server_name = server_name_from_tool(&request.tool_name).ok_or_else(|| {
            OrchestratorError::ToolNotPermitted {
                tool: request.tool_name.clone(),
            }
        })?;

        if self.breakers.state_of(server_name) == toolmux_admission::BreakerState::Open {
            self.audit_rejected(request, AuditEventKind::CircuitOpen).await;
            return Err(OrchestratorError::CircuitOpen {
                server: server_name.to_string(),
            });
        }

        let descriptor = self
            .schema_cache
            .get_tool_schema(&request.tool_name, self.pool.as_ref())
            .await
            .map_err(|_| OrchestratorError::SchemaUnavailable {
                tool: request.tool_name.clone(),
            })?;

        let validation = self
            .validator
            .validate(&request.tool_name, &request.args, &descriptor.input_schema)
            .map_err(|_| OrchestratorError::SchemaUnavailable {
                tool: request.tool_name.clone(),
            })?;
        if !validation.ok {
            let issue = validation.errors.first();
            let event = AuditEvent::new(
                request.execution_id.clone(),
                AuditEventKind::ToolCall,
                AuditOutcome::Failure,
            )
            .with_tool_name(request.tool_name.clone());
            if let Err(err) = self.audit.record(&event).await {
                tracing::error!(error = %err, "audit append failed");
            }
            return Err(OrchestratorError::ValidationFailed {
                path: issue.map(|i| i.path.clone()).unwrap_or_default(),
                expected: issue.map(|i| i.expected.clone()).unwrap_or_default(),
            });
        }

        let guard = match self.pool.try_admit() {
            Some(guard) => guard,
            None => {
                let now = Instant::now();
                let wait_deadline = request.deadline.max(now);
                let ticket = match self
                    .queue
                    .enqueue(
                        request.request_id.clone(),
                        request.client_id.clone(),
                        request.tool_name.clone(),
                        wait_deadline,
                    )
                    .await
                {
                    Ok(ticket) => ticket,
                    Err(err) => {
                        self.audit_rejected(request, AuditEventKind::QueueFull).await;
                        return Err(err);
                    }
                };
                let outcome = tokio::select! {
                    outcome = ticket.wait() => outcome,
                    _ = request.cancellation.cancelled() => QueueOutcome::ShuttingDown,
                };
                match outcome {
                    QueueOutcome::Admitted(guard) => guard,
                    QueueOutcome::TimedOut => {
                        self.audit_outcome(request, AuditEventKind::ToolCall, AuditOutcome::Failure)
                            .await;
                        return Err(OrchestratorError::QueueTimeout);
                    }
                    QueueOutcome::ShuttingDown => return Err(OrchestratorError::Shutdown),
                }
            }
        };

        let breakers = Arc::clone(&self.breakers);
        let pool = Arc::clone(&self.pool);
        let tool_name = request.tool_name.clone();
        let args = request.args.clone();
        let server_name_owned = server_name.to_string();
        let bare_tool_name = tool_name.rsplit('.').next().unwrap_or(&tool_name).to_string();

        let result = breakers
            .execute(&server_name_owned, move || async move {
                let _guard = guard;
                pool.call_tool(&server_name_owned, &bare_tool_name, args).await
            })
            .await;

        match &result {
            Ok(_) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                self.audit
                    .record(
                        &AuditEvent::new(
                            request.execution_id.clone(),
                            AuditEventKind::ToolCall,
                            AuditOutcome::Success,
                        )
                        .with_tool_name(request.tool_name.clone())
                        .with_arg_hash(hash_args(&request.args))
                        .with_latency_ms(latency_ms),
                    )
                    .await
                    .unwrap_or_else(|err| tracing::error!(error = %err, "audit append failed"));
            }
            Err(err) => {
                self.audit
                    .record(
                        &AuditEvent::new(
                            request.execution_id.clone(),
                            AuditEventKind::ToolCall,
                            AuditOutcome::Failure,
                        )
                        .with_tool_name(request.tool_name.clone())
                        .with_sanitized_error(err.to_string()),
                    )
                    .await
                    .unwrap_or_else(|err| tracing::error!(error = %err, "audit append failed"));
            }
        }

        result
    }

    async fn audit_rejected(&self, request: &ToolCallRequest, kind: AuditEventKind) {
        self.audit_outcome(request, kind, AuditOutcome::Rejected).await;
    }

    async fn audit_outcome(&self, request: &ToolCallRequest, kind: AuditEventKind, outcome: AuditOutcome) {
        let event = AuditEvent::new(request.execution_id.clone(), kind, outcome)
            .with_tool_name(request.tool_name.clone());
        if let Err(err) = self.audit.record(&event).await {
            tracing::error!(error = %err, "audit append failed");
        }
    }
}

/// Hands each freed admission slot to the oldest connection-queue waiter.
/// Woken by every `ConcurrencyGuard` drop; reserves a slot itself via
/// `try_admit` before looking at the queue, so a single freed slot is never
/// handed to more than one waiter, and hands the reservation straight back
/// (dropping it, which frees the slot again) when nobody is waiting.
fn spawn_queue_pump(pool: Arc<DownstreamPool>, queue: Arc<ConnectionQueue<ConcurrencyGuard>>) {
    let released = pool.release_notifications();
    tokio::spawn(async move {
        loop {
            released.notified().await;
            while let Some(guard) = pool.try_admit() {
                if queue.dequeue(guard).await.is_err() {
                    break;
                }
            }
        }
    });
}

async fn wait_for_slot(slot: &DedupSlot) -> Result<Value, OrchestratorError> {
    loop {
        let notified = slot.notify.notified();
        {
            let guard = slot.result.lock().await;
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
        }
        notified.await;
    }
}

fn tool_name_allowed(tool_name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        Pattern::new(pattern)
            .map(|p| p.matches(tool_name))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_allow_list_matches_prefix_wildcard() {
        assert!(tool_name_allowed("mcp.srv-1.tool-a", &["mcp.srv-1.*".to_string()]));
        assert!(!tool_name_allowed("mcp.srv-2.tool-a", &["mcp.srv-1.*".to_string()]));
    }

    #[test]
    fn glob_allow_list_empty_denies_everything() {
        assert!(!tool_name_allowed("mcp.srv-1.tool-a", &[]));
    }
}
