use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use toolmux_core::OrchestratorError;

/// Per-Execution authentication context for the loopback bridge. The token
/// is compared in constant time; the listener only ever binds the loopback
/// address, so a non-local caller is refused at the network layer before
/// this type is ever consulted.
pub struct BridgeSession {
    pub correlation_id: String,
    token: [u8; 32],
    pub started_at: Instant,
}

impl BridgeSession {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self {
            correlation_id: correlation_id.into(),
            token,
            started_at: Instant::now(),
        }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    /// Constant-time comparison against the raw bearer bytes presented in an
    /// `Authorization: Bearer <token>` header. Never short-circuits on
    /// length or content, so a wrong-length or wrong-prefix token takes the
    /// same path as a byte-for-byte near match.
    fn accepts(&self, presented_hex: &str) -> bool {
        let Ok(presented) = hex::decode(presented_hex) else {
            return false;
        };
        if presented.len() != self.token.len() {
            return false;
        }
        presented.ct_eq(&self.token).into()
    }
}

#[derive(Deserialize)]
struct ToolCallBody {
    #[serde(rename = "toolName")]
    tool_name: String,
    args: serde_json::Value,
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Serialize)]
struct ToolCallOk {
    result: serde_json::Value,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// Invoked once per tool call reaching the bridge; implemented by the
/// request dispatcher in the owning `Execution`. Kept as a trait (rather
/// than depending on `toolmux-dispatcher` directly) so this crate's only
/// coupling to the dispatcher is through the object the supervisor wires
/// up, matching the pattern of `SchemaFetcher` in `toolmux-cache` avoiding a
/// dependency cycle.
#[async_trait::async_trait]
pub trait BridgeCallHandler: Send + Sync {
    async fn call_tool(
        &self,
        request_id: String,
        tool_name: String,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError>;

    async fn list_tools(&self) -> Result<serde_json::Value, OrchestratorError>;
}

struct BridgeState {
    session: Arc<BridgeSession>,
    handler: Arc<dyn BridgeCallHandler>,
    tool_call_count: std::sync::atomic::AtomicU64,
}

/// The localhost-only HTTP endpoint (C11) a single Execution's sandbox
/// talks to. Binds `127.0.0.1:0`, so the OS picks an ephemeral port and
/// nothing outside the loopback interface can ever reach it.
pub struct ToolBridge {
    pub port: u16,
    pub session: Arc<BridgeSession>,
    shutdown: Option<oneshot::Sender<()>>,
    server_task: tokio::task::JoinHandle<()>,
}

impl ToolBridge {
    pub async fn bind(
        correlation_id: impl Into<String>,
        handler: Arc<dyn BridgeCallHandler>,
    ) -> std::io::Result<Self> {
        let session = Arc::new(BridgeSession::new(correlation_id));
        let state = Arc::new(BridgeState {
            session: Arc::clone(&session),
            handler,
            tool_call_count: std::sync::atomic::AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/tool-call", post(handle_tool_call))
            .route("/list-tools", post(handle_list_tools))
            .with_state(state);

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            port,
            session,
            shutdown: Some(shutdown_tx),
            server_task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Tears down the listener synchronously; any in-flight request at that
    /// moment is aborted along with the server task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), &mut self.server_task).await;
        if !self.server_task.is_finished() {
            self.server_task.abort();
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::to_string)
}

fn unauthorized() -> Response {
    StatusCode::UNAUTHORIZED.into_response()
}

async fn handle_tool_call(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    Json(body): Json<ToolCallBody>,
) -> Response {
    let Some(presented) = extract_bearer(&headers) else {
        return unauthorized();
    };
    if !state.session.accepts(&presented) {
        return unauthorized();
    }

    let call = std::panic::AssertUnwindSafe(state.handler.call_tool(
        body.request_id,
        body.tool_name,
        body.args,
    ));

    match futures::FutureExt::catch_unwind(call).await {
        Ok(Ok(result)) => {
            state
                .tool_call_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Json(ToolCallOk { result }).into_response()
        }
        Ok(Err(err)) => error_response(&err),
        Err(_) => error_response(&OrchestratorError::Internal(
            "tool call panicked".to_string(),
        )),
    }
}

async fn handle_list_tools(State(state): State<Arc<BridgeState>>, headers: HeaderMap) -> Response {
    let Some(presented) = extract_bearer(&headers) else {
        return unauthorized();
    };
    if !state.session.accepts(&presented) {
        return unauthorized();
    }

    match state.handler.list_tools().await {
        Ok(descriptors) => Json(descriptors).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &OrchestratorError) -> Response {
    if err.is_auth_failure() {
        return unauthorized();
    }
    let status = match err {
        OrchestratorError::ValidationFailed { .. } | OrchestratorError::ToolNotPermitted { .. } => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::RateLimited { .. } | OrchestratorError::QueueFull => {
            StatusCode::TOO_MANY_REQUESTS
        }
        OrchestratorError::CircuitOpen { .. } | OrchestratorError::SchemaUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                kind: err.kind(),
                message: err.to_string(),
            },
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl BridgeCallHandler for EchoHandler {
        async fn call_tool(
            &self,
            _request_id: String,
            _tool_name: String,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, OrchestratorError> {
            Ok(args)
        }

        async fn list_tools(&self) -> Result<serde_json::Value, OrchestratorError> {
            Ok(serde_json::json!([]))
        }
    }

    #[test]
    fn session_rejects_wrong_length_token() {
        let session = BridgeSession::new("corr-1");
        assert!(!session.accepts("deadbeef"));
    }

    #[test]
    fn session_accepts_its_own_token() {
        let session = BridgeSession::new("corr-1");
        assert!(session.accepts(&session.token_hex()));
    }

    #[test]
    fn session_rejects_malformed_hex() {
        let session = BridgeSession::new("corr-1");
        assert!(!session.accepts("not-hex-at-all"));
    }

    #[tokio::test]
    async fn bind_assigns_loopback_port_and_url() {
        let bridge = ToolBridge::bind("corr-1", Arc::new(EchoHandler)).await.unwrap();
        assert!(bridge.port > 0);
        assert!(bridge.url().starts_with("http://127.0.0.1:"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_token_yields_401() {
        let bridge = ToolBridge::bind("corr-1", Arc::new(EchoHandler)).await.unwrap();
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/tool-call", bridge.url()))
            .header("Authorization", "Bearer wrong")
            .json(&serde_json::json!({"toolName": "x", "args": {}, "requestId": "r1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn correct_token_reaches_handler() {
        let bridge = ToolBridge::bind("corr-1", Arc::new(EchoHandler)).await.unwrap();
        let token = bridge.session.token_hex();
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/tool-call", bridge.url()))
            .header("Authorization", format!("Bearer {token}"))
            .json(&serde_json::json!({"toolName": "x", "args": {"y": 1}, "requestId": "r1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        bridge.shutdown().await;
    }
}
