//! Streaming HTTP front-end (C12): a single `POST /execute` endpoint. Each
//! request body is one execute-request; the response body is the matching
//! execute-response, written once the Execution has fully resolved.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::wire::{ExecuteRequest, ExecuteResponse};

const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub async fn serve_http(state: Arc<AppState>, addr: &str) -> anyhow::Result<()> {
    state.spawn_background_tasks();

    let app = Router::new()
        .route("/execute", post(execute_handler))
        .route("/healthz", axum::routing::get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "toolmux HTTP front-end listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown::signal())
        .await?;

    state.shutdown(SHUTDOWN_DRAIN_DEADLINE).await;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let response = state.execute(request).await;
    (StatusCode::OK, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_rejects_missing_required_fields() {
        let raw = r#"{"language": "python"}"#;
        let result: Result<ExecuteRequest, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }
}
