//! Line-delimited JSON front-end (C12): one execute-request per line on
//! stdin, one execute-response per line on stdout. Concurrent requests are
//! handled concurrently; responses may interleave with requests but each
//! line is a complete, independently-parseable JSON object.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::app::AppState;
use crate::wire::{ExecuteRequest, ExecuteResponse};

const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub async fn serve_stdio(state: Arc<AppState>) -> anyhow::Result<()> {
    state.spawn_background_tasks();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));

    let mut in_flight = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed, shutting down");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let state = Arc::clone(&state);
                let stdout = Arc::clone(&stdout);
                in_flight.push(tokio::spawn(async move {
                    let response = match serde_json::from_str::<ExecuteRequest>(&line) {
                        Ok(request) => state.execute(request).await,
                        Err(err) => ExecuteResponse::rejected(
                            "validation-failed",
                            format!("malformed execute-request: {err}"),
                        ),
                    };
                    write_response(&stdout, &response).await;
                }));
            }
            _ = crate::shutdown::signal() => {
                tracing::info!("stopping the stdio front-end, no further requests will be accepted");
                break;
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }

    state.shutdown(SHUTDOWN_DRAIN_DEADLINE).await;
    Ok(())
}

async fn write_response(stdout: &Arc<Mutex<tokio::io::Stdout>>, response: &ExecuteResponse) {
    let Ok(mut serialized) = serde_json::to_string(response) else {
        tracing::error!("failed to serialize execute-response");
        return;
    };
    serialized.push('\n');
    let mut guard = stdout.lock().await;
    if let Err(err) = guard.write_all(serialized.as_bytes()).await {
        tracing::error!(error = %err, "failed to write execute-response to stdout");
    }
    let _ = guard.flush().await;
}
