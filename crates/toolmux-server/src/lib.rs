//! Composition root and front-ends (C12) for the toolmux orchestration
//! server: wires the admission, cache, downstream, dispatch, and sandbox
//! crates together behind a line-delimited stdio transport and a streaming
//! HTTP transport, and owns the graceful-shutdown sequence (C13).

mod app;
mod http;
mod shutdown;
mod stdio;
mod wire;

pub use app::AppState;
pub use http::serve_http;
pub use stdio::serve_stdio;
pub use wire::{ExecuteRequest, ExecuteResponse};
