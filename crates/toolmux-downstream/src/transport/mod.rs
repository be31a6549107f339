mod http;
mod subprocess;

pub use http::HttpTransport;
pub use subprocess::SubprocessTransport;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use toolmux_cache::ToolDescriptor;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn downstream subprocess: {0}")]
    Spawn(String),
    #[error("failed to connect to downstream HTTP endpoint: {0}")]
    Connect(String),
    #[error("downstream transport error: {0}")]
    Protocol(String),
    #[error("downstream tool returned an error: {0}")]
    ToolError(String),
}

/// Both supported transports (line-delimited subprocess, streaming HTTP)
/// implement the same minimal protocol: `listTools` and `callTool`,
/// addressed internally by a monotonically increasing request id.
#[async_trait]
pub trait DownstreamTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value, TransportError>;
    /// Cheap liveness probe used by the circuit breaker's half-open probe
    /// and by health reporting; implementations may alias this to
    /// `list_tools` if the transport has no lighter-weight ping.
    async fn ping(&self) -> Result<(), TransportError> {
        self.list_tools().await.map(|_| ())
    }
}
