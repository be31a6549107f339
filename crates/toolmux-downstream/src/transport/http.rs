use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool as RmcpTool};
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use std::collections::HashMap;
use toolmux_cache::ToolDescriptor;

use super::{DownstreamTransport, TransportError};

const FULLY_QUALIFIED_PREFIX: &str = "mcp";

/// Streaming HTTP transport: opens a long-lived connection to a URL and
/// speaks the same request/response protocol as the subprocess transport.
/// Reconnection with bounded exponential backoff is handled by
/// `DownstreamPool::call`, which re-opens the transport on a protocol
/// error rather than inside this type.
pub struct HttpTransport {
    server_name: String,
    service: RunningService<RoleClient, ()>,
}

impl HttpTransport {
    pub async fn connect(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut client_builder = reqwest::Client::builder();
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let val = reqwest::header::HeaderValue::from_str(value)
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            default_headers.insert(name, val);
        }
        client_builder = client_builder.default_headers(default_headers);
        let client = client_builder
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let transport = StreamableHttpClientTransport::with_client(
            client,
            rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                url.to_string(),
            ),
        );
        let service = ()
            .serve(transport)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self {
            server_name: server_name.to_string(),
            service,
        })
    }

    fn to_descriptor(&self, tool: RmcpTool) -> ToolDescriptor {
        ToolDescriptor {
            prefix: FULLY_QUALIFIED_PREFIX.to_string(),
            server_name: self.server_name.clone(),
            tool_name: tool.name.to_string(),
            description: tool
                .description
                .map(|d| d.to_string())
                .unwrap_or_default(),
            input_schema: serde_json::to_value(&tool.input_schema).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl DownstreamTransport for HttpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self
            .service
            .peer()
            .list_tools(Default::default())
            .await
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        Ok(result.tools.into_iter().map(|t| self.to_descriptor(t)).collect())
    }

    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value, TransportError> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(TransportError::Protocol(format!(
                    "tool arguments must be a JSON object, got {other}"
                )))
            }
        };
        let result = self
            .service
            .peer()
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|err| TransportError::ToolError(err.to_string()))?;
        serde_json::to_value(&result).map_err(|err| TransportError::Protocol(err.to_string()))
    }
}
