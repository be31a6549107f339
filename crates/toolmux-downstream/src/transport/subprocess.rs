use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool as RmcpTool};
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::process::Command;
use toolmux_cache::ToolDescriptor;

use super::{DownstreamTransport, TransportError};

const FULLY_QUALIFIED_PREFIX: &str = "mcp";

/// Line-delimited subprocess transport: spawns a child with the configured
/// command and environment, speaks MCP's JSON-RPC-style protocol over the
/// child's stdio. `rmcp`'s child-process transport already demultiplexes
/// responses by request id, so this wraps its running client directly.
pub struct SubprocessTransport {
    server_name: String,
    service: RunningService<RoleClient, ()>,
}

impl SubprocessTransport {
    pub async fn connect(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let transport = rmcp::transport::TokioChildProcess::new(cmd)
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
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
impl DownstreamTransport for SubprocessTransport {
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
