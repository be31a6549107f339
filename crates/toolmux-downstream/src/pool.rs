use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use toolmux_cache::{SchemaFetcher, ToolDescriptor};
use toolmux_core::DownstreamServerConfig;

use crate::transport::{DownstreamTransport, HttpTransport, SubprocessTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no downstream server configured with name '{0}'")]
    UnknownServer(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ServerHandle {
    config: DownstreamServerConfig,
    transport: RwLock<Option<Arc<dyn DownstreamTransport>>>,
    health: RwLock<HealthState>,
}

/// Maintains one live client per configured downstream server; routes
/// `call_tool`/`list_tools`/`get_tool_schema` to the right transport;
/// reconnects on demand; reports health. `active_concurrent` is the only
/// safe way to track in-flight calls across cancellation and panic: an
/// atomic counter paired with an RAII guard that decrements on every exit
/// path.
pub struct DownstreamPool {
    servers: HashMap<String, ServerHandle>,
    active_concurrent: Arc<AtomicUsize>,
    max_concurrent: usize,
    released: Arc<Notify>,
}

/// Decrements `active_concurrent` on drop, regardless of whether the call
/// completed, was cancelled, or the task panicked while holding it, then
/// notifies anyone waiting to hand the freed slot to a queued caller.
pub struct ConcurrencyGuard {
    counter: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_one();
    }
}

impl DownstreamPool {
    pub fn new(configs: Vec<DownstreamServerConfig>, max_concurrent: usize) -> Self {
        let servers = configs
            .into_iter()
            .map(|config| {
                (
                    config.name().to_string(),
                    ServerHandle {
                        config,
                        transport: RwLock::new(None),
                        health: RwLock::new(HealthState::Unknown),
                    },
                )
            })
            .collect();
        Self {
            servers,
            active_concurrent: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            released: Arc::new(Notify::new()),
        }
    }

    /// Attempts to admit a call under the concurrency cap. `None` means the
    /// caller must route through the connection queue instead.
    pub fn try_admit(&self) -> Option<ConcurrencyGuard> {
        loop {
            let current = self.active_concurrent.load(Ordering::SeqCst);
            if current >= self.max_concurrent {
                return None;
            }
            if self
                .active_concurrent
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(ConcurrencyGuard {
                    counter: Arc::clone(&self.active_concurrent),
                    released: Arc::clone(&self.released),
                });
            }
        }
    }

    pub fn active_concurrent(&self) -> usize {
        self.active_concurrent.load(Ordering::SeqCst)
    }

    /// Shared notifier fired every time a `ConcurrencyGuard` drops. Lets a
    /// caller that also holds the connection queue drive admission of the
    /// oldest waiter as soon as a slot frees.
    pub fn release_notifications(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }

    async fn connect(&self, handle: &ServerHandle) -> Result<Arc<dyn DownstreamTransport>, PoolError> {
        let transport: Arc<dyn DownstreamTransport> = match &handle.config {
            DownstreamServerConfig::Stdio {
                name, command, args, env,
            } => Arc::new(SubprocessTransport::connect(name, command, args, env).await?),
            DownstreamServerConfig::Http { name, url, headers } => {
                Arc::new(HttpTransport::connect(name, url, headers).await?)
            }
        };
        Ok(transport)
    }

    async fn handle_for(&self, server_name: &str) -> Result<&ServerHandle, PoolError> {
        self.servers
            .get(server_name)
            .ok_or_else(|| PoolError::UnknownServer(server_name.to_string()))
    }

    /// Returns the live transport for `server_name`, reconnecting if none
    /// is currently held.
    async fn transport_for(&self, server_name: &str) -> Result<Arc<dyn DownstreamTransport>, PoolError> {
        let handle = self.handle_for(server_name).await?;
        {
            let existing = handle.transport.read().await;
            if let Some(transport) = existing.as_ref() {
                return Ok(Arc::clone(transport));
            }
        }
        let transport = self.connect(handle).await?;
        {
            let mut slot = handle.transport.write().await;
            *slot = Some(Arc::clone(&transport));
        }
        *handle.health.write().await = HealthState::Healthy;
        Ok(transport)
    }

    async fn invalidate(&self, server_name: &str) {
        if let Some(handle) = self.servers.get(server_name) {
            *handle.transport.write().await = None;
            *handle.health.write().await = HealthState::Unhealthy;
        }
    }

    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<ToolDescriptor>, PoolError> {
        let transport = self.transport_for(server_name).await?;
        match transport.list_tools().await {
            Ok(descriptors) => Ok(descriptors),
            Err(err) => {
                self.invalidate(server_name).await;
                Err(err.into())
            }
        }
    }

    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, PoolError> {
        let transport = self.transport_for(server_name).await?;
        match transport.call_tool(tool_name, args).await {
            Ok(result) => Ok(result),
            Err(err @ TransportError::ToolError(_)) => Err(err.into()),
            Err(err) => {
                self.invalidate(server_name).await;
                Err(err.into())
            }
        }
    }

    pub async fn health_of(&self, server_name: &str) -> HealthState {
        match self.servers.get(server_name) {
            Some(handle) => *handle.health.read().await,
            None => HealthState::Unknown,
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}

/// Resolves the downstream server name from a fully-qualified tool name of
/// the form `prefix.server.tool`.
pub fn server_name_from_tool(full_name: &str) -> Option<&str> {
    let mut parts = full_name.splitn(3, '.');
    parts.next()?;
    parts.next()
}

#[async_trait]
impl SchemaFetcher for DownstreamPool {
    async fn fetch_schema(&self, name: &str) -> Result<ToolDescriptor, String> {
        let server = server_name_from_tool(name).ok_or_else(|| format!("malformed tool name '{name}'"))?;
        let descriptors = self.list_tools(server).await.map_err(|e| e.to_string())?;
        let bare_name = name.rsplit('.').next().unwrap_or(name);
        descriptors
            .into_iter()
            .find(|d| d.tool_name == bare_name)
            .ok_or_else(|| format!("tool '{name}' not found on downstream '{server}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_extracted_from_triple() {
        assert_eq!(server_name_from_tool("mcp.srv-1.tool-a"), Some("srv-1"));
        assert_eq!(server_name_from_tool("mcp"), None);
    }

    #[test]
    fn concurrency_guard_decrements_on_every_exit_path() {
        let pool = DownstreamPool::new(vec![], 1);
        {
            let _guard = pool.try_admit().unwrap();
            assert_eq!(pool.active_concurrent(), 1);
            assert!(pool.try_admit().is_none());
        }
        assert_eq!(pool.active_concurrent(), 0);
    }

    #[test]
    fn concurrency_guard_decrements_even_on_panic() {
        let pool = std::sync::Arc::new(DownstreamPool::new(vec![], 1));
        let pool_clone = std::sync::Arc::clone(&pool);
        let result = std::panic::catch_unwind(move || {
            let _guard = pool_clone.try_admit().unwrap();
            panic!("simulated failure while holding the guard");
        });
        assert!(result.is_err());
        assert_eq!(pool.active_concurrent(), 0);
    }

    #[tokio::test]
    async fn unknown_server_name_fails_with_unknown_server() {
        let pool = DownstreamPool::new(vec![], 1);
        let result = pool.list_tools("does-not-exist").await;
        assert!(matches!(result, Err(PoolError::UnknownServer(_))));
    }
}
