use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// Immutable descriptor of one downstream tool. Mutated only by wholesale
/// replacement on refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub prefix: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.prefix, self.server_name, self.tool_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    descriptor: ToolDescriptor,
    fetched_at: u64,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        let now = now_unix();
        now.saturating_sub(self.fetched_at) > ttl.as_secs()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Error)]
pub enum SchemaCacheError {
    #[error("no schema available for '{0}', not even stale")]
    Unavailable(String),
}

/// Abstraction over "ask the downstream pool for this tool's descriptor",
/// implemented by `toolmux-downstream`. Kept here, rather than depending on
/// that crate directly, to avoid a dependency cycle (the downstream pool
/// uses this cache to avoid re-fetching schemas on every call).
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch_schema(&self, name: &str) -> Result<ToolDescriptor, String>;
}

struct InFlight {
    notify: Notify,
    result: Mutex<Option<Result<ToolDescriptor, String>>>,
}

/// TTL + LRU cache of tool descriptors with single-flight fetch and disk
/// persistence, grounded on the same staleness/hashing pattern as a
/// registry cache used elsewhere in the corpus.
pub struct SchemaCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    pending: Mutex<HashMap<String, Arc<InFlight>>>,
    ttl: Duration,
    disk_path: PathBuf,
    disk_write: Mutex<()>,
}

#[derive(Serialize, Deserialize, Default)]
struct DiskCache {
    entries: HashMap<String, CacheEntry>,
}

impl SchemaCache {
    pub fn new(state_dir: &Path, max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(HashMap::new()),
            ttl,
            disk_path: state_dir.join("schema-cache.json"),
            disk_write: Mutex::new(()),
        }
    }

    /// Best-effort load at startup: a corrupt file starts the cache empty
    /// and logs a warning rather than failing the boot.
    pub async fn load_from_disk(&self) {
        let raw = match tokio::fs::read_to_string(&self.disk_path).await {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<DiskCache>(&raw) {
            Ok(disk) => {
                let mut entries = self.entries.lock().await;
                for (name, entry) in disk.entries {
                    entries.put(name, entry);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %self.disk_path.display(), "schema cache file corrupt, starting empty");
            }
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let entries = self.entries.lock().await;
            let mut out = HashMap::new();
            for (name, entry) in entries.iter() {
                out.insert(name.clone(), entry.clone());
            }
            out
        };
        let _guard = self.disk_write.lock().await;
        let serialized = match serde_json::to_string(&DiskCache { entries: snapshot }) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize schema cache");
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.disk_path, serialized).await {
            tracing::warn!(error = %err, path = %self.disk_path.display(), "failed to persist schema cache");
        }
    }

    /// Flushes the current in-memory cache to disk. Called explicitly
    /// during graceful shutdown.
    pub async fn persist_to_disk(&self) {
        self.persist().await;
    }

    pub async fn get_tool_schema(
        &self,
        name: &str,
        fetcher: &dyn SchemaFetcher,
    ) -> Result<ToolDescriptor, SchemaCacheError> {
        // Fast path: fresh entry already in memory.
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(name) {
                if !entry.is_stale(self.ttl) {
                    return Ok(entry.descriptor.clone());
                }
            }
        }

        // Single-flight: attach to an in-flight fetch if one exists,
        // otherwise become the one fetcher.
        let in_flight = {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(name) {
                Some(Arc::clone(existing))
            } else {
                let slot = Arc::new(InFlight {
                    notify: Notify::new(),
                    result: Mutex::new(None),
                });
                pending.insert(name.to_string(), Arc::clone(&slot));
                None
            }
        };

        if let Some(slot) = in_flight {
            loop {
                let notified = slot.notify.notified();
                {
                    let guard = slot.result.lock().await;
                    if let Some(result) = guard.as_ref() {
                        return result
                            .clone()
                            .map_err(|_| SchemaCacheError::Unavailable(name.to_string()));
                    }
                }
                notified.await;
            }
        }

        let fetch_result = fetcher.fetch_schema(name).await;
        let outcome = match &fetch_result {
            Ok(descriptor) => {
                let entry = CacheEntry {
                    descriptor: descriptor.clone(),
                    fetched_at: now_unix(),
                };
                let mut entries = self.entries.lock().await;
                entries.put(name.to_string(), entry);
                drop(entries);
                self.persist().await;
                Ok(descriptor.clone())
            }
            Err(err) => {
                // stale-on-error: serve a past-TTL entry in preference to
                // failing closed.
                let stale = {
                    let mut entries = self.entries.lock().await;
                    entries.get(name).map(|e| e.descriptor.clone())
                };
                match stale {
                    Some(descriptor) => {
                        tracing::warn!(tool = name, error = %err, "serving stale schema after fetch failure");
                        Ok(descriptor)
                    }
                    None => Err(SchemaCacheError::Unavailable(name.to_string())),
                }
            }
        };

        let slot = {
            let mut pending = self.pending.lock().await;
            pending.remove(name).expect("we inserted this slot above")
        };
        {
            let mut guard = slot.result.lock().await;
            *guard = Some(outcome.clone().map_err(|e| e.to_string()));
        }
        slot.notify.notify_waiters();

        outcome
    }

    pub async fn list_all_tool_schemas(&self) -> Vec<ToolDescriptor> {
        let entries = self.entries.lock().await;
        entries.iter().map(|(_, e)| e.descriptor.clone()).collect()
    }

    pub async fn invalidate(&self, name: &str) {
        let mut entries = self.entries.lock().await;
        entries.pop(name);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SchemaFetcher for CountingFetcher {
        async fn fetch_schema(&self, name: &str) -> Result<ToolDescriptor, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err("downstream unreachable".into());
            }
            Ok(ToolDescriptor {
                prefix: "srv".into(),
                server_name: "srv-1".into(),
                tool_name: name.into(),
                description: "test tool".into(),
                input_schema: serde_json::json!({"type": "object"}),
            })
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_for_same_tool_are_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SchemaCache::new(dir.path(), 10, Duration::from_secs(60)));
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                cache.get_tool_schema("tool-a", fetcher.as_ref()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_then_get_serves_from_memory_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path(), 10, Duration::from_secs(60));
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        cache.clear().await;
        let first = cache.get_tool_schema("tool-a", &fetcher).await.unwrap();
        let second = cache.get_tool_schema("tool-a", &fetcher).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_on_error_serves_past_ttl_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path(), 10, Duration::from_millis(1));
        let good_fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        cache.get_tool_schema("tool-a", &good_fetcher).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let failing_fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let result = cache.get_tool_schema("tool-a", &failing_fetcher).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unavailable_when_no_stale_entry_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path(), 10, Duration::from_secs(60));
        let failing_fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let result = cache.get_tool_schema("tool-a", &failing_fetcher).await;
        assert!(matches!(result, Err(SchemaCacheError::Unavailable(_))));
    }

    #[tokio::test]
    async fn corrupt_disk_file_starts_empty_without_panic() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("schema-cache.json"), b"not json")
            .await
            .unwrap();
        let cache = SchemaCache::new(dir.path(), 10, Duration::from_secs(60));
        cache.load_from_disk().await;
        assert!(cache.list_all_tool_schemas().await.is_empty());
    }
}
