use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::format_description::well_known::Iso8601;
use time::{Date, OffsetDateTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    AuthFailure,
    RateLimited,
    CircuitOpen,
    QueueFull,
    ToolCall,
    Shutdown,
    Discovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Rejected,
}

/// One line of the audit log. Never carries plaintext secrets or argument
/// values — only SHA-256 hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub correlation_id: String,
    pub kind: AuditEventKind,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    pub fn new(correlation_id: impl Into<String>, kind: AuditEventKind, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc()
                .format(&Iso8601::DEFAULT)
                .unwrap_or_default(),
            correlation_id: correlation_id.into(),
            kind,
            outcome,
            tool_name: None,
            arg_hash: None,
            latency_ms: None,
            sanitized_error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_arg_hash(mut self, arg_hash: impl Into<String>) -> Self {
        self.arg_hash = Some(arg_hash.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_sanitized_error(mut self, message: impl Into<String>) -> Self {
        self.sanitized_error = Some(message.into());
        self
    }
}

/// Hashes a request argument payload to the hex-encoded SHA-256 digest
/// stored in audit events instead of the raw payload.
pub fn hash_args(args: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(args).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to create audit log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open audit log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write audit record: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to serialize audit event: {0}")]
    Serialize(#[source] serde_json::Error),
}

struct WriterState {
    date: Date,
    file: File,
}

/// Append-only, daily-rotated JSONL audit log with a retention sweep.
/// All appends are serialized through an internal mutex (the `log-write`
/// named mutex from the design notes, made an explicit owned lock).
pub struct AuditLog {
    dir: PathBuf,
    writer: Mutex<Option<WriterState>>,
}

impl AuditLog {
    /// `state_dir` is the top-level state directory; the log directory is
    /// `<state_dir>/audit-logs`. Fatal if the directory cannot be created.
    pub async fn new(state_dir: &Path) -> Result<Self, AuditError> {
        let dir = state_dir.join("audit-logs");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| AuditError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            dir,
            writer: Mutex::new(None),
        })
    }

    fn file_name_for(date: Date) -> String {
        format!(
            "audit-{:04}-{:02}-{:02}.log",
            date.year(),
            u8::from(date.month()),
            date.day()
        )
    }

    async fn writer_for(&self, date: Date, guard: &mut Option<WriterState>) -> Result<(), AuditError> {
        let needs_new = match guard {
            Some(state) if state.date == date => false,
            _ => true,
        };
        if needs_new {
            let path = self.dir.join(Self::file_name_for(date));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|source| AuditError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            *guard = Some(WriterState { date, file });
        }
        Ok(())
    }

    /// Returns only after the event is durably appended to the day's log
    /// file. Callers must not block user-visible work on the result but
    /// must surface a failure to stderr (see the caller contract in the
    /// component design).
    pub async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event).map_err(AuditError::Serialize)?;
        let today = OffsetDateTime::now_utc().date();
        let mut guard = self.writer.lock().await;
        self.writer_for(today, &mut guard).await?;
        let state = guard.as_mut().expect("writer installed above");
        state
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(AuditError::Write)?;
        state.file.write_all(b"\n").await.map_err(AuditError::Write)?;
        state.file.flush().await.map_err(AuditError::Write)?;
        Ok(())
    }

    /// Deletes log files older than `retention_days`. Idempotent; a failure
    /// to delete one file does not abort the sweep.
    pub async fn sweep(&self, retention_days: u32) -> Result<usize, AuditError> {
        let cutoff = OffsetDateTime::now_utc().date() - time::Duration::days(retention_days as i64);
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(date) = parse_log_date(name) else {
                continue;
            };
            if date < cutoff {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn parse_log_date(name: &str) -> Option<Date> {
    let stripped = name.strip_prefix("audit-")?.strip_suffix(".log")?;
    let mut parts = stripped.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_reread_decodes_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).await.unwrap();
        let event = AuditEvent::new("corr-1", AuditEventKind::ToolCall, AuditOutcome::Success)
            .with_tool_name("srv-1.tool-a")
            .with_latency_ms(12);
        log.record(&event).await.unwrap();

        let today = OffsetDateTime::now_utc().date();
        let path = dir
            .path()
            .join("audit-logs")
            .join(AuditLog::file_name_for(today));
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        let last_line = contents.lines().last().unwrap();
        let decoded: AuditEvent = serde_json::from_str(last_line).unwrap();
        assert_eq!(decoded.correlation_id, "corr-1");
        assert_eq!(decoded.tool_name.as_deref(), Some("srv-1.tool-a"));
    }

    #[tokio::test]
    async fn sweep_removes_only_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).await.unwrap();
        let log_dir = dir.path().join("audit-logs");

        let old_date = OffsetDateTime::now_utc().date() - time::Duration::days(40);
        let old_path = log_dir.join(AuditLog::file_name_for(old_date));
        tokio::fs::write(&old_path, "{}\n").await.unwrap();

        let today = OffsetDateTime::now_utc().date();
        let fresh_path = log_dir.join(AuditLog::file_name_for(today));
        tokio::fs::write(&fresh_path, "{}\n").await.unwrap();

        let removed = log.sweep(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old_path.exists());
        assert!(fresh_path.exists());
    }

    #[test]
    fn hash_args_is_deterministic_and_hides_payload() {
        let args = serde_json::json!({"x": 1});
        let h1 = hash_args(&args);
        let h2 = hash_args(&args);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
