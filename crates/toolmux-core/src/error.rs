use thiserror::Error;

/// One variant per failure kind in the error taxonomy. `kind()` returns the
/// machine-readable tag used both on the wire (`error.kind`) and in audit
/// event kinds.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("argument at {path} failed validation: expected {expected}")]
    ValidationFailed { path: String, expected: String },

    #[error("tool '{tool}' is not permitted for this execution")]
    ToolNotPermitted { tool: String },

    #[error("schema for '{tool}' is unavailable")]
    SchemaUnavailable { tool: String },

    #[error("rate limit exceeded, retry in {reset_in_ms}ms")]
    RateLimited { reset_in_ms: u64 },

    #[error("admission queue is full")]
    QueueFull,

    #[error("admission queue wait timed out")]
    QueueTimeout,

    #[error("circuit open for downstream '{server}'")]
    CircuitOpen { server: String },

    #[error("downstream failure: {message}")]
    DownstreamFailure { message: String },

    #[error("sandbox execution exceeded its wall-clock deadline")]
    SandboxTimeout,

    #[error("sandbox exited with code {exit_code} without a structured error")]
    SandboxCrash { exit_code: i32 },

    #[error("bearer token authentication failed")]
    AuthFailure,

    #[error("operation aborted: server is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Machine-readable tag, used for the wire `error.kind` field and as the
    /// audit event kind where the two overlap.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation-failed",
            Self::ToolNotPermitted { .. } => "tool-not-permitted",
            Self::SchemaUnavailable { .. } => "schema-unavailable",
            Self::RateLimited { .. } => "rate-limited",
            Self::QueueFull => "queue-full",
            Self::QueueTimeout => "queue-timeout",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::DownstreamFailure { .. } => "downstream-failure",
            Self::SandboxTimeout => "sandbox-timeout",
            Self::SandboxCrash { .. } => "sandbox-crash",
            Self::AuthFailure => "auth-failure",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal-error",
        }
    }

    /// True for errors that should never include detail beyond the fixed
    /// message (auth failures must not leak timing- or content-distinguishing
    /// information to the caller).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_taxonomy() {
        assert_eq!(OrchestratorError::QueueFull.kind(), "queue-full");
        assert_eq!(
            OrchestratorError::RateLimited { reset_in_ms: 10 }.kind(),
            "rate-limited"
        );
        assert_eq!(
            OrchestratorError::CircuitOpen {
                server: "srv-1".into()
            }
            .kind(),
            "circuit-open"
        );
    }

    #[test]
    fn auth_failure_detection() {
        assert!(OrchestratorError::AuthFailure.is_auth_failure());
        assert!(!OrchestratorError::QueueFull.is_auth_failure());
    }
}
