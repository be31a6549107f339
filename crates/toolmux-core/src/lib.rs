//! Shared error taxonomy, path utilities, configuration types, and the
//! content filter used across the toolmux orchestrator crates.

mod config;
mod content_filter;
mod error;
mod path;

pub use config::{
    AdmissionConfig, AuditConfig, CircuitBreakerConfig, DownstreamServerConfig, RateLimitConfig,
    SandboxConfig, SandboxEngineConfig, SchemaCacheConfig, ToolmuxConfig,
};
pub use content_filter::{redact, RedactedText};
pub use error::OrchestratorError;
pub use path::{canonicalize_under, PathError};
