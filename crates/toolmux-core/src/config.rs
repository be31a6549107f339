use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_state_dir() -> Option<PathBuf> {
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub queue_size: usize,
    pub queue_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            queue_size: 200,
            queue_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_seconds: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// A configured downstream endpoint. Mirrors the shape the agent crate this
/// was grounded on uses for `McpServer::{Stdio, Http}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum DownstreamServerConfig {
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        name: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl DownstreamServerConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } => name,
            Self::Http { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEngineConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub engines: HashMap<String, SandboxEngineConfig>,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_code_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engines: HashMap::new(),
            default_timeout_ms: 30_000,
            max_timeout_ms: 600_000,
            max_code_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolmuxConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default = "default_state_dir")]
    pub state_dir: Option<PathBuf>,
    pub audit: AuditConfig,
    pub rate_limit: RateLimitConfig,
    pub admission: AdmissionConfig,
    pub schema_cache: SchemaCacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub downstream_servers: Vec<DownstreamServerConfig>,
    pub sandbox: SandboxConfig,
}

impl ToolmuxConfig {
    /// Loads the file component of the configuration by walking the
    /// precedence chain project → user home → XDG config dir, returning the
    /// first that parses. Missing files are skipped, not errors; a
    /// malformed file that does exist is an error (fail loud on explicit
    /// misconfiguration, fail soft on absence).
    pub fn load_from_precedence_chain(project_dir: &Path) -> anyhow::Result<Self> {
        let candidates = [
            project_dir.join("toolmux.toml"),
            dirs::home_dir()
                .map(|h| h.join(".toolmux.toml"))
                .unwrap_or_default(),
            dirs::config_dir()
                .map(|c| c.join("toolmux").join("config.toml"))
                .unwrap_or_default(),
        ];
        for candidate in candidates {
            if candidate.as_os_str().is_empty() || !candidate.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&candidate)?;
            return Ok(toml::from_str(&raw)?);
        }
        Ok(Self::default())
    }

    /// Applies environment-variable overrides on top of a loaded config.
    /// Env vars win over file values; callers layer per-request overrides
    /// on top of the result.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("TOOLMUX_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(val) = std::env::var("TOOLMUX_AUDIT_ENABLED") {
            self.audit.enabled = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = std::env::var("TOOLMUX_AUDIT_RETENTION_DAYS") {
            if let Ok(n) = val.parse() {
                self.audit.retention_days = n;
            }
        }
        if let Ok(val) = std::env::var("TOOLMUX_MAX_CONCURRENT") {
            if let Ok(n) = val.parse() {
                self.admission.max_concurrent = n;
            }
        }
        if let Ok(val) = std::env::var("TOOLMUX_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                self.admission.queue_size = n;
            }
        }
        if let Ok(val) = std::env::var("TOOLMUX_QUEUE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.admission.queue_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("TOOLMUX_SCHEMA_CACHE_MAX") {
            if let Ok(n) = val.parse() {
                self.schema_cache.max_entries = n;
            }
        }
        if let Ok(val) = std::env::var("TOOLMUX_SCHEMA_CACHE_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                self.schema_cache.ttl_seconds = n;
            }
        }
        self
    }

    /// Resolves the effective state directory: explicit config, else
    /// `dirs::config_dir()/toolmux`.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("toolmux")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_resource_caps() {
        let cfg = ToolmuxConfig::default();
        assert_eq!(cfg.admission.max_concurrent, 100);
        assert_eq!(cfg.admission.queue_size, 200);
        assert_eq!(cfg.schema_cache.max_entries, 1000);
        assert_eq!(cfg.schema_cache.ttl_seconds, 86_400);
        assert_eq!(cfg.audit.retention_days, 30);
        assert_eq!(cfg.sandbox.max_code_bytes, 100 * 1024);
    }

    #[test]
    fn missing_precedence_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ToolmuxConfig::load_from_precedence_chain(dir.path()).unwrap();
        assert_eq!(cfg.admission.max_concurrent, 100);
    }

    #[test]
    fn project_file_parses_and_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("toolmux.toml"),
            "[admission]\nmax_concurrent = 5\n",
        )
        .unwrap();
        let cfg = ToolmuxConfig::load_from_precedence_chain(dir.path()).unwrap();
        assert_eq!(cfg.admission.max_concurrent, 5);
    }

    #[test]
    fn env_override_wins_over_file_value() {
        std::env::set_var("TOOLMUX_MAX_CONCURRENT", "7");
        let cfg = ToolmuxConfig::default().apply_env_overrides();
        assert_eq!(cfg.admission.max_concurrent, 7);
        std::env::remove_var("TOOLMUX_MAX_CONCURRENT");
    }
}
