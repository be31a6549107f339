use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn sandbox engine '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a sandbox engine needs to start one Execution.
pub struct SandboxSpawnSpec {
    pub code: String,
    pub bridge_url: String,
    pub bearer_token: String,
    pub allowed_tools: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub extra_env: HashMap<String, String>,
}

/// Abstracts over the two out-of-core-scope sandbox runtimes (a
/// script-language VM and a WebAssembly VM). The supervisor only needs to
/// spawn a process that reads the environment below and speaks HTTP back
/// to the bridge; it never inspects what's inside.
pub trait SandboxEngine: Send + Sync {
    fn spawn(&self, spec: &SandboxSpawnSpec) -> Result<Child, EngineError>;
}

/// Spawns a configured external executable, passing the user's code on
/// stdin and the bridge URL/token/allow-list/permissions through the
/// environment. Used for both configured engines since the spec requires
/// only the contract, not two bespoke runtimes authored in this crate.
pub struct CommandSandboxEngine {
    pub command: String,
    pub args: Vec<String>,
}

impl SandboxEngine for CommandSandboxEngine {
    fn spawn(&self, spec: &SandboxSpawnSpec) -> Result<Child, EngineError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.env("TOOLMUX_BRIDGE_URL", &spec.bridge_url);
        cmd.env("TOOLMUX_BEARER_TOKEN", &spec.bearer_token);
        cmd.env("TOOLMUX_ALLOWED_TOOLS", spec.allowed_tools.join(","));
        for (key, value) in &spec.extra_env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.spawn().map_err(|source| EngineError::Spawn {
            command: self.command.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failure_reports_command_name() {
        let engine = CommandSandboxEngine {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            args: vec![],
        };
        let spec = SandboxSpawnSpec {
            code: "noop".to_string(),
            bridge_url: "http://127.0.0.1:0".to_string(),
            bearer_token: "tok".to_string(),
            allowed_tools: vec![],
            working_dir: None,
            extra_env: HashMap::new(),
        };
        let result = engine.spawn(&spec);
        assert!(result.is_err());
    }
}
