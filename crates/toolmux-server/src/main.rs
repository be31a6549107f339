//! `toolmux` — the orchestration server binary.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use toolmux_core::ToolmuxConfig;
use toolmux_server::AppState;

/// Orchestration server letting an LLM-driven client execute sandboxed
/// programs while brokering tool calls to downstream MCP servers.
#[derive(Parser, Debug)]
#[command(name = "toolmux", about = "Sandboxed-execution orchestration server")]
struct Args {
    /// Path to a `toolmux.toml` config file, overriding the precedence chain.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the resolved state directory (schema cache, audit logs).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Serve the line-delimited JSON front-end over stdio.
    #[arg(long, conflicts_with = "listen")]
    stdio: bool,

    /// Serve the streaming HTTP front-end on this address, e.g. `127.0.0.1:8787`.
    #[arg(long, conflicts_with = "stdio")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if !args.stdio && args.listen.is_none() {
        anyhow::bail!("exactly one of --stdio or --listen <addr> is required");
    }

    let project_dir = std::env::current_dir()?;
    let mut config = if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read config file {}: {err}", path.display()))?;
        toml::from_str::<ToolmuxConfig>(&raw)?
    } else {
        ToolmuxConfig::load_from_precedence_chain(&project_dir)?
    }
    .apply_env_overrides();

    if let Some(dir) = &args.state_dir {
        config.state_dir = Some(dir.clone());
    }

    let state_dir = config.resolved_state_dir();
    tracing::info!(state_dir = %state_dir.display(), "resolved state directory");

    let state = AppState::build(config, state_dir).await?;

    if args.stdio {
        toolmux_server::serve_stdio(state).await
    } else {
        let addr = args.listen.expect("checked above");
        toolmux_server::serve_http(state, &addr).await
    }
}
