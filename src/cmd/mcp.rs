//! MCP tool server command: `foundry mcp`.

use std::path::Path;

use anyhow::Result;

use foundry::config::FoundryConfig;
use foundry::llm::build_generator;
use foundry::mcp::serve_stdio;
use foundry::server::{open_state, sessions};

/// Serve the drafting tools on stdin/stdout. Everything human-readable goes
/// to the log on stderr; stdout carries protocol messages only.
pub async fn cmd_mcp(project_dir: &Path, max_iterations: Option<u32>) -> Result<()> {
    let config =
        FoundryConfig::with_cli_args(project_dir.to_path_buf(), max_iterations, None, None)?;
    let generator = build_generator(&config.toml.llm)?;
    tracing::info!(
        generator = generator.name(),
        database = %config.database_path().display(),
        "starting MCP server"
    );
    let state = open_state(&config, generator)?;
    sessions::reconcile(&state.db, &state.engine).await?;
    serve_stdio(state).await
}
