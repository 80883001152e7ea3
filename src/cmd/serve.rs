//! HTTP server command: `foundry serve`.

use std::path::Path;

use anyhow::Result;

use foundry::config::FoundryConfig;
use foundry::llm::build_generator;
use foundry::server::{ServerConfig, open_state, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    host: Option<&str>,
    port: Option<u16>,
    max_iterations: Option<u32>,
) -> Result<()> {
    let mut config =
        FoundryConfig::with_cli_args(project_dir.to_path_buf(), max_iterations, port, None)?;
    if let Some(host) = host {
        config.toml.server.host = host.to_string();
    }

    let generator = build_generator(&config.toml.llm)?;
    tracing::info!(
        generator = generator.name(),
        database = %config.database_path().display(),
        "starting server"
    );
    let state = open_state(&config, generator)?;
    start_server(state, ServerConfig::from_config(&config)).await
}
