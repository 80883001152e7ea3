//! Configuration view and validation commands: `foundry config`.

use anyhow::Result;

use super::super::ConfigCommands;

use foundry::config::{FoundryConfig, FoundryToml};

fn print_toml(toml: &FoundryToml) {
    let workflow = &toml.workflow;
    println!("[workflow]");
    println!("  max_iterations = {}", workflow.max_iterations);
    println!("  safety_threshold = {}", workflow.safety_threshold);
    println!("  quality_threshold = {}", workflow.quality_threshold);
    println!(
        "  generation_timeout_secs = {}",
        workflow.generation_timeout_secs
    );
    println!("  apply_edits_on_approve = {}", workflow.apply_edits_on_approve);
    let stages: Vec<&str> = workflow.interrupt_before.iter().map(|s| s.as_str()).collect();
    println!("  interrupt_before = {:?}", stages);
    println!();

    println!("[llm]");
    println!("  provider = \"{}\"", toml.llm.provider);
    println!("  model = \"{}\"", toml.llm.model);
    println!("  base_url = \"{}\"", toml.llm.base_url);
    println!("  api_key_env = \"{}\"", toml.llm.api_key_env);
    println!("  temperature = {}", toml.llm.temperature);
    println!();

    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  database = \"{}\"", toml.server.database.display());
    println!("  cors_origins = {:?}", toml.server.cors_origins);
    println!();

    if let Some(dir) = &toml.logging.directory {
        println!("[logging]");
        println!("  directory = \"{}\"", dir.display());
        println!();
    }
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = FoundryConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foundry Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foundry.toml found at {}", config_path.display());
                println!("Using defaults. Run 'foundry config init' to create one.");
            }
            println!();

            // Effective values already include env overrides.
            print_toml(&config.toml);
            println!("Effective paths:");
            println!("  database = {}", config.database_path().display());
            match config.log_dir() {
                Some(dir) => println!("  logs = {}", dir.display()),
                None => println!("  logs = (stderr only)"),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foundry.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = FoundryToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("foundry.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.foundry_dir)?;
            FoundryToml::default().save(&config_path)?;

            println!("Created foundry.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [workflow] iteration budget, thresholds, interrupt points");
            println!("  - [llm] provider, model, api_key_env");
            println!("  - [server] host, port, database");
            println!();
        }
    }

    Ok(())
}
