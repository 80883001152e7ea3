pub mod config;
pub mod db;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod server;
pub mod stages;
pub mod ui;
pub mod workflow;
