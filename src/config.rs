//! Configuration for Foundry, read from `.foundry/foundry.toml`.
//!
//! Layered the usual way: file → environment (`.env` is loaded first) → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workflow]
//! max_iterations = 5
//! safety_threshold = 80
//! quality_threshold = 70
//! generation_timeout_secs = 60
//! apply_edits_on_approve = false
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! database = ".foundry/foundry.db"
//!
//! [logging]
//! directory = ".foundry/logs"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::workflow::StageName;

pub const FOUNDRY_DIR: &str = ".foundry";
pub const CONFIG_FILE: &str = "foundry.toml";

/// Iteration budget, thresholds and interrupt points of the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Drafting rounds before the coordinator forces human review
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: u8,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,
    /// Deadline for one text generation call; expiry yields the stage fallback
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Whether reviewer edits sent with an approval replace the draft
    #[serde(default)]
    pub apply_edits_on_approve: bool,
    /// Stages the engine pauses before
    #[serde(default = "default_interrupt_before")]
    pub interrupt_before: Vec<StageName>,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_safety_threshold() -> u8 {
    80
}

fn default_quality_threshold() -> u8 {
    70
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_interrupt_before() -> Vec<StageName> {
    vec![StageName::HumanGate]
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            safety_threshold: default_safety_threshold(),
            quality_threshold: default_quality_threshold(),
            generation_timeout_secs: default_generation_timeout_secs(),
            apply_edits_on_approve: false,
            interrupt_before: default_interrupt_before(),
        }
    }
}

impl WorkflowSection {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Openai,
    Claude,
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Claude => write!(f, "claude"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "claude" => Ok(Self::Claude),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

/// Text generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            claude_cmd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite file, relative to the project directory
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database() -> PathBuf {
    PathBuf::from(FOUNDRY_DIR).join("foundry.db")
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily JSON log files; stderr only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Contents of `foundry.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FoundryToml {
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FoundryToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foundry.toml")
    }

    /// Load `.foundry/foundry.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(foundry_dir: &Path) -> Result<Self> {
        let config_path = foundry_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foundry.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>>
        where
            T::Err: fmt::Display,
        {
            value
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, v, e))
                })
                .transpose()
        }

        if let Some(v) = parsed("FOUNDRY_MAX_ITERATIONS", lookup("FOUNDRY_MAX_ITERATIONS"))? {
            self.workflow.max_iterations = v;
        }
        if let Some(v) = parsed("FOUNDRY_SAFETY_THRESHOLD", lookup("FOUNDRY_SAFETY_THRESHOLD"))? {
            self.workflow.safety_threshold = v;
        }
        if let Some(v) = parsed("FOUNDRY_QUALITY_THRESHOLD", lookup("FOUNDRY_QUALITY_THRESHOLD"))? {
            self.workflow.quality_threshold = v;
        }
        if let Some(v) = parsed(
            "FOUNDRY_GENERATION_TIMEOUT_SECS",
            lookup("FOUNDRY_GENERATION_TIMEOUT_SECS"),
        )? {
            self.workflow.generation_timeout_secs = v;
        }
        if let Some(v) = parsed("FOUNDRY_PROVIDER", lookup("FOUNDRY_PROVIDER"))? {
            self.llm.provider = v;
        }
        if let Some(model) = lookup("FOUNDRY_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = lookup("FOUNDRY_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD")
            && self.llm.claude_cmd.is_none()
        {
            self.llm.claude_cmd = Some(cmd);
        }
        if let Some(host) = lookup("FOUNDRY_HOST") {
            self.server.host = host;
        }
        if let Some(v) = parsed("FOUNDRY_PORT", lookup("FOUNDRY_PORT"))? {
            self.server.port = v;
        }
        if let Some(db) = lookup("FOUNDRY_DATABASE") {
            self.server.database = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn claude_cmd(&self) -> String {
        self.llm
            .claude_cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.workflow.safety_threshold > 100 {
            warnings.push(format!(
                "safety_threshold {} is above 100 and can never be met",
                self.workflow.safety_threshold
            ));
        }
        if self.workflow.quality_threshold > 100 {
            warnings.push(format!(
                "quality_threshold {} is above 100 and can never be met",
                self.workflow.quality_threshold
            ));
        }
        if self.workflow.generation_timeout_secs == 0 {
            warnings.push("generation_timeout_secs is 0: every stage will fall back".to_string());
        }
        if self.workflow.interrupt_before.is_empty() {
            warnings.push("interrupt_before is empty: drafts are never reviewed".to_string());
        }
        if self.llm.model.trim().is_empty() {
            warnings.push("llm.model is empty".to_string());
        }

        warnings
    }
}

/// Configuration resolved for one project directory.
#[derive(Debug, Clone)]
pub struct FoundryConfig {
    pub project_dir: PathBuf,
    pub foundry_dir: PathBuf,
    pub toml: FoundryToml,
}

impl FoundryConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foundry_dir = project_dir.join(FOUNDRY_DIR);
        // A missing .env is normal.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let mut toml = FoundryToml::load_or_default(&foundry_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            foundry_dir,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment.
    pub fn with_cli_args(
        project_dir: PathBuf,
        max_iterations: Option<u32>,
        port: Option<u16>,
        database: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        if let Some(max) = max_iterations {
            config.toml.workflow.max_iterations = max;
        }
        if let Some(port) = port {
            config.toml.server.port = port;
        }
        if let Some(db) = database {
            config.toml.server.database = db;
        }
        Ok(config)
    }

    pub fn workflow(&self) -> &WorkflowSection {
        &self.toml.workflow
    }

    pub fn config_file(&self) -> PathBuf {
        self.foundry_dir.join(CONFIG_FILE)
    }

    /// Database path resolved against the project directory.
    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.toml.server.database)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_deref().map(|d| self.resolve(d))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}
