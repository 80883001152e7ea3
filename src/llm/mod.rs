//! Text generation backends used by the drafting and review stages.
//!
//! The workflow treats generation as an opaque service: a system prompt and
//! a user prompt go in, text comes out. `build_generator` picks the backend
//! named in `[llm]`.

pub mod claude;
pub mod openai;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{LlmProvider, LlmSection};

pub use claude::ClaudeCliGenerator;
pub use openai::OpenAiGenerator;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.7,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError>;
}

/// Build the generator configured in `[llm]`.
pub fn build_generator(llm: &LlmSection) -> Result<Arc<dyn TextGenerator>> {
    match llm.provider {
        LlmProvider::Openai => {
            let api_key = std::env::var(&llm.api_key_env)
                .with_context(|| format!("{} is not set", llm.api_key_env))?;
            Ok(Arc::new(
                OpenAiGenerator::new(api_key, &llm.model).with_base_url(&llm.base_url),
            ))
        }
        LlmProvider::Claude => {
            let cmd = llm
                .claude_cmd
                .clone()
                .unwrap_or_else(|| "claude".to_string());
            Ok(Arc::new(ClaudeCliGenerator::new(cmd)))
        }
    }
}

/// Stand-in for commands that only read threads and never draft.
pub struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(&self, _request: GenerationRequest) -> Result<String, LlmError> {
        Err(LlmError::RequestFailed(
            "text generation is not available in read-only commands".to_string(),
        ))
    }
}
