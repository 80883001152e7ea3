//! Generation through the `claude` CLI in print mode.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{GenerationRequest, LlmError, TextGenerator};

pub struct ClaudeCliGenerator {
    cmd: String,
}

impl ClaudeCliGenerator {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

/// The CLI takes a single prompt; the system prompt leads it.
fn compose_prompt(request: &GenerationRequest) -> String {
    format!("{}\n\n---\n\n{}", request.system.trim(), request.prompt)
}

#[async_trait]
impl TextGenerator for ClaudeCliGenerator {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let mut child = Command::new(&self.cmd)
            .args(["--print", "--output-format", "text"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Process(format!("failed to spawn {}: {}", self.cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(compose_prompt(&request).as_bytes())
                .await
                .map_err(|e| LlmError::Process(format!("failed to write prompt: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LlmError::Process(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Process(format!(
                "{} exited with {}: {}",
                self.cmd,
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse("empty output".to_string()));
        }
        Ok(text)
    }
}
