//! Stage implementations plugged into the engine.
//!
//! | Stage               | Calls generator | Writes                                              |
//! |---------------------|-----------------|-----------------------------------------------------|
//! | `Drafter`           | yes             | draft, history, iteration, clears instructions      |
//! | `SafetyReviewer`    | yes             | safety score + flags, instructions when unsafe      |
//! | `QualityReviewer`   | yes             | quality score, appends instructions when weak       |
//! | `Coordinator`       | no              | routing hint, compiled revision reasons             |
//! | `HumanGate`         | no              | applies and clears the reviewer decision            |
//! | `Finalizer`         | no              | approved status                                     |
//!
//! Generator-backed stages never fail: errors and timeouts become the
//! stage's fallback update, logged at `warn`.

pub mod coordinator;
pub mod drafter;
pub mod finalizer;
pub mod human_gate;
pub mod prompts;
pub mod quality;
pub mod safety;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::config::WorkflowSection;
use crate::errors::StageError;
use crate::llm::{GenerationRequest, TextGenerator};
use crate::workflow::StageSet;

pub use coordinator::Coordinator;
pub use drafter::Drafter;
pub use finalizer::Finalizer;
pub use human_gate::HumanGate;
pub use quality::QualityReviewer;
pub use safety::SafetyReviewer;

/// All six stages wired to one generator and one set of thresholds.
pub fn standard_stages(generator: Arc<dyn TextGenerator>, workflow: &WorkflowSection) -> StageSet {
    standard_stages_within(generator, workflow, workflow.generation_timeout())
}

/// Same as [`standard_stages`] with an explicit per-call generation deadline.
pub fn standard_stages_within(
    generator: Arc<dyn TextGenerator>,
    workflow: &WorkflowSection,
    timeout: Duration,
) -> StageSet {
    StageSet::new()
        .with(Arc::new(Drafter::new(generator.clone(), timeout)))
        .with(Arc::new(SafetyReviewer::new(
            generator.clone(),
            timeout,
            workflow.safety_threshold,
        )))
        .with(Arc::new(QualityReviewer::new(
            generator,
            timeout,
            workflow.quality_threshold,
        )))
        .with(Arc::new(Coordinator::new(
            workflow.max_iterations,
            workflow.safety_threshold,
            workflow.quality_threshold,
        )))
        .with(Arc::new(HumanGate::new(
            workflow.apply_edits_on_approve,
            workflow.max_iterations,
        )))
        .with(Arc::new(Finalizer))
}

/// Call the generator under a deadline.
pub(crate) async fn generate_within(
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    timeout: Duration,
) -> Result<String, StageError> {
    match tokio::time::timeout(timeout, generator.generate(request)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StageError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("fenced block pattern is valid")
});

/// Strip a markdown code fence around a JSON body, if present.
pub(crate) fn extract_json(text: &str) -> &str {
    match FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim(),
        None => text.trim(),
    }
}

/// Parse a structured stage response, tolerating a code fence.
pub(crate) fn parse_response<T: serde::de::DeserializeOwned>(
    what: &'static str,
    text: &str,
) -> Result<T, StageError> {
    serde_json::from_str(extract_json(text)).map_err(|e| StageError::Parse {
        what,
        message: e.to_string(),
    })
}

pub(crate) fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub(crate) fn bullet_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| format!("- {}", item.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted generator shared by stage tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::llm::{GenerationRequest, LlmError, TextGenerator};

    pub enum Reply {
        Text(String),
        Fail,
        Hang,
    }

    #[derive(Default)]
    pub struct ScriptedGenerator {
        replies: Mutex<VecDeque<Reply>>,
        pub prompts: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn text(reply: &str) -> Self {
            Self::new(vec![Reply::Text(reply.to_string())])
        }

        pub fn last_prompt(&self) -> String {
            self.prompts
                .lock()
                .unwrap()
                .last()
                .map(|r| r.prompt.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Text(text)) => Ok(text),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                Some(Reply::Fail) | None => {
                    Err(LlmError::RequestFailed("scripted failure".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedGenerator};
    use super::*;
    use crate::workflow::StageName;

    #[test]
    fn test_extract_json_strips_fences() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json(text), "{\"a\": 1}");
        assert_eq!(extract_json("```\n{\"b\": 2}\n```"), "{\"b\": 2}");
        assert_eq!(extract_json("  {\"c\": 3} "), "{\"c\": 3}");
    }

    #[test]
    fn test_parse_response_reports_what_failed() {
        let err = parse_response::<serde_json::Value>("safety", "not json").unwrap_err();
        match err {
            StageError::Parse { what, .. } => assert_eq!(what, "safety"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_clamp_score_bounds_values() {
        assert_eq!(clamp_score(-5.0), 0);
        assert_eq!(clamp_score(84.6), 85);
        assert_eq!(clamp_score(250.0), 100);
        assert_eq!(clamp_score(f64::NAN), 0);
    }

    #[test]
    fn test_preview_cuts_on_char_boundaries() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn test_generate_within_times_out() {
        let generator = ScriptedGenerator::new(vec![Reply::Hang]);
        let err = generate_within(
            &generator,
            GenerationRequest::new("s", "p"),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::Timeout { .. }));
    }

    #[test]
    fn test_standard_stages_cover_every_stage() {
        let generator = Arc::new(ScriptedGenerator::default());
        let set = standard_stages(generator, &WorkflowSection::default());
        assert!(set.missing().is_empty());
        assert_eq!(
            set.get(StageName::Coordinator).map(|s| s.name()),
            Some(StageName::Coordinator)
        );
    }
}
