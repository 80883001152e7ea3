use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{generate_within, preview, prompts};
use crate::llm::{GenerationRequest, TextGenerator};
use crate::workflow::{BlackboardState, DraftStatus, Note, Route, Stage, StageName, StateUpdate};

const DRAFT_TEMPERATURE: f32 = 0.7;
const PLACEHOLDER_DRAFT: &str =
    "[Draft unavailable: text generation failed. Manual drafting required.]";

/// Produces a new draft from the intent, revising the previous draft when
/// the thread has already been through a review round.
pub struct Drafter {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    temperature: f32,
}

impl Drafter {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self {
            generator,
            timeout,
            temperature: DRAFT_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Stage for Drafter {
    fn name(&self) -> StageName {
        StageName::Drafter
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        let instructions = state.revision_instructions.trim();
        let revising = state.iteration_count > 0 && !instructions.is_empty();
        let context = revising.then(|| {
            prompts::revision_context(state.iteration_count, instructions, &state.current_draft)
        });
        let request = GenerationRequest::new(
            prompts::DRAFTER_SYSTEM,
            prompts::drafter_task(&state.intent, context.as_deref()),
        )
        .with_temperature(self.temperature);

        let iteration = state.iteration_count + 1;
        let generated = generate_within(self.generator.as_ref(), request, self.timeout)
            .await
            .map(|text| text.trim().to_string());

        let (draft, message) = match generated {
            Ok(text) if !text.is_empty() => {
                let message = if instructions.is_empty() {
                    format!("Generated draft version {}. Initial draft created.", iteration)
                } else {
                    format!(
                        "Generated draft version {}. Addressed: {}",
                        iteration,
                        preview(instructions, 100)
                    )
                };
                (text, message)
            }
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(_) => "empty draft returned".to_string(),
                };
                warn!(thread_id = %state.thread_id, iteration, "drafter fallback: {}", reason);
                let draft = if state.current_draft.trim().is_empty() {
                    PLACEHOLDER_DRAFT.to_string()
                } else {
                    state.current_draft.clone()
                };
                let message = format!(
                    "Draft generation failed ({}); kept previous text as version {}. Manual review required.",
                    reason, iteration
                );
                (draft, message)
            }
        };

        let input = format!(
            "Intent: {}\nIteration: {}\n{}",
            state.intent,
            iteration,
            if instructions.is_empty() {
                "Initial draft request".to_string()
            } else {
                format!("Revision instructions: {}", preview(instructions, 500))
            }
        );
        let output = format!(
            "Draft version {} ({} characters)\nPreview: {}",
            iteration,
            draft.chars().count(),
            preview(&draft, 200)
        );

        let mut history = state.draft_history.clone();
        history.push(draft.clone());

        StateUpdate {
            current_draft: Some(draft),
            draft_history: Some(history),
            iteration_count: Some(iteration),
            revision_instructions: Some(String::new()),
            status: Some(DraftStatus::Reviewing),
            ..StateUpdate::default()
        }
        .with_note(
            state,
            Note::new(StageName::Drafter, message)
                .with_input(input)
                .with_output(output),
        )
        .route(Route::Stage(StageName::SafetyReviewer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{Reply, ScriptedGenerator};

    fn drafter(generator: Arc<ScriptedGenerator>) -> Drafter {
        Drafter::new(generator, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_first_draft_increments_iteration_and_clears_instructions() {
        let generator = Arc::new(ScriptedGenerator::text("Breathing exercise v1"));
        let mut state = BlackboardState::new("t", "Help with panic attacks");
        state.revision_instructions = "REVISION REQUIRED".into();

        let update = drafter(generator.clone()).run(&state).await;
        let next = state.merged(&update);

        assert_eq!(next.current_draft, "Breathing exercise v1");
        assert_eq!(next.iteration_count, 1);
        assert_eq!(next.draft_history, vec!["Breathing exercise v1".to_string()]);
        assert!(next.revision_instructions.is_empty());
        assert_eq!(next.status, DraftStatus::Reviewing);
        assert_eq!(
            next.next_stage_hint,
            Some(Route::Stage(StageName::SafetyReviewer))
        );
        assert_eq!(next.scratchpad.len(), 1);
        assert!(next.check_invariants().is_ok());
        // First round never carries revision context.
        assert!(!generator.last_prompt().contains("Revision required"));
    }

    #[tokio::test]
    async fn test_revision_round_includes_previous_draft_and_instructions() {
        let generator = Arc::new(ScriptedGenerator::text("v2"));
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "v1 body".into();
        state.draft_history = vec!["v1 body".into()];
        state.iteration_count = 1;
        state.revision_instructions = "Add crisis line".into();

        let next = state.merged(&drafter(generator.clone()).run(&state).await);

        let prompt = generator.last_prompt();
        assert!(prompt.contains("revision #1"));
        assert!(prompt.contains("Add crisis line"));
        assert!(prompt.contains("v1 body"));
        assert_eq!(next.iteration_count, 2);
        assert_eq!(next.draft_history.len(), 2);
        assert!(next.last_note().unwrap().message.contains("Addressed"));
    }

    #[tokio::test]
    async fn test_generation_failure_keeps_previous_draft_and_counts_iteration() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Reply::Fail]));
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "v1".into();
        state.draft_history = vec!["v1".into()];
        state.iteration_count = 1;

        let next = state.merged(&drafter(generator).run(&state).await);

        assert_eq!(next.current_draft, "v1");
        assert_eq!(next.iteration_count, 2);
        assert!(next.check_invariants().is_ok());
        assert!(next.last_note().unwrap().message.contains("Manual review required"));
    }

    #[tokio::test]
    async fn test_failure_without_draft_uses_placeholder() {
        let generator = Arc::new(ScriptedGenerator::text("   "));
        let state = BlackboardState::new("t", "intent");
        let next = state.merged(&drafter(generator).run(&state).await);
        assert_eq!(next.current_draft, PLACEHOLDER_DRAFT);
        assert_eq!(next.iteration_count, 1);
    }

    #[tokio::test]
    async fn test_hung_generator_keeps_previous_draft() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Reply::Hang]));
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "v1".into();
        state.draft_history = vec!["v1".into()];
        state.iteration_count = 1;

        let next = state.merged(&Drafter::new(generator, Duration::from_millis(20)).run(&state).await);

        assert_eq!(next.current_draft, "v1");
        assert_eq!(next.iteration_count, 2);
        let note = &next.last_note().unwrap().message;
        assert!(note.contains("timed out"));
        assert!(note.contains("Manual review required"));
        assert!(next.check_invariants().is_ok());
    }
}
