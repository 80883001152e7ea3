use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{bullet_list, clamp_score, generate_within, parse_response, preview, prompts};
use crate::llm::{GenerationRequest, TextGenerator};
use crate::workflow::{BlackboardState, Note, Route, Stage, StageName, StateUpdate};

const REVIEW_TEMPERATURE: f32 = 0.3;
const FALLBACK_SCORE: u8 = 60;

#[derive(Debug, Deserialize)]
struct QualityReport {
    #[serde(alias = "empathy_score")]
    quality_score: f64,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default, alias = "areas_for_improvement")]
    improvements: Vec<String>,
    #[serde(default)]
    overall_assessment: String,
}

impl QualityReport {
    fn fallback() -> Self {
        Self {
            quality_score: f64::from(FALLBACK_SCORE),
            strengths: Vec::new(),
            improvements: vec!["Manual quality review required".to_string()],
            overall_assessment: "Quality analysis unavailable - manual review required"
                .to_string(),
        }
    }
}

/// Scores communication quality of the current draft.
pub struct QualityReviewer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    threshold: u8,
}

impl QualityReviewer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration, threshold: u8) -> Self {
        Self {
            generator,
            timeout,
            threshold,
        }
    }
}

#[async_trait]
impl Stage for QualityReviewer {
    fn name(&self) -> StageName {
        StageName::QualityReviewer
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        let request = GenerationRequest::new(
            prompts::QUALITY_SYSTEM,
            prompts::quality_task(&state.current_draft),
        )
        .with_temperature(REVIEW_TEMPERATURE);

        let report = match generate_within(self.generator.as_ref(), request, self.timeout)
            .await
            .and_then(|text| parse_response::<QualityReport>("quality", &text))
        {
            Ok(report) => report,
            Err(e) => {
                warn!(thread_id = %state.thread_id, "quality reviewer fallback: {}", e);
                QualityReport::fallback()
            }
        };
        let score = clamp_score(report.quality_score);

        let mut output = format!("Quality score: {}/100", score);
        if !report.strengths.is_empty() {
            output.push_str("\nStrengths:\n");
            output.push_str(&bullet_list(report.strengths.iter().take(3)));
        }
        if !report.improvements.is_empty() {
            output.push_str("\nAreas for improvement:\n");
            output.push_str(&bullet_list(report.improvements.iter().take(3)));
        }

        let note = Note::new(
            StageName::QualityReviewer,
            format!(
                "Quality review complete. Score: {}/100. {}",
                score,
                preview(&report.overall_assessment, 100)
            ),
        )
        .with_input(format!("Draft to evaluate:\n{}", preview(&state.current_draft, 1000)))
        .with_output(output);

        let mut update = StateUpdate {
            quality_score: Some(score),
            ..StateUpdate::default()
        };
        if score < self.threshold {
            let mut instructions = state.revision_instructions.clone();
            if !instructions.is_empty() {
                instructions.push_str("\n\n");
            }
            instructions.push_str(&format!(
                "QUALITY IMPROVEMENTS NEEDED (Score: {}/100)\nAreas for improvement:\n{}",
                score,
                bullet_list(&report.improvements)
            ));
            update.revision_instructions = Some(instructions);
        }
        update
            .with_note(state, note)
            .route(Route::Stage(StageName::Coordinator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{Reply, ScriptedGenerator};

    fn reviewer(reply: Reply) -> QualityReviewer {
        QualityReviewer::new(
            Arc::new(ScriptedGenerator::new(vec![reply])),
            Duration::from_secs(5),
            70,
        )
    }

    fn drafted() -> BlackboardState {
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "Step 1".into();
        state.draft_history = vec!["Step 1".into()];
        state.iteration_count = 1;
        state
    }

    #[tokio::test]
    async fn test_good_score_leaves_instructions_untouched() {
        let reply = r#"{"quality_score": 81, "strengths": ["warm"], "improvements": []}"#;
        let state = drafted();
        let next = state.merged(&reviewer(Reply::Text(reply.into())).run(&state).await);
        assert_eq!(next.quality_score, 81);
        assert!(next.revision_instructions.is_empty());
        assert_eq!(
            next.next_stage_hint,
            Some(Route::Stage(StageName::Coordinator))
        );
    }

    #[tokio::test]
    async fn test_low_score_appends_to_existing_instructions() {
        let reply = r#"{"empathy_score": 55, "areas_for_improvement": ["Acknowledge difficulty"]}"#;
        let mut state = drafted();
        state.revision_instructions = "SAFETY ISSUES DETECTED".into();
        let next = state.merged(&reviewer(Reply::Text(reply.into())).run(&state).await);

        assert_eq!(next.quality_score, 55);
        assert!(next.revision_instructions.starts_with("SAFETY ISSUES DETECTED\n\n"));
        assert!(next
            .revision_instructions
            .contains("QUALITY IMPROVEMENTS NEEDED (Score: 55/100)"));
        assert!(next.revision_instructions.contains("- Acknowledge difficulty"));
    }

    #[tokio::test]
    async fn test_failure_uses_fallback_score() {
        let state = drafted();
        let next = state.merged(&reviewer(Reply::Fail).run(&state).await);
        assert_eq!(next.quality_score, FALLBACK_SCORE);
        assert!(next.revision_instructions.contains("Manual quality review required"));
        assert_eq!(next.scratchpad.len(), 1);
    }

    #[tokio::test]
    async fn test_hung_generator_times_out_to_fallback() {
        let reviewer = QualityReviewer::new(
            Arc::new(ScriptedGenerator::new(vec![Reply::Hang])),
            Duration::from_millis(20),
            70,
        );
        let state = drafted();
        let next = state.merged(&reviewer.run(&state).await);

        assert_eq!(next.quality_score, FALLBACK_SCORE);
        assert!(next.revision_instructions.contains("Manual quality review required"));
        assert!(next.check_invariants().is_ok());
    }
}
