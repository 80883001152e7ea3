use async_trait::async_trait;

use crate::workflow::{BlackboardState, DraftStatus, Note, Route, Stage, StageName, StateUpdate};

/// Rule-based decision stage: no generator call.
///
/// Rules, first match wins:
/// 1. iteration budget spent → human gate
///    (before the first draft: request it)
/// 2. both scores meet their thresholds → human gate
/// 3. otherwise → drafter, with compiled revision reasons
pub struct Coordinator {
    max_iterations: u32,
    safety_threshold: u8,
    quality_threshold: u8,
}

impl Coordinator {
    pub fn new(max_iterations: u32, safety_threshold: u8, quality_threshold: u8) -> Self {
        Self {
            max_iterations,
            safety_threshold,
            quality_threshold,
        }
    }

    fn to_gate(state: &BlackboardState, message: String) -> StateUpdate {
        StateUpdate {
            status: Some(DraftStatus::Reviewing),
            revision_instructions: Some(String::new()),
            ..StateUpdate::default()
        }
        .with_note(state, Note::new(StageName::Coordinator, message))
        .route(Route::Stage(StageName::HumanGate))
    }

    fn reasons(&self, state: &BlackboardState) -> Vec<String> {
        let mut reasons = Vec::new();
        if state.safety_score < self.safety_threshold {
            reasons.push(format!(
                "Safety score ({}) below threshold ({})",
                state.safety_score, self.safety_threshold
            ));
        }
        if state.quality_score < self.quality_threshold {
            reasons.push(format!(
                "Quality score ({}) below threshold ({})",
                state.quality_score, self.quality_threshold
            ));
        }
        reasons
    }
}

#[async_trait]
impl Stage for Coordinator {
    fn name(&self) -> StageName {
        StageName::Coordinator
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        if state.iteration_count >= self.max_iterations {
            return Self::to_gate(
                state,
                format!(
                    "Max iterations ({}) reached. Routing to human review.",
                    self.max_iterations
                ),
            );
        }

        if state.draft_history.is_empty() {
            return StateUpdate {
                status: Some(DraftStatus::Drafting),
                ..StateUpdate::default()
            }
            .with_note(
                state,
                Note::new(StageName::Coordinator, "No draft yet. Requesting initial draft."),
            )
            .route(Route::Stage(StageName::Drafter));
        }

        if state.safety_score >= self.safety_threshold
            && state.quality_score >= self.quality_threshold
        {
            return Self::to_gate(
                state,
                format!(
                    "Quality checks passed. Safety: {}/100, Quality: {}/100. Routing to human review.",
                    state.safety_score, state.quality_score
                ),
            );
        }

        let reasons = self.reasons(state).join(", ");
        let instructions = if state.revision_instructions.trim().is_empty() {
            format!(
                "REVISION REQUIRED\nIteration: {}/{}\nReasons: {}\n\nPlease address these issues in your revision.",
                state.iteration_count, self.max_iterations, reasons
            )
        } else {
            state.revision_instructions.clone()
        };

        StateUpdate {
            status: Some(DraftStatus::NeedsRevision),
            revision_instructions: Some(instructions),
            ..StateUpdate::default()
        }
        .with_note(
            state,
            Note::new(
                StageName::Coordinator,
                format!(
                    "Revision required. {}. Iteration {}/{}.",
                    reasons, state.iteration_count, self.max_iterations
                ),
            ),
        )
        .route(Route::Stage(StageName::Drafter))
    }
}
