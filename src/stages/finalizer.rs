use async_trait::async_trait;

use super::preview;
use crate::workflow::{BlackboardState, DraftStatus, Note, Route, Stage, StageName, StateUpdate};

/// Terminal stage after approval.
pub struct Finalizer;

#[async_trait]
impl Stage for Finalizer {
    fn name(&self) -> StageName {
        StageName::Finalizer
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        let note = Note::new(
            StageName::Finalizer,
            format!(
                "Draft finalized. Final scores - Safety: {}/100, Quality: {}/100. Total iterations: {}.",
                state.safety_score, state.quality_score, state.iteration_count
            ),
        )
        .with_input(format!(
            "Approved draft:\n{}",
            preview(&state.current_draft, 500)
        ))
        .with_output(format!(
            "Final artifact length: {} characters",
            state.current_draft.chars().count()
        ));

        StateUpdate {
            status: Some(DraftStatus::Approved),
            ..StateUpdate::default()
        }
        .with_note(state, note)
        .route(Route::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finalizer_marks_approved() {
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "final".into();
        state.safety_score = 88;
        state.quality_score = 77;
        let next = state.merged(&Finalizer.run(&state).await);
        assert_eq!(next.status, DraftStatus::Approved);
        assert_eq!(next.next_stage_hint, Some(Route::End));
        assert!(next.last_note().unwrap().message.contains("Safety: 88/100"));
    }
}
