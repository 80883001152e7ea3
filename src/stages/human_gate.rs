use async_trait::async_trait;

use super::preview;
use crate::workflow::{
    BlackboardState, DecisionPatch, DraftStatus, HumanDecision, Note, ReviewAction, Route, Stage,
    StageName, StateUpdate,
};

/// Applies the reviewer's decision. The engine pauses before this stage;
/// it only runs once a decision has been recorded, or on explicit re-entry.
pub struct HumanGate {
    apply_edits_on_approve: bool,
    max_iterations: u32,
}

impl HumanGate {
    pub fn new(apply_edits_on_approve: bool, max_iterations: u32) -> Self {
        Self {
            apply_edits_on_approve,
            max_iterations,
        }
    }

    fn presented(state: &BlackboardState) -> String {
        format!(
            "Draft presented for review:\n{}\n\nSafety score: {}/100\nQuality score: {}/100\nIteration: {}",
            preview(&state.current_draft, 500),
            state.safety_score,
            state.quality_score,
            state.iteration_count
        )
    }

    fn approve(&self, state: &BlackboardState, decision: &HumanDecision) -> StateUpdate {
        let mut update = StateUpdate {
            status: Some(DraftStatus::Approved),
            ..StateUpdate::default()
        };
        let mut message = "Human approved the draft. Proceeding to finalization.".to_string();
        match decision.edits() {
            Some(edits) if self.apply_edits_on_approve => {
                update.current_draft = Some(edits.to_string());
                message.push_str(" Reviewer edits adopted as the final draft.");
            }
            Some(_) => message.push_str(" Reviewer edits were not applied on approval."),
            None => {}
        }
        let output = format!(
            "Decision: APPROVED\nFeedback: {}",
            decision.feedback().map(|f| preview(f, 500)).unwrap_or_else(|| "No feedback provided".to_string())
        );
        update
            .with_note(
                state,
                Note::new(StageName::HumanGate, message)
                    .with_input(Self::presented(state))
                    .with_output(output),
            )
            .route(Route::Stage(StageName::Finalizer))
    }

    fn reject(state: &BlackboardState, decision: &HumanDecision) -> StateUpdate {
        let feedback = decision.feedback().unwrap_or("No feedback provided");
        let mut instructions = format!("HUMAN FEEDBACK:\n{}", feedback);
        if let Some(edits) = decision.edits() {
            instructions.push_str(&format!("\n\nEDITED DRAFT TO USE AS BASE:\n{}", edits));
        }

        let output = format!(
            "Decision: REJECTED\nFeedback: {}\nEdits provided: {}\nNext stage: drafter",
            preview(feedback, 500),
            if decision.edits().is_some() { "yes" } else { "no" }
        );

        StateUpdate {
            current_draft: decision.edits().map(str::to_string),
            revision_instructions: Some(instructions),
            status: Some(DraftStatus::NeedsRevision),
            ..StateUpdate::default()
        }
        .with_note(
            state,
            Note::new(
                StageName::HumanGate,
                format!("Human rejected the draft. Feedback: {}", preview(feedback, 100)),
            )
            .with_input(Self::presented(state))
            .with_output(output),
        )
        .route(Route::Stage(StageName::Drafter))
    }

    fn cancel(state: &BlackboardState) -> StateUpdate {
        StateUpdate {
            status: Some(DraftStatus::Cancelled),
            ..StateUpdate::default()
        }
        .with_note(
            state,
            Note::new(StageName::HumanGate, "Human cancelled the session.")
                .with_input(format!("Iteration at cancellation: {}", state.iteration_count))
                .with_output("Decision: CANCELLED"),
        )
        .route(Route::End)
    }
}

#[async_trait]
impl Stage for HumanGate {
    fn name(&self) -> StageName {
        StageName::HumanGate
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        let Some(decision) = &state.human_decision else {
            return StateUpdate::default().with_note(
                state,
                Note::new(
                    StageName::HumanGate,
                    format!(
                        "Awaiting human review. Current scores - Safety: {}/100, Quality: {}/100. Iteration: {}/{}.",
                        state.safety_score,
                        state.quality_score,
                        state.iteration_count,
                        self.max_iterations
                    ),
                )
                .with_input(Self::presented(state))
                .with_output("Status: awaiting human decision"),
            );
        };

        let mut update = match decision.action {
            ReviewAction::Approve => self.approve(state, decision),
            ReviewAction::Reject => Self::reject(state, decision),
            ReviewAction::Cancel => Self::cancel(state),
        };
        update.human_decision = Some(DecisionPatch::Clear);
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::router::after_human_gate;

    fn paused() -> BlackboardState {
        let mut state = BlackboardState::new("t", "intent");
        state.current_draft = "v1".into();
        state.draft_history = vec!["v1".into()];
        state.iteration_count = 1;
        state.safety_score = 90;
        state.quality_score = 80;
        state.status = DraftStatus::Reviewing;
        state.next_stage_hint = Some(Route::Stage(StageName::HumanGate));
        state
    }

    async fn decide(gate: &HumanGate, decision: Option<HumanDecision>) -> BlackboardState {
        let mut state = paused();
        state.human_decision = decision;
        state.merged(&gate.run(&state).await)
    }

    #[tokio::test]
    async fn test_approve_keeps_draft_and_routes_to_finalizer() {
        let gate = HumanGate::new(false, 5);
        let mut decision = HumanDecision::approve();
        decision.edits = Some("reviewer rewrite".into());
        let next = decide(&gate, Some(decision)).await;

        assert_eq!(next.status, DraftStatus::Approved);
        assert_eq!(next.current_draft, "v1");
        assert!(next.human_decision.is_none());
        assert_eq!(after_human_gate(&next), Route::Stage(StageName::Finalizer));
        assert!(next.last_note().unwrap().message.contains("not applied"));
    }

    #[tokio::test]
    async fn test_approve_adopts_edits_when_enabled() {
        let gate = HumanGate::new(true, 5);
        let mut decision = HumanDecision::approve();
        decision.edits = Some("reviewer rewrite".into());
        let next = decide(&gate, Some(decision)).await;
        assert_eq!(next.current_draft, "reviewer rewrite");
        assert_eq!(next.draft_history.len(), 1);
        assert!(next.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_reject_replaces_draft_and_routes_to_drafter() {
        let gate = HumanGate::new(false, 5);
        let next = decide(&gate, Some(HumanDecision::reject("Y", Some("X".into())))).await;

        assert_eq!(next.current_draft, "X");
        assert_eq!(next.status, DraftStatus::NeedsRevision);
        assert_eq!(
            next.revision_instructions,
            "HUMAN FEEDBACK:\nY\n\nEDITED DRAFT TO USE AS BASE:\nX"
        );
        assert!(next.human_decision.is_none());
        assert_eq!(after_human_gate(&next), Route::Stage(StageName::Drafter));
    }

    #[tokio::test]
    async fn test_reject_without_edits_keeps_feedback() {
        let gate = HumanGate::new(false, 5);
        let next = decide(&gate, Some(HumanDecision::reject("More warmth", None))).await;
        assert_eq!(next.current_draft, "v1");
        assert_eq!(next.revision_instructions, "HUMAN FEEDBACK:\nMore warmth");
    }

    #[tokio::test]
    async fn test_cancel_ends_without_finalizer() {
        let gate = HumanGate::new(false, 5);
        let next = decide(&gate, Some(HumanDecision::cancel())).await;
        assert_eq!(next.status, DraftStatus::Cancelled);
        assert!(next.human_decision.is_none());
        assert_eq!(after_human_gate(&next), Route::End);
    }

    #[tokio::test]
    async fn test_no_decision_only_appends_a_note() {
        let gate = HumanGate::new(false, 5);
        let before = paused();
        let next = decide(&gate, None).await;

        assert_eq!(next.status, before.status);
        assert_eq!(next.next_stage_hint, before.next_stage_hint);
        assert_eq!(next.scratchpad.len(), before.scratchpad.len() + 1);
        assert!(next.last_note().unwrap().message.starts_with("Awaiting human review"));
        assert_eq!(after_human_gate(&next), Route::Stage(StageName::HumanGate));
    }
}
