//! Pure branch functions deciding which stage runs next.
//!
//! Every function is total: a hint that is not a legal successor of the
//! stage that just ran is ignored in favour of that stage's default.

use super::stage::{Route, StageName};
use super::state::{BlackboardState, DraftStatus};

#[derive(Debug, Clone, Copy)]
pub struct Router {
    safety_threshold: u8,
}

impl Router {
    pub fn new(safety_threshold: u8) -> Self {
        Self { safety_threshold }
    }

    /// Next route after `stage` has produced `state`.
    pub fn next(&self, stage: StageName, state: &BlackboardState) -> Route {
        match stage {
            StageName::Drafter => Route::Stage(StageName::SafetyReviewer),
            StageName::SafetyReviewer => self.after_safety(state),
            StageName::QualityReviewer => Route::Stage(StageName::Coordinator),
            StageName::Coordinator => after_coordinator(state),
            StageName::HumanGate => after_human_gate(state),
            StageName::Finalizer => Route::End,
        }
    }

    /// The score decides; an unsafe draft skips quality review.
    pub fn after_safety(&self, state: &BlackboardState) -> Route {
        if state.safety_score >= self.safety_threshold {
            Route::Stage(StageName::QualityReviewer)
        } else {
            Route::Stage(StageName::Coordinator)
        }
    }
}

/// Defaults to another drafting round.
pub fn after_coordinator(state: &BlackboardState) -> Route {
    match state.next_stage_hint {
        Some(Route::Stage(StageName::HumanGate)) => Route::Stage(StageName::HumanGate),
        _ => Route::Stage(StageName::Drafter),
    }
}

/// Defaults to staying at the gate, so a thread without a decision remains
/// paused. A cancelled thread always ends.
pub fn after_human_gate(state: &BlackboardState) -> Route {
    if state.status == DraftStatus::Cancelled {
        return Route::End;
    }
    match state.next_stage_hint {
        Some(route @ Route::Stage(StageName::Finalizer | StageName::Drafter)) => route,
        Some(Route::End) => Route::End,
        _ => Route::Stage(StageName::HumanGate),
    }
}
