//! Blackboard state threaded through every stage of one thread, and the
//! sparse update value each stage hands back to the engine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{Route, StageName};

/// One entry of the scratchpad audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub stage: StageName,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Note {
    pub fn new(stage: StageName, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            input: None,
            output: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("Invalid severity: {}", other)),
        }
    }
}

/// A harm-risk finding raised by the safety reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFlag {
    pub location: String,
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Drafting,
    Reviewing,
    NeedsRevision,
    Approved,
    Cancelled,
    Failed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::Reviewing => "reviewing",
            Self::NeedsRevision => "needs_revision",
            Self::Approved => "approved",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(Self::Drafting),
            "reviewing" => Ok(Self::Reviewing),
            "needs_revision" => Ok(Self::NeedsRevision),
            "approved" => Ok(Self::Approved),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid draft status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    Cancel,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
        }
    }
}

impl FromStr for ReviewAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "cancel" => Ok(Self::Cancel),
            _ => Err(format!("Invalid review action: {}", s)),
        }
    }
}

/// Decision supplied by the external reviewer when resuming a paused thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub action: ReviewAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl HumanDecision {
    pub fn approve() -> Self {
        Self {
            action: ReviewAction::Approve,
            edits: None,
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>, edits: Option<String>) -> Self {
        Self {
            action: ReviewAction::Reject,
            edits,
            feedback: Some(feedback.into()),
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: ReviewAction::Cancel,
            edits: None,
            feedback: None,
        }
    }

    /// Edited draft text, if the reviewer supplied a non-blank one.
    pub fn edits(&self) -> Option<&str> {
        self.edits.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref().filter(|f| !f.trim().is_empty())
    }
}

/// The single shared record for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardState {
    pub thread_id: String,
    pub intent: String,
    pub current_draft: String,
    pub draft_history: Vec<String>,
    pub scratchpad: Vec<Note>,
    pub safety_score: u8,
    pub quality_score: u8,
    pub safety_flags: Vec<SafetyFlag>,
    pub iteration_count: u32,
    pub revision_instructions: String,
    pub status: DraftStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_hint: Option<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<HumanDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlackboardState {
    pub fn new(thread_id: impl Into<String>, intent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            intent: intent.into(),
            current_draft: String::new(),
            draft_history: Vec::new(),
            scratchpad: Vec::new(),
            safety_score: 0,
            quality_score: 0,
            safety_flags: Vec::new(),
            iteration_count: 0,
            revision_instructions: String::new(),
            status: DraftStatus::Drafting,
            next_stage_hint: None,
            human_decision: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `update` over a copy of this state. Fields present in the update
    /// win; lists are replaced wholesale.
    pub fn merged(&self, update: &StateUpdate) -> Self {
        let mut next = self.clone();
        next.apply(update);
        next
    }

    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(draft) = &update.current_draft {
            self.current_draft = draft.clone();
        }
        if let Some(history) = &update.draft_history {
            self.draft_history = history.clone();
        }
        if let Some(scratchpad) = &update.scratchpad {
            self.scratchpad = scratchpad.clone();
        }
        if let Some(score) = update.safety_score {
            self.safety_score = score;
        }
        if let Some(score) = update.quality_score {
            self.quality_score = score;
        }
        if let Some(flags) = &update.safety_flags {
            self.safety_flags = flags.clone();
        }
        if let Some(count) = update.iteration_count {
            self.iteration_count = count;
        }
        if let Some(instructions) = &update.revision_instructions {
            self.revision_instructions = instructions.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(hint) = update.next_stage_hint {
            self.next_stage_hint = Some(hint);
        }
        match &update.human_decision {
            Some(DecisionPatch::Set(decision)) => self.human_decision = Some(decision.clone()),
            Some(DecisionPatch::Clear) => self.human_decision = None,
            None => {}
        }
        if let Some(at) = update.updated_at {
            self.updated_at = at;
        }
    }

    /// Check the invariants every checkpointed state must hold.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.iteration_count as usize != self.draft_history.len() {
            return Err(format!(
                "iteration_count {} does not match draft_history length {}",
                self.iteration_count,
                self.draft_history.len()
            ));
        }
        if self.safety_score > 100 || self.quality_score > 100 {
            return Err(format!(
                "scores out of range: safety {}, quality {}",
                self.safety_score, self.quality_score
            ));
        }
        Ok(())
    }

    pub fn last_note(&self) -> Option<&Note> {
        self.scratchpad.last()
    }
}

/// Set or clear the pending human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum DecisionPatch {
    Set(HumanDecision),
    Clear,
}

/// Sparse set of fields a stage (or the resume API) writes into the state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_draft: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_history: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratchpad: Option<Vec<Note>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_flags: Option<Vec<SafetyFlag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DraftStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_hint: Option<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<DecisionPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateUpdate {
    /// Append `note` to the scratchpad carried by this update, seeding it from
    /// `state` the first time so earlier notes are never lost.
    pub fn push_note(&mut self, state: &BlackboardState, note: Note) {
        self.scratchpad
            .get_or_insert_with(|| state.scratchpad.clone())
            .push(note);
    }

    pub fn with_note(mut self, state: &BlackboardState, note: Note) -> Self {
        self.push_note(state, note);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.next_stage_hint = Some(route);
        self
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Update recorded when an external caller supplies a review decision.
    pub fn human_decision(decision: HumanDecision) -> Self {
        Self {
            human_decision: Some(DecisionPatch::Set(decision)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BlackboardState {
        BlackboardState::new("t-1", "Write a short note about sleep hygiene")
    }

    #[test]
    fn test_new_state_is_empty_and_consistent() {
        let s = state();
        assert_eq!(s.iteration_count, 0);
        assert!(s.current_draft.is_empty());
        assert!(s.scratchpad.is_empty());
        assert_eq!(s.status, DraftStatus::Drafting);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_merge_overwrites_only_present_fields() {
        let s = state();
        let update = StateUpdate {
            safety_score: Some(91),
            status: Some(DraftStatus::Reviewing),
            ..StateUpdate::default()
        };
        let merged = s.merged(&update);
        assert_eq!(merged.safety_score, 91);
        assert_eq!(merged.status, DraftStatus::Reviewing);
        assert_eq!(merged.quality_score, 0);
        assert_eq!(merged.intent, s.intent);
    }

    #[test]
    fn test_merge_replaces_lists_wholesale() {
        let mut s = state();
        s.safety_flags = vec![SafetyFlag {
            location: "line 1".into(),
            reason: "old".into(),
            severity: Severity::Critical,
        }];
        let update = StateUpdate {
            safety_flags: Some(Vec::new()),
            ..StateUpdate::default()
        };
        assert!(s.merged(&update).safety_flags.is_empty());
    }

    #[test]
    fn test_push_note_keeps_existing_notes() {
        let mut s = state();
        s.scratchpad.push(Note::new(StageName::Coordinator, "first"));
        let mut update = StateUpdate::default();
        update.push_note(&s, Note::new(StageName::Drafter, "second"));
        update.push_note(&s, Note::new(StageName::Drafter, "third"));
        let merged = s.merged(&update);
        let messages: Vec<_> = merged.scratchpad.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_decision_patch_sets_and_clears() {
        let s = state();
        let set = s.merged(&StateUpdate::human_decision(HumanDecision::cancel()));
        assert_eq!(
            set.human_decision.as_ref().map(|d| d.action),
            Some(ReviewAction::Cancel)
        );

        let cleared = set.merged(&StateUpdate {
            human_decision: Some(DecisionPatch::Clear),
            ..StateUpdate::default()
        });
        assert!(cleared.human_decision.is_none());
    }

    #[test]
    fn test_invariant_detects_iteration_mismatch() {
        let mut s = state();
        s.iteration_count = 2;
        s.draft_history = vec!["one".into()];
        assert!(s.check_invariants().is_err());
    }

    #[test]
    fn test_blank_edits_are_ignored() {
        let decision = HumanDecision::reject("tone it down", Some("   ".into()));
        assert!(decision.edits().is_none());
        assert_eq!(decision.feedback(), Some("tone it down"));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            DraftStatus::Drafting,
            DraftStatus::Reviewing,
            DraftStatus::NeedsRevision,
            DraftStatus::Approved,
            DraftStatus::Cancelled,
            DraftStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DraftStatus>(), Ok(status));
        }
        assert!("paused".parse::<DraftStatus>().is_err());
    }

    #[test]
    fn test_update_serializes_sparsely() {
        let update = StateUpdate {
            quality_score: Some(72),
            ..StateUpdate::default()
        };
        let json = serde_json::to_string(&update).unwrap();
        assert_eq!(json, r#"{"quality_score":72}"#);
        let back: StateUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
