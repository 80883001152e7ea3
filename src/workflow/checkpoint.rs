//! Append-only checkpoint history per thread.
//!
//! A checkpoint records the update a step produced, the full state after
//! merging it, and a SHA-256 digest of that state. Rows are never edited;
//! the history can be folded from sequence 0 to reproduce every snapshot.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::router::Router;
use super::stage::{Route, StageName};
use super::state::{BlackboardState, StateUpdate};
use crate::errors::{ReplayError, StoreError};

/// Who produced the update stored in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum StepSource {
    /// Initial state supplied by the caller.
    Input,
    /// A stage run by the engine.
    Stage(StageName),
    /// An external update recorded as if authored by the given stage.
    External(StageName),
}

/// A checkpoint ready to be appended; the store seals it.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub thread_id: String,
    pub sequence_no: u64,
    pub source: StepSource,
    pub update: StateUpdate,
    pub state: BlackboardState,
    pub pending_stage: Option<StageName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub sequence_no: u64,
    pub source: StepSource,
    pub update: StateUpdate,
    pub state: BlackboardState,
    /// Set when the engine is paused before running this stage.
    pub pending_stage: Option<StageName>,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn seal(new: NewCheckpoint) -> Result<Self, StoreError> {
        let digest = state_digest(&new.state).map_err(StoreError::Encode)?;
        Ok(Self {
            thread_id: new.thread_id,
            sequence_no: new.sequence_no,
            source: new.source,
            update: new.update,
            state: new.state,
            pending_stage: new.pending_stage,
            digest,
            created_at: Utc::now(),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.pending_stage.is_some()
    }

    /// Where a driver picking up this checkpoint continues.
    pub fn next_route(&self, router: &Router) -> Route {
        match (self.pending_stage, self.source) {
            (Some(stage), _) => Route::Stage(stage),
            (None, StepSource::Input) => Route::Stage(StageName::ENTRY),
            (None, StepSource::External(stage)) => Route::Stage(stage),
            (None, StepSource::Stage(stage)) => router.next(stage, &self.state),
        }
    }
}

/// Hex SHA-256 of the state's canonical JSON encoding.
pub fn state_digest(state: &BlackboardState) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fold a thread's history from sequence 0, checking each step reproduces
/// the recorded snapshot. Returns the final state.
pub fn replay(thread_id: &str, history: &[Checkpoint]) -> Result<BlackboardState, ReplayError> {
    let first = history.first().ok_or_else(|| ReplayError::EmptyHistory {
        thread_id: thread_id.to_string(),
    })?;
    if first.sequence_no != 0 {
        return Err(ReplayError::MissingOrigin {
            thread_id: thread_id.to_string(),
            found: first.sequence_no,
        });
    }

    let diverged = |sequence_no| ReplayError::Diverged {
        thread_id: thread_id.to_string(),
        sequence_no,
    };

    let mut state = first.state.clone();
    if state_digest(&state).map_err(|_| diverged(0))? != first.digest {
        return Err(diverged(0));
    }

    let mut previous = first.sequence_no;
    for checkpoint in &history[1..] {
        if checkpoint.sequence_no != previous + 1 {
            return Err(ReplayError::Gap {
                thread_id: thread_id.to_string(),
                previous,
                found: checkpoint.sequence_no,
            });
        }
        state.apply(&checkpoint.update);
        let digest = state_digest(&state).map_err(|_| diverged(checkpoint.sequence_no))?;
        if digest != checkpoint.digest {
            return Err(diverged(checkpoint.sequence_no));
        }
        previous = checkpoint.sequence_no;
    }
    Ok(state)
}

/// Durable, append-only storage of checkpoints keyed by thread id.
///
/// `append` must reject a checkpoint whose `sequence_no` is not exactly one
/// past the thread's latest, so two writers can never fork a history.
/// Readers always see whole checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError>;

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// Remove every checkpoint of a thread. Returns how many were removed.
    async fn delete_thread(&self, thread_id: &str) -> Result<usize, StoreError>;

    /// Merge `update` into the latest state and record it as a step authored
    /// by `as_stage`. The resulting checkpoint is not paused: a driver picking
    /// it up runs `as_stage` next.
    async fn apply_external_update(
        &self,
        thread_id: &str,
        update: StateUpdate,
        as_stage: StageName,
    ) -> Result<Checkpoint, StoreError> {
        let latest = self
            .latest(thread_id)
            .await?
            .ok_or_else(|| StoreError::UnknownThread {
                thread_id: thread_id.to_string(),
            })?;
        let state = latest.state.merged(&update);
        self.append(NewCheckpoint {
            thread_id: thread_id.to_string(),
            sequence_no: latest.sequence_no + 1,
            source: StepSource::External(as_stage),
            update,
            state,
            pending_stage: None,
        })
        .await
    }
}

/// In-process store used by tests and the CLI's ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let mut threads = self.threads.write().map_err(|_| StoreError::LockPoisoned)?;
        let history = threads.entry(checkpoint.thread_id.clone()).or_default();
        let actual = history.len() as u64;
        if checkpoint.sequence_no != actual {
            return Err(StoreError::Conflict {
                thread_id: checkpoint.thread_id,
                expected: checkpoint.sequence_no,
                actual,
            });
        }
        let sealed = Checkpoint::seal(checkpoint)?;
        history.push(sealed.clone());
        Ok(sealed)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let threads = self.threads.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(threads.get(thread_id).and_then(|h| h.last().cloned()))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let threads = self.threads.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<usize, StoreError> {
        let mut threads = self.threads.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(threads.remove(thread_id).map(|h| h.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{DraftStatus, HumanDecision, Note};

    fn origin(thread_id: &str) -> NewCheckpoint {
        NewCheckpoint {
            thread_id: thread_id.to_string(),
            sequence_no: 0,
            source: StepSource::Input,
            update: StateUpdate::default(),
            state: BlackboardState::new(thread_id, "intent"),
            pending_stage: None,
        }
    }

    fn step(prev: &Checkpoint, stage: StageName, update: StateUpdate) -> NewCheckpoint {
        NewCheckpoint {
            thread_id: prev.thread_id.clone(),
            sequence_no: prev.sequence_no + 1,
            source: StepSource::Stage(stage),
            state: prev.state.merged(&update),
            update,
            pending_stage: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_latest() {
        let store = MemoryCheckpointStore::new();
        let first = store.append(origin("t")).await.unwrap();
        assert_eq!(first.sequence_no, 0);

        let update = StateUpdate {
            status: Some(DraftStatus::Reviewing),
            ..StateUpdate::default()
        };
        store
            .append(step(&first, StageName::Drafter, update))
            .await
            .unwrap();

        let latest = store.latest("t").await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 1);
        assert_eq!(latest.state.status, DraftStatus::Reviewing);
        assert!(store.latest("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_sequence_is_a_conflict() {
        let store = MemoryCheckpointStore::new();
        let first = store.append(origin("t")).await.unwrap();
        store
            .append(step(&first, StageName::Drafter, StateUpdate::default()))
            .await
            .unwrap();

        let err = store
            .append(step(&first, StageName::Drafter, StateUpdate::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(store.history("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_external_update_is_recorded_as_new_step() {
        let store = MemoryCheckpointStore::new();
        store.append(origin("t")).await.unwrap();

        let cp = store
            .apply_external_update(
                "t",
                StateUpdate::human_decision(HumanDecision::approve()),
                StageName::HumanGate,
            )
            .await
            .unwrap();
        assert_eq!(cp.sequence_no, 1);
        assert_eq!(cp.source, StepSource::External(StageName::HumanGate));
        assert!(cp.state.human_decision.is_some());
        assert_eq!(
            cp.next_route(&Router::new(80)),
            Route::Stage(StageName::HumanGate)
        );
    }

    #[tokio::test]
    async fn test_external_update_on_unknown_thread_fails() {
        let store = MemoryCheckpointStore::new();
        let err = store
            .apply_external_update("missing", StateUpdate::default(), StageName::HumanGate)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownThread { .. }));
    }

    #[tokio::test]
    async fn test_replay_reproduces_final_state() {
        let store = MemoryCheckpointStore::new();
        let mut cp = store.append(origin("t")).await.unwrap();
        for i in 0..3 {
            let mut update = StateUpdate {
                current_draft: Some(format!("draft {}", i)),
                ..StateUpdate::default()
            };
            update.push_note(&cp.state, Note::new(StageName::Drafter, format!("note {}", i)));
            cp = store
                .append(step(&cp, StageName::Drafter, update))
                .await
                .unwrap();
        }

        let history = store.history("t").await.unwrap();
        let replayed = replay("t", &history).unwrap();
        assert_eq!(replayed, cp.state);
        assert_eq!(replayed.scratchpad.len(), 3);
    }

    #[tokio::test]
    async fn test_replay_detects_tampered_update() {
        let store = MemoryCheckpointStore::new();
        let first = store.append(origin("t")).await.unwrap();
        let update = StateUpdate {
            safety_score: Some(90),
            ..StateUpdate::default()
        };
        store
            .append(step(&first, StageName::SafetyReviewer, update))
            .await
            .unwrap();

        let mut history = store.history("t").await.unwrap();
        history[1].update.safety_score = Some(10);
        let err = replay("t", &history).unwrap_err();
        assert!(matches!(err, ReplayError::Diverged { sequence_no: 1, .. }));
    }

    #[test]
    fn test_replay_of_empty_history_fails() {
        assert!(matches!(
            replay("t", &[]),
            Err(ReplayError::EmptyHistory { .. })
        ));
    }

    #[test]
    fn test_origin_checkpoint_routes_to_entry() {
        let cp = Checkpoint::seal(origin("t")).unwrap();
        assert_eq!(
            cp.next_route(&Router::new(80)),
            Route::Stage(StageName::ENTRY)
        );
        assert!(!cp.is_paused());
    }

    #[test]
    fn test_paused_checkpoint_routes_to_pending_stage() {
        let mut new = origin("t");
        new.pending_stage = Some(StageName::HumanGate);
        let cp = Checkpoint::seal(new).unwrap();
        assert!(cp.is_paused());
        assert_eq!(
            cp.next_route(&Router::new(80)),
            Route::Stage(StageName::HumanGate)
        );
    }

    #[test]
    fn test_digest_changes_with_state() {
        let a = BlackboardState::new("t", "one");
        let mut b = a.clone();
        assert_eq!(state_digest(&a).unwrap(), state_digest(&b).unwrap());
        b.current_draft = "changed".into();
        assert_ne!(state_digest(&a).unwrap(), state_digest(&b).unwrap());
    }
}
