//! Typed error hierarchy for the workflow engine.
//!
//! Four enums cover the subsystems:
//! - `EngineError`: start/resume/inspect failures surfaced to callers
//! - `StoreError`: checkpoint persistence failures
//! - `StageError`: soft failures inside a stage, always recovered by a fallback
//! - `ReplayError`: checkpoint history that does not fold back to its snapshots

use thiserror::Error;

use crate::llm::LlmError;
use crate::workflow::{EngineStatus, StageName};

/// Errors from the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Thread {thread_id} not found")]
    ThreadNotFound { thread_id: String },

    #[error("Thread {thread_id} is not paused (status: {status})")]
    NotPaused {
        thread_id: String,
        status: EngineStatus,
    },

    #[error("Thread {thread_id} is being driven by another run")]
    Busy { thread_id: String },

    #[error("Thread {thread_id} already exists")]
    ThreadExists { thread_id: String },

    #[error("Intent must not be empty")]
    EmptyIntent,

    #[error("No stage registered for {stage}")]
    MissingStage { stage: StageName },

    #[error("Thread {thread_id} already has {limit} subscribers")]
    TooManySubscribers { thread_id: String, limit: usize },

    #[error("Run for thread {thread_id} failed: {message}")]
    RunFailed { thread_id: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Checkpoint conflict on thread {thread_id}: expected sequence {expected}, store is at {actual}")]
    Conflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Thread {thread_id} has no checkpoints")]
    UnknownThread { thread_id: String },

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt checkpoint {sequence_no} on thread {thread_id}: {message}")]
    Corrupt {
        thread_id: String,
        sequence_no: u64,
        message: String,
    },

    #[error("Checkpoint store lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Soft failure inside a stage. Never escapes the stage: each stage maps it
/// to its conservative fallback update.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Text generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("Text generation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Could not parse {what} response: {message}")]
    Parse { what: &'static str, message: String },
}

/// A checkpoint history that does not reproduce its own snapshots.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Thread {thread_id} has an empty history")]
    EmptyHistory { thread_id: String },

    #[error("History of thread {thread_id} does not start at sequence 0 (found {found})")]
    MissingOrigin { thread_id: String, found: u64 },

    #[error("History of thread {thread_id} skips from {previous} to {found}")]
    Gap {
        thread_id: String,
        previous: u64,
        found: u64,
    },

    #[error("Replay diverged at sequence {sequence_no} on thread {thread_id}")]
    Diverged { thread_id: String, sequence_no: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_paused_names_thread_and_status() {
        let err = EngineError::NotPaused {
            thread_id: "t-1".into(),
            status: EngineStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("t-1"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn test_store_error_converts_into_engine_error() {
        let err: EngineError = StoreError::Conflict {
            thread_id: "t".into(),
            expected: 3,
            actual: 4,
        }
        .into();
        match &err {
            EngineError::Store(StoreError::Conflict {
                expected, actual, ..
            }) => {
                assert_eq!(*expected, 3);
                assert_eq!(*actual, 4);
            }
            _ => panic!("Expected Store(Conflict)"),
        }
    }

    #[test]
    fn test_stage_timeout_carries_seconds() {
        let err = StageError::Timeout { secs: 60 };
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_replay_divergence_is_matchable() {
        let err = ReplayError::Diverged {
            thread_id: "t".into(),
            sequence_no: 7,
        };
        assert!(matches!(err, ReplayError::Diverged { sequence_no: 7, .. }));
    }

    #[test]
    fn test_anyhow_converts_to_other() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, EngineError::Other(_)));
    }
}
