//! Keeps the `sessions` table in step with engine runs.
//!
//! The session row is a summary derived from run outcomes; the checkpoint
//! history stays authoritative.

use tracing::{info, warn};

use crate::db::{DbHandle, SessionStatus, SessionUpdate};
use crate::errors::EngineError;
use crate::workflow::{BlackboardState, Engine, EngineStatus, ReviewAction, RunHandle, RunOutcome};

/// Session columns to write once a run has ended.
pub fn outcome_update(result: &Result<RunOutcome, EngineError>) -> SessionUpdate {
    match result {
        Ok(outcome) => {
            let state = outcome.state();
            match outcome.status() {
                EngineStatus::PausedAtHumanGate => SessionUpdate {
                    status: Some(SessionStatus::PendingReview),
                    ..scores(state)
                },
                EngineStatus::TerminalApproved => SessionUpdate {
                    status: Some(SessionStatus::Approved),
                    final_artifact: Some(state.current_draft.clone()),
                    ..scores(state)
                },
                EngineStatus::TerminalCancelled => SessionUpdate {
                    status: Some(SessionStatus::Cancelled),
                    ..scores(state)
                },
                other => SessionUpdate {
                    status: Some(SessionStatus::Failed),
                    error_message: Some(format!("Run ended with status {}", other)),
                    ..scores(state)
                },
            }
        }
        Err(e) => SessionUpdate {
            status: Some(SessionStatus::Failed),
            error_message: Some(e.to_string()),
            ..SessionUpdate::default()
        },
    }
}

/// Session columns while a thread runs on after a review. A rejection
/// stays visible as `rejected` until the next pause overwrites it.
pub fn after_decision(action: ReviewAction) -> SessionUpdate {
    let status = match action {
        ReviewAction::Reject => SessionStatus::Rejected,
        ReviewAction::Approve | ReviewAction::Cancel => SessionStatus::Running,
    };
    SessionUpdate {
        status: Some(status),
        ..SessionUpdate::default()
    }
}

fn scores(state: &BlackboardState) -> SessionUpdate {
    SessionUpdate {
        safety_score: Some(state.safety_score),
        quality_score: Some(state.quality_score),
        iteration_count: Some(state.iteration_count),
        ..SessionUpdate::default()
    }
}

/// Set the status of the session attached to `thread_id`, if there is one.
pub async fn record(db: &DbHandle, thread_id: &str, update: SessionUpdate) -> anyhow::Result<()> {
    let thread_id = thread_id.to_string();
    db.call(move |db| {
        match db.get_session_by_thread(&thread_id)? {
            Some(session) => {
                db.update_session(session.id, &update)?;
            }
            None => warn!(thread_id = %thread_id, "no session row for thread"),
        }
        Ok(())
    })
    .await
}

/// Wait for a run in the background and fold its outcome into the session.
pub fn track(db: DbHandle, handle: RunHandle) {
    tokio::spawn(async move {
        let thread_id = handle.thread_id.clone();
        let result = handle.wait().await;
        let update = outcome_update(&result);
        info!(thread_id = %thread_id, status = ?update.status, "run settled");
        if let Err(e) = record(&db, &thread_id, update).await {
            warn!(thread_id = %thread_id, "failed to update session: {:#}", e);
        }
    });
}

/// Bring sessions a previous process left in flight (`running`, or
/// `rejected` while the next draft was being written) in line with their
/// checkpoints. Threads that stopped mid-flight are marked failed and wait
/// for an explicit resume.
pub async fn reconcile(db: &DbHandle, engine: &Engine) -> anyhow::Result<usize> {
    let in_flight = db
        .call(|db| {
            let mut sessions = db.list_sessions(Some(SessionStatus::Running), 0, -1)?;
            sessions.extend(db.list_sessions(Some(SessionStatus::Rejected), 0, -1)?);
            Ok(sessions)
        })
        .await?;
    let mut fixed = 0;
    for session in in_flight {
        let update = match engine.status(&session.thread_id).await? {
            EngineStatus::PausedAtHumanGate => SessionUpdate {
                status: Some(SessionStatus::PendingReview),
                ..SessionUpdate::default()
            },
            EngineStatus::TerminalFailed | EngineStatus::NotStarted => SessionUpdate {
                status: Some(SessionStatus::Failed),
                error_message: Some(format!(
                    "Run interrupted; POST /api/resume/{} to continue",
                    session.thread_id
                )),
                ..SessionUpdate::default()
            },
            _ => continue,
        };
        let id = session.id;
        db.call(move |db| db.update_session(id, &update)).await?;
        fixed += 1;
    }
    if fixed > 0 {
        info!(fixed, "reconciled interrupted sessions");
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::api::tests::test_state;
    use crate::workflow::{
        Checkpoint, CheckpointStore, DraftStatus, NewCheckpoint, StateUpdate, StepSource,
    };

    fn checkpoint(status: DraftStatus) -> Checkpoint {
        let mut state = BlackboardState::new("t-1", "intent");
        state.status = status;
        state.current_draft = "final words".into();
        state.draft_history = vec!["final words".into()];
        state.iteration_count = 1;
        state.safety_score = 90;
        state.quality_score = 80;
        Checkpoint::seal(NewCheckpoint {
            thread_id: "t-1".into(),
            sequence_no: 7,
            source: StepSource::Input,
            update: StateUpdate::default(),
            state,
            pending_stage: None,
        })
        .unwrap()
    }

    #[test]
    fn test_paused_run_is_pending_review() {
        let update = outcome_update(&Ok(RunOutcome::Paused {
            checkpoint: checkpoint(DraftStatus::Reviewing),
        }));
        assert_eq!(update.status, Some(SessionStatus::PendingReview));
        assert_eq!(update.safety_score, Some(90));
        assert!(update.final_artifact.is_none());
    }

    #[test]
    fn test_approved_run_records_final_artifact() {
        let update = outcome_update(&Ok(RunOutcome::Finished {
            status: EngineStatus::TerminalApproved,
            checkpoint: checkpoint(DraftStatus::Approved),
        }));
        assert_eq!(update.status, Some(SessionStatus::Approved));
        assert_eq!(update.final_artifact.as_deref(), Some("final words"));
        assert_eq!(update.iteration_count, Some(1));
    }

    #[test]
    fn test_rejection_is_recorded_until_next_pause() {
        assert_eq!(
            after_decision(ReviewAction::Reject).status,
            Some(SessionStatus::Rejected)
        );
        assert_eq!(
            after_decision(ReviewAction::Approve).status,
            Some(SessionStatus::Running)
        );
    }

    async fn stranded_thread(engine: &Engine, thread_id: &str) {
        engine
            .store()
            .append(NewCheckpoint {
                thread_id: thread_id.into(),
                sequence_no: 0,
                source: StepSource::Input,
                update: StateUpdate::default(),
                state: BlackboardState::new(thread_id, "intent"),
                pending_stage: None,
            })
            .await
            .unwrap();
    }

    async fn session_status(db: &DbHandle, thread_id: &'static str) -> SessionStatus {
        db.call(move |db| db.get_session_by_thread(thread_id))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_reconcile_fails_rejected_and_running_sessions() {
        let state = test_state(Vec::new());
        for (thread_id, status) in [
            ("t-rejected", SessionStatus::Rejected),
            ("t-running", SessionStatus::Running),
            ("t-approved", SessionStatus::Approved),
        ] {
            stranded_thread(&state.engine, thread_id).await;
            let session = state
                .db
                .call(move |db| db.create_session(thread_id, "intent"))
                .await
                .unwrap();
            let update = SessionUpdate {
                status: Some(status),
                ..SessionUpdate::default()
            };
            state
                .db
                .call(move |db| db.update_session(session.id, &update))
                .await
                .unwrap();
        }

        let fixed = reconcile(&state.db, &state.engine).await.unwrap();
        assert_eq!(fixed, 2);

        assert_eq!(session_status(&state.db, "t-rejected").await, SessionStatus::Failed);
        assert_eq!(session_status(&state.db, "t-running").await, SessionStatus::Failed);
        assert_eq!(session_status(&state.db, "t-approved").await, SessionStatus::Approved);
    }

    #[test]
    fn test_failed_run_keeps_error_message() {
        let update = outcome_update(&Err(EngineError::RunFailed {
            thread_id: "t-1".into(),
            message: "store unavailable".into(),
        }));
        assert_eq!(update.status, Some(SessionStatus::Failed));
        assert!(update.error_message.unwrap().contains("store unavailable"));
    }
}
