//! The orchestration engine: drives a thread from checkpoint to checkpoint
//! until it reaches an interrupt point or the end of the graph.
//!
//! Each step runs one stage against the latest state, merges the returned
//! update, and appends exactly one checkpoint. Suspension is durable: a
//! paused thread is nothing more than a checkpoint whose `pending_stage` is
//! set, so `resume` and `recover` work the same after a process restart.
//!
//! One driver per thread at a time: every run holds the thread's lock for
//! its whole lifetime, and the store rejects out-of-sequence appends.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::broadcast::{EventHub, WorkflowEvent};
use super::checkpoint::{self, Checkpoint, CheckpointStore, NewCheckpoint, StepSource};
use super::router::Router;
use super::stage::{Route, StageName, StageSet};
use super::state::{BlackboardState, DraftStatus, HumanDecision, StateUpdate};
use crate::config::WorkflowSection;
use crate::errors::EngineError;

/// Lifecycle of one thread as seen from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotStarted,
    Running,
    PausedAtHumanGate,
    TerminalApproved,
    TerminalCancelled,
    TerminalFailed,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::PausedAtHumanGate => "paused_at_human_gate",
            Self::TerminalApproved => "terminal_approved",
            Self::TerminalCancelled => "terminal_cancelled",
            Self::TerminalFailed => "terminal_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TerminalApproved | Self::TerminalCancelled | Self::TerminalFailed
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "paused_at_human_gate" => Ok(Self::PausedAtHumanGate),
            "terminal_approved" => Ok(Self::TerminalApproved),
            "terminal_cancelled" => Ok(Self::TerminalCancelled),
            "terminal_failed" => Ok(Self::TerminalFailed),
            _ => Err(format!("Invalid engine status: {}", s)),
        }
    }
}

/// How a driver's run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Paused { checkpoint: Checkpoint },
    Finished {
        status: EngineStatus,
        checkpoint: Checkpoint,
    },
}

impl RunOutcome {
    pub fn status(&self) -> EngineStatus {
        match self {
            Self::Paused { .. } => EngineStatus::PausedAtHumanGate,
            Self::Finished { status, .. } => *status,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        match self {
            Self::Paused { checkpoint } | Self::Finished { checkpoint, .. } => checkpoint,
        }
    }

    pub fn state(&self) -> &BlackboardState {
        &self.checkpoint().state
    }
}

/// A driver running in the background.
#[derive(Debug)]
pub struct RunHandle {
    pub thread_id: String,
    task: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    /// Wait for the driver to pause or finish.
    pub async fn wait(self) -> Result<RunOutcome, EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::RunFailed {
                thread_id: self.thread_id,
                message: format!("driver task aborted: {}", e),
            }),
        }
    }
}

/// Result of an explicit recovery request.
#[derive(Debug)]
pub enum Recovery {
    /// A driver was started from the latest checkpoint.
    Resumed(RunHandle),
    /// Nothing left to run.
    AlreadyTerminal(EngineStatus),
}

/// Latest state of a thread plus its derived status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub sequence_no: u64,
    pub status: EngineStatus,
    pub pending_stage: Option<StageName>,
    pub state: BlackboardState,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn CheckpointStore>,
    stages: StageSet,
    router: Router,
    hub: EventHub,
    interrupt_before: Vec<StageName>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    failures: Mutex<HashMap<String, String>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        stages: StageSet,
        workflow: &WorkflowSection,
    ) -> Result<Self, EngineError> {
        Self::with_hub(store, stages, workflow, EventHub::default())
    }

    pub fn with_hub(
        store: Arc<dyn CheckpointStore>,
        stages: StageSet,
        workflow: &WorkflowSection,
        hub: EventHub,
    ) -> Result<Self, EngineError> {
        if let Some(stage) = stages.missing().into_iter().next() {
            return Err(EngineError::MissingStage { stage });
        }
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                stages,
                router: Router::new(workflow.safety_threshold),
                hub,
                interrupt_before: workflow.interrupt_before.clone(),
                locks: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    /// Create a thread with a fresh id and start driving it.
    pub async fn start(&self, intent: &str) -> Result<RunHandle, EngineError> {
        self.start_thread(&Uuid::new_v4().to_string(), intent).await
    }

    /// Create `thread_id` and start driving it. Subscribing before calling
    /// this guarantees the listener sees every step.
    pub async fn start_thread(&self, thread_id: &str, intent: &str) -> Result<RunHandle, EngineError> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(EngineError::EmptyIntent);
        }
        let guard = self
            .claim(thread_id)?
            .ok_or_else(|| EngineError::ThreadExists {
                thread_id: thread_id.to_string(),
            })?;
        if self.inner.store.latest(thread_id).await?.is_some() {
            return Err(EngineError::ThreadExists {
                thread_id: thread_id.to_string(),
            });
        }

        let origin = self
            .inner
            .store
            .append(NewCheckpoint {
                thread_id: thread_id.to_string(),
                sequence_no: 0,
                source: StepSource::Input,
                update: StateUpdate::default(),
                state: BlackboardState::new(thread_id, intent),
                pending_stage: None,
            })
            .await?;
        info!(thread_id, "thread started");
        Ok(self.spawn_driver(origin, guard))
    }

    /// Record the reviewer's decision on a paused thread and continue it.
    ///
    /// Rejected synchronously, without touching the store, when the thread is
    /// unknown or not paused.
    pub async fn resume(
        &self,
        thread_id: &str,
        decision: HumanDecision,
    ) -> Result<RunHandle, EngineError> {
        let Some(guard) = self.claim(thread_id)? else {
            return Err(EngineError::NotPaused {
                thread_id: thread_id.to_string(),
                status: EngineStatus::Running,
            });
        };
        let latest = self.latest_or_not_found(thread_id).await?;
        let Some(pending) = latest.pending_stage else {
            return Err(EngineError::NotPaused {
                thread_id: thread_id.to_string(),
                status: self.settled_status(&latest)?,
            });
        };

        info!(thread_id, action = decision.action.as_str(), "resuming with review decision");
        let recorded = self
            .inner
            .store
            .apply_external_update(
                thread_id,
                StateUpdate::human_decision(decision).stamped(Utc::now()),
                pending,
            )
            .await?;
        self.clear_failure(thread_id)?;
        self.inner.hub.publish(WorkflowEvent::StateUpdate {
            thread_id: thread_id.to_string(),
            sequence_no: recorded.sequence_no,
            stage: pending,
            state: Box::new(recorded.state.clone()),
        });
        Ok(self.spawn_driver(recorded, guard))
    }

    /// Continue a thread from its latest checkpoint after a crash or a
    /// failed run. A paused thread re-enters its pending stage with no new
    /// input, which leaves it paused.
    pub async fn recover(&self, thread_id: &str) -> Result<Recovery, EngineError> {
        let Some(guard) = self.claim(thread_id)? else {
            return Err(EngineError::Busy {
                thread_id: thread_id.to_string(),
            });
        };
        let latest = self.latest_or_not_found(thread_id).await?;
        match latest.next_route(&self.inner.router) {
            Route::End => Ok(Recovery::AlreadyTerminal(terminal_status(&latest.state))),
            Route::Stage(stage) => {
                info!(thread_id, sequence_no = latest.sequence_no, next = %stage, "recovering thread");
                self.clear_failure(thread_id)?;
                Ok(Recovery::Resumed(self.spawn_driver(latest, guard)))
            }
        }
    }

    /// Latest state of a thread. A failed run reports `DraftStatus::Failed`
    /// here while the store keeps the last good checkpoint for `recover`.
    pub async fn get_state(&self, thread_id: &str) -> Result<ThreadSnapshot, EngineError> {
        let latest = self.latest_or_not_found(thread_id).await?;
        let status = self.status_of(&latest)?;
        let mut state = latest.state;
        if status == EngineStatus::TerminalFailed {
            state.status = DraftStatus::Failed;
        }
        Ok(ThreadSnapshot {
            thread_id: latest.thread_id,
            sequence_no: latest.sequence_no,
            status,
            pending_stage: latest.pending_stage,
            state,
        })
    }

    pub async fn status(&self, thread_id: &str) -> Result<EngineStatus, EngineError> {
        match self.inner.store.latest(thread_id).await? {
            Some(latest) => self.status_of(&latest),
            None if self.is_driving(thread_id)? => Ok(EngineStatus::Running),
            None => Ok(EngineStatus::NotStarted),
        }
    }

    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, EngineError> {
        let history = self.inner.store.history(thread_id).await?;
        if history.is_empty() {
            return Err(EngineError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        }
        Ok(history)
    }

    /// Fold the thread's history from sequence 0 and return the final state.
    pub async fn replay(&self, thread_id: &str) -> Result<BlackboardState, EngineError> {
        let history = self.history(thread_id).await?;
        Ok(checkpoint::replay(thread_id, &history)?)
    }

    pub fn subscribe(
        &self,
        thread_id: &str,
    ) -> Result<broadcast::Receiver<WorkflowEvent>, EngineError> {
        self.inner.hub.subscribe(thread_id)
    }

    /// Drop a listener and forget the thread's channel if it was the last.
    pub fn unsubscribe(&self, thread_id: &str, rx: broadcast::Receiver<WorkflowEvent>) {
        drop(rx);
        self.inner.hub.release(thread_id);
    }

    /// Remove a thread's checkpoints. Refused while a driver holds it.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<usize, EngineError> {
        let Some(_guard) = self.claim(thread_id)? else {
            return Err(EngineError::Busy {
                thread_id: thread_id.to_string(),
            });
        };
        let removed = self.inner.store.delete_thread(thread_id).await?;
        self.inner.hub.close(thread_id);
        self.clear_failure(thread_id)?;
        info!(thread_id, removed, "thread deleted");
        Ok(removed)
    }

    fn spawn_driver(&self, checkpoint: Checkpoint, guard: ThreadGuard) -> RunHandle {
        let engine = self.clone();
        let thread_id = checkpoint.thread_id.clone();
        let span = info_span!("run", thread_id = %thread_id);
        let task = tokio::spawn(
            async move {
                let result = engine.drive_reporting(checkpoint).await;
                drop(guard);
                result
            }
            .instrument(span),
        );
        RunHandle { thread_id, task }
    }

    async fn drive_reporting(&self, checkpoint: Checkpoint) -> Result<RunOutcome, EngineError> {
        let thread_id = checkpoint.thread_id.clone();
        let result = self.drive(checkpoint).await;
        // A finished thread publishes nothing more.
        if let Ok(RunOutcome::Finished { .. }) = &result {
            self.inner.hub.close(&thread_id);
        } else {
            self.inner.hub.release(&thread_id);
        }
        if let Err(e) = &result {
            let message = e.to_string();
            error!(thread_id = %thread_id, "run failed: {}", message);
            if let Ok(mut failures) = self.inner.failures.lock() {
                failures.insert(thread_id.clone(), message.clone());
            }
            self.inner
                .hub
                .publish(WorkflowEvent::Error { thread_id, message });
        }
        result
    }

    async fn drive(&self, mut checkpoint: Checkpoint) -> Result<RunOutcome, EngineError> {
        let thread_id = checkpoint.thread_id.clone();
        let mut route = checkpoint.next_route(&self.inner.router);

        loop {
            let stage_name = match route {
                Route::End => {
                    let status = terminal_status(&checkpoint.state);
                    info!(thread_id = %thread_id, sequence_no = checkpoint.sequence_no, %status, "run finished");
                    self.inner.hub.publish(WorkflowEvent::Terminal {
                        thread_id: thread_id.clone(),
                        sequence_no: checkpoint.sequence_no,
                        status,
                        state: Box::new(checkpoint.state.clone()),
                    });
                    return Ok(RunOutcome::Finished { status, checkpoint });
                }
                Route::Stage(stage) => stage,
            };

            let stage = self
                .inner
                .stages
                .get(stage_name)
                .cloned()
                .ok_or(EngineError::MissingStage { stage: stage_name })?;
            let update = stage
                .run(&checkpoint.state)
                .instrument(info_span!("stage", stage = %stage_name))
                .await
                .stamped(Utc::now());

            let state = checkpoint.state.merged(&update);
            verify_step(&checkpoint.state, &state).map_err(|message| EngineError::RunFailed {
                thread_id: thread_id.clone(),
                message: format!("{} broke a state invariant: {}", stage_name, message),
            })?;

            route = self.inner.router.next(stage_name, &state);
            let pending = route
                .stage()
                .filter(|next| self.inner.interrupt_before.contains(next));

            checkpoint = self
                .inner
                .store
                .append(NewCheckpoint {
                    thread_id: thread_id.clone(),
                    sequence_no: checkpoint.sequence_no + 1,
                    source: StepSource::Stage(stage_name),
                    update,
                    state,
                    pending_stage: pending,
                })
                .await?;
            info!(
                thread_id = %thread_id,
                stage = %stage_name,
                sequence_no = checkpoint.sequence_no,
                next = %route,
                "step complete"
            );
            self.inner.hub.publish(WorkflowEvent::StateUpdate {
                thread_id: thread_id.clone(),
                sequence_no: checkpoint.sequence_no,
                stage: stage_name,
                state: Box::new(checkpoint.state.clone()),
            });

            if let Some(pending_stage) = pending {
                info!(thread_id = %thread_id, %pending_stage, "paused for review");
                self.inner.hub.publish(WorkflowEvent::Paused {
                    thread_id: thread_id.clone(),
                    sequence_no: checkpoint.sequence_no,
                    pending_stage,
                    state: Box::new(checkpoint.state.clone()),
                });
                return Ok(RunOutcome::Paused { checkpoint });
            }
        }
    }

    async fn latest_or_not_found(&self, thread_id: &str) -> Result<Checkpoint, EngineError> {
        self.inner
            .store
            .latest(thread_id)
            .await?
            .ok_or_else(|| EngineError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })
    }

    fn status_of(&self, latest: &Checkpoint) -> Result<EngineStatus, EngineError> {
        if self.is_driving(&latest.thread_id)? {
            return Ok(EngineStatus::Running);
        }
        self.settled_status(latest)
    }

    /// Status of a thread no driver is working on.
    fn settled_status(&self, latest: &Checkpoint) -> Result<EngineStatus, EngineError> {
        if self.failure(&latest.thread_id)?.is_some() {
            return Ok(EngineStatus::TerminalFailed);
        }
        if latest.is_paused() {
            return Ok(EngineStatus::PausedAtHumanGate);
        }
        Ok(match latest.next_route(&self.inner.router) {
            Route::End => terminal_status(&latest.state),
            // Mid-flight with no driver: the run died and waits for `recover`.
            Route::Stage(_) => EngineStatus::TerminalFailed,
        })
    }

    /// Message of the last failed run, if it has not been recovered since.
    pub fn failure(&self, thread_id: &str) -> Result<Option<String>, EngineError> {
        let failures = self
            .inner
            .failures
            .lock()
            .map_err(|e| anyhow::anyhow!("failure map lock poisoned: {}", e))?;
        Ok(failures.get(thread_id).cloned())
    }

    fn clear_failure(&self, thread_id: &str) -> Result<(), EngineError> {
        self.inner
            .failures
            .lock()
            .map_err(|e| anyhow::anyhow!("failure map lock poisoned: {}", e))?
            .remove(thread_id);
        Ok(())
    }

    fn is_driving(&self, thread_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .lock_map()?
            .get(thread_id)
            .is_some_and(|lock| lock.try_lock().is_err()))
    }

    /// Take the thread's lock without waiting. `None` while another caller
    /// holds it.
    fn claim(&self, thread_id: &str) -> Result<Option<ThreadGuard>, EngineError> {
        let lock = self
            .lock_map()?
            .entry(thread_id.to_string())
            .or_default()
            .clone();
        Ok(lock.try_lock_owned().ok().map(|guard| ThreadGuard {
            inner: self.inner.clone(),
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        }))
    }

    fn lock_map(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>>, EngineError>
    {
        self.inner
            .locks
            .lock()
            .map_err(|e| anyhow::anyhow!("thread lock map poisoned: {}", e).into())
    }
}

/// Exclusive hold on one thread. Dropping it unlocks the thread and forgets
/// the lock once no other caller refers to it, so finished and unknown
/// threads leave nothing behind.
struct ThreadGuard {
    inner: Arc<EngineInner>,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let Ok(mut locks) = self.inner.locks.lock() else {
            return;
        };
        if locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.thread_id);
        }
    }
}

fn terminal_status(state: &BlackboardState) -> EngineStatus {
    match state.status {
        DraftStatus::Approved => EngineStatus::TerminalApproved,
        DraftStatus::Cancelled => EngineStatus::TerminalCancelled,
        _ => EngineStatus::TerminalFailed,
    }
}

/// Checks a merged step against the invariants stages must not break.
fn verify_step(before: &BlackboardState, after: &BlackboardState) -> Result<(), String> {
    after.check_invariants()?;
    if after.scratchpad.len() < before.scratchpad.len() {
        return Err(format!(
            "scratchpad shrank from {} to {} notes",
            before.scratchpad.len(),
            after.scratchpad.len()
        ));
    }
    if after.intent != before.intent || after.thread_id != before.thread_id {
        return Err("identity fields changed".to_string());
    }
    if after.scratchpad.len() == before.scratchpad.len() {
        warn!(thread_id = %after.thread_id, "stage appended no scratchpad note");
    }
    Ok(())
}
