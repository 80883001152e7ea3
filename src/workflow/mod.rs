//! Checkpointed, conditionally routed workflow core.
//!
//! ```text
//! coordinator ──► drafter ──► safety ──┬──► quality ──► coordinator
//!      │                               └──────────────► coordinator
//!      └──► [pause] human_gate ──┬──► finalizer ──► end
//!                                ├──► drafter
//!                                └──► end (cancelled)
//! ```
//!
//! - `state` holds the blackboard and the sparse per-step update
//! - `stage` names the stages and defines the `Stage` trait
//! - `router` decides the next stage from the merged state
//! - `checkpoint` persists one row per step and replays histories
//! - `broadcast` fans progress out to live listeners
//! - `engine` drives threads, pauses them, and resumes them

pub mod broadcast;
pub mod checkpoint;
pub mod engine;
pub mod router;
pub mod stage;
pub mod state;

pub use broadcast::{EventHub, WorkflowEvent};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, NewCheckpoint, StepSource};
pub use engine::{Engine, EngineStatus, Recovery, RunHandle, RunOutcome, ThreadSnapshot};
pub use router::Router;
pub use stage::{Route, Stage, StageName, StageSet};
pub use state::{
    BlackboardState, DecisionPatch, DraftStatus, HumanDecision, Note, ReviewAction, SafetyFlag,
    Severity, StateUpdate,
};
