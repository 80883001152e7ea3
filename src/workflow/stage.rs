//! Stage names, routing targets and the contract every stage implements.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::state::{BlackboardState, StateUpdate};

/// Closed set of stages the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Drafter,
    SafetyReviewer,
    QualityReviewer,
    Coordinator,
    HumanGate,
    Finalizer,
}

impl StageName {
    /// First stage of every new thread. The coordinator requests the
    /// initial draft, or goes straight to review when no iterations are allowed.
    pub const ENTRY: StageName = Self::Coordinator;

    pub const ALL: [StageName; 6] = [
        Self::Drafter,
        Self::SafetyReviewer,
        Self::QualityReviewer,
        Self::Coordinator,
        Self::HumanGate,
        Self::Finalizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafter => "drafter",
            Self::SafetyReviewer => "safety_reviewer",
            Self::QualityReviewer => "quality_reviewer",
            Self::Coordinator => "coordinator",
            Self::HumanGate => "human_gate",
            Self::Finalizer => "finalizer",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafter" => Ok(Self::Drafter),
            "safety_reviewer" => Ok(Self::SafetyReviewer),
            "quality_reviewer" => Ok(Self::QualityReviewer),
            "coordinator" => Ok(Self::Coordinator),
            "human_gate" => Ok(Self::HumanGate),
            "finalizer" => Ok(Self::Finalizer),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Where control goes after a stage: another stage or the end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", content = "stage", rename_all = "snake_case")]
pub enum Route {
    Stage(StageName),
    End,
}

impl Route {
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::Stage(stage) => Some(*stage),
            Self::End => None,
        }
    }
}

impl From<StageName> for Route {
    fn from(stage: StageName) -> Self {
        Self::Stage(stage)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => stage.fmt(f),
            Self::End => f.write_str("end"),
        }
    }
}

/// A single unit of work. Receives an immutable view of the state and
/// returns the fields it wants merged; the engine owns the merge and the
/// durable write.
///
/// Implementations must not fail: a broken generator call or an unparseable
/// response is turned into the stage's conservative fallback update.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, state: &BlackboardState) -> StateUpdate;
}

/// Stage implementations keyed by name.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: HashMap<StageName, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage` under its own name, replacing any previous entry.
    pub fn insert(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name(), stage);
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.insert(stage);
        self
    }

    pub fn get(&self, name: StageName) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&name)
    }

    /// Stages that have no registered implementation.
    pub fn missing(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|name| !self.stages.contains_key(name))
            .collect()
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.stages.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("StageSet").field("stages", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(StageName);

    #[async_trait]
    impl Stage for Noop {
        fn name(&self) -> StageName {
            self.0
        }

        async fn run(&self, _state: &BlackboardState) -> StateUpdate {
            StateUpdate::default()
        }
    }

    #[test]
    fn test_stage_names_parse_their_own_display() {
        for stage in StageName::ALL {
            assert_eq!(stage.to_string().parse::<StageName>(), Ok(stage));
        }
        assert!("supervisor".parse::<StageName>().is_err());
    }

    #[test]
    fn test_route_serializes_with_tag() {
        let json = serde_json::to_string(&Route::Stage(StageName::HumanGate)).unwrap();
        assert_eq!(json, r#"{"to":"stage","stage":"human_gate"}"#);
        let end = serde_json::to_string(&Route::End).unwrap();
        assert_eq!(end, r#"{"to":"end"}"#);
    }

    #[test]
    fn test_stage_set_reports_missing_stages() {
        let set = StageSet::new()
            .with(Arc::new(Noop(StageName::Drafter)))
            .with(Arc::new(Noop(StageName::Finalizer)));
        assert!(set.get(StageName::Drafter).is_some());
        let missing = set.missing();
        assert_eq!(missing.len(), 4);
        assert!(missing.contains(&StageName::HumanGate));
    }
}
