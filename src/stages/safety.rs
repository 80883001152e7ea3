use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{bullet_list, clamp_score, generate_within, parse_response, preview, prompts};
use crate::errors::StageError;
use crate::llm::{GenerationRequest, TextGenerator};
use crate::workflow::{
    BlackboardState, DraftStatus, Note, Route, SafetyFlag, Severity, Stage, StageName, StateUpdate,
};

const REVIEW_TEMPERATURE: f32 = 0.1;
const FALLBACK_SCORE: u8 = 50;

#[derive(Debug, Deserialize)]
struct SafetyReport {
    safety_score: f64,
    #[serde(default)]
    flags: Vec<RawFlag>,
    #[serde(default)]
    overall_assessment: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFlag {
    #[serde(default, alias = "line")]
    location: Option<serde_json::Value>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    severity: Option<String>,
}

impl RawFlag {
    fn into_flag(self) -> SafetyFlag {
        let location = match self.location {
            Some(serde_json::Value::Number(n)) => format!("line {}", n),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
            _ => "unspecified".to_string(),
        };
        let severity = self
            .severity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Warning);
        let reason = if self.reason.trim().is_empty() {
            "Unspecified concern".to_string()
        } else {
            self.reason
        };
        SafetyFlag {
            location,
            reason,
            severity,
        }
    }
}

/// Scored outcome of one safety pass.
struct Assessment {
    score: u8,
    flags: Vec<SafetyFlag>,
    summary: String,
    recommendations: Vec<String>,
}

impl Assessment {
    fn parse(text: &str) -> Result<Self, StageError> {
        let report: SafetyReport = parse_response("safety", text)?;
        Ok(Self {
            score: clamp_score(report.safety_score),
            flags: report.flags.into_iter().map(RawFlag::into_flag).collect(),
            summary: report.overall_assessment,
            recommendations: report.recommendations,
        })
    }

    fn fallback() -> Self {
        Self {
            score: FALLBACK_SCORE,
            flags: vec![SafetyFlag {
                location: "document".to_string(),
                reason: "Could not parse safety analysis - manual review required".to_string(),
                severity: Severity::Warning,
            }],
            summary: "Safety analysis unavailable - manual review required".to_string(),
            recommendations: vec!["Manual safety review required".to_string()],
        }
    }
}

fn format_flags(flags: &[SafetyFlag]) -> String {
    bullet_list(
        flags
            .iter()
            .map(|f| format!("{}: {} [{}]", f.location, f.reason, f.severity.as_str())),
    )
}

/// Scores the current draft for harm risk.
pub struct SafetyReviewer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    threshold: u8,
}

impl SafetyReviewer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration, threshold: u8) -> Self {
        Self {
            generator,
            timeout,
            threshold,
        }
    }
}

#[async_trait]
impl Stage for SafetyReviewer {
    fn name(&self) -> StageName {
        StageName::SafetyReviewer
    }

    async fn run(&self, state: &BlackboardState) -> StateUpdate {
        let request = GenerationRequest::new(
            prompts::SAFETY_SYSTEM,
            prompts::safety_task(&state.current_draft),
        )
        .with_temperature(REVIEW_TEMPERATURE);

        let assessment = match generate_within(self.generator.as_ref(), request, self.timeout)
            .await
            .and_then(|text| Assessment::parse(&text))
        {
            Ok(assessment) => assessment,
            Err(e) => {
                warn!(thread_id = %state.thread_id, "safety reviewer fallback: {}", e);
                Assessment::fallback()
            }
        };

        let passed = assessment.score >= self.threshold;
        let critical = assessment
            .flags
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();

        let mut output = format!(
            "Safety score: {}/100\nFlags found: {}",
            assessment.score,
            assessment.flags.len()
        );
        if !assessment.flags.is_empty() {
            output.push_str("\nFlags:\n");
            output.push_str(&format_flags(&assessment.flags[..assessment.flags.len().min(5)]));
        }
        if !assessment.summary.is_empty() {
            output.push_str(&format!("\n\nAssessment: {}", preview(&assessment.summary, 300)));
        }

        let note = Note::new(
            StageName::SafetyReviewer,
            format!(
                "Safety scan complete. Score: {}/100. Flags: {} ({} critical).",
                assessment.score,
                assessment.flags.len(),
                critical
            ),
        )
        .with_input(format!("Draft to analyze:\n{}", preview(&state.current_draft, 1000)))
        .with_output(output);

        let mut update = StateUpdate {
            safety_score: Some(assessment.score),
            ..StateUpdate::default()
        };
        if passed {
            update.status = Some(DraftStatus::Reviewing);
            update.next_stage_hint = Some(Route::Stage(StageName::QualityReviewer));
        } else {
            let mut instructions = format!(
                "SAFETY ISSUES DETECTED (Score: {}/100)\n\nFlags:\n{}",
                assessment.score,
                format_flags(&assessment.flags)
            );
            if !assessment.recommendations.is_empty() {
                instructions.push_str("\n\nRecommendations:\n");
                instructions.push_str(&bullet_list(&assessment.recommendations));
            }
            update.revision_instructions = Some(instructions);
            update.status = Some(DraftStatus::NeedsRevision);
            update.next_stage_hint = Some(Route::Stage(StageName::Coordinator));
        }
        update.safety_flags = Some(assessment.flags);
        update.with_note(state, note)
    }
}
