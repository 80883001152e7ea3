//! Model Context Protocol tools over stdio.
//!
//! | Tool               | Does                                                              |
//! |--------------------|-------------------------------------------------------------------|
//! | `create_draft`     | runs a thread to its first review, or to the end on `auto_approve` |
//! | `get_draft_status` | one session row, with a review hint while it waits                |
//! | `list_drafts`      | recent sessions, newest first                                     |
//!
//! Tools report failures as error results rather than protocol errors, so the
//! calling assistant sees the message.

use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::db::{SessionStatus, SessionUpdate};
use crate::errors::EngineError;
use crate::server::{SharedState, sessions};
use crate::stages::preview;
use crate::workflow::{HumanDecision, ReviewAction, RunOutcome};

pub const AUTO_APPROVE_FEEDBACK: &str = "Auto-approved via MCP";
const DEFAULT_LIST_LIMIT: i64 = 10;
const MAX_LIST_LIMIT: i64 = 100;
const PREVIEW_CHARS: usize = 1000;
const INTENT_CHARS: usize = 100;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateDraftArgs {
    /// What the draft should accomplish
    pub intent: String,
    /// Approve every draft that reaches review instead of waiting for a person
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DraftStatusArgs {
    /// Session id returned by create_draft
    pub session_id: i64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDraftsArgs {
    /// Maximum number of drafts to return
    #[serde(default = "default_list_limit")]
    pub limit: i64,
    /// Only drafts with this status (running, pending_review, rejected, approved, cancelled, failed)
    pub status: Option<String>,
}

fn default_list_limit() -> i64 {
    DEFAULT_LIST_LIMIT
}

fn review_hint(thread_id: &str) -> String {
    format!(
        "foundry review {} (or POST /api/review/{})",
        thread_id, thread_id
    )
}

/// Start a thread and wait for it. Without `auto_approve` the report comes
/// back at the first pause; with it every pause is approved until the run
/// ends.
pub async fn create(state: &SharedState, intent: &str, auto_approve: bool) -> Result<Value> {
    let intent = intent.trim();
    if intent.is_empty() {
        return Err(EngineError::EmptyIntent.into());
    }

    let thread_id = Uuid::new_v4().to_string();
    let session = {
        let thread_id = thread_id.clone();
        let intent = intent.to_string();
        state
            .db
            .call(move |db| db.create_session(&thread_id, &intent))
            .await?
    };

    let mut handle = match state.engine.start_thread(&thread_id, intent).await {
        Ok(handle) => handle,
        Err(e) => {
            let update = SessionUpdate {
                status: Some(SessionStatus::Failed),
                error_message: Some(e.to_string()),
                ..SessionUpdate::default()
            };
            sessions::record(&state.db, &thread_id, update).await?;
            return Err(e.into());
        }
    };
    info!(thread_id = %thread_id, session_id = session.id, auto_approve, "draft requested over MCP");

    loop {
        let result = handle.wait().await;
        let update = sessions::outcome_update(&result);
        let status = update.status.unwrap_or(SessionStatus::Failed);
        sessions::record(&state.db, &thread_id, update).await?;

        match result.context("Draft generation failed")? {
            RunOutcome::Paused { .. } if auto_approve => {
                let decision = HumanDecision {
                    action: ReviewAction::Approve,
                    edits: None,
                    feedback: Some(AUTO_APPROVE_FEEDBACK.to_string()),
                };
                handle = state.engine.resume(&thread_id, decision).await?;
                sessions::record(
                    &state.db,
                    &thread_id,
                    sessions::after_decision(ReviewAction::Approve),
                )
                .await?;
            }
            RunOutcome::Paused { checkpoint } => {
                let draft = &checkpoint.state;
                return Ok(json!({
                    "status": status,
                    "session_id": session.id,
                    "thread_id": thread_id,
                    "message": "Draft generated and awaiting human review",
                    "review": review_hint(&thread_id),
                    "preview": {
                        "draft": preview(&draft.current_draft, PREVIEW_CHARS),
                        "safety_score": draft.safety_score,
                        "quality_score": draft.quality_score,
                        "iterations": draft.iteration_count,
                    },
                }));
            }
            RunOutcome::Finished { checkpoint, .. } => {
                let draft = &checkpoint.state;
                return Ok(json!({
                    "status": status,
                    "session_id": session.id,
                    "thread_id": thread_id,
                    "draft": draft.current_draft,
                    "metrics": {
                        "safety_score": draft.safety_score,
                        "quality_score": draft.quality_score,
                        "iterations": draft.iteration_count,
                    },
                }));
            }
        }
    }
}

pub async fn status(state: &SharedState, session_id: i64) -> Result<Value> {
    let session = state
        .db
        .call(move |db| db.get_session(session_id))
        .await?
        .ok_or_else(|| anyhow!("Session not found: {}", session_id))?;
    let mut report = serde_json::to_value(&session)?;
    if session.status == SessionStatus::PendingReview {
        report["review"] = json!(review_hint(&session.thread_id));
    }
    Ok(report)
}

pub async fn list(state: &SharedState, limit: i64, status: Option<&str>) -> Result<Value> {
    let status = status
        .map(SessionStatus::from_str)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let sessions = state
        .db
        .call(move |db| db.list_sessions(status, 0, limit))
        .await?;

    let drafts: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "thread_id": s.thread_id,
                "intent": preview(&s.intent, INTENT_CHARS),
                "status": s.status,
                "created_at": s.created_at,
                "safety_score": s.safety_score,
                "quality_score": s.quality_score,
            })
        })
        .collect();
    Ok(json!({ "count": drafts.len(), "drafts": drafts }))
}

fn tool_result(report: Result<Value>) -> Result<CallToolResult, McpError> {
    match report {
        Ok(value) => {
            let text = serde_json::to_string_pretty(&value)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
            "Error: {:#}",
            e
        ))])),
    }
}

#[derive(Clone)]
pub struct DraftTools {
    state: SharedState,
    tool_router: ToolRouter<DraftTools>,
}

#[tool_router]
impl DraftTools {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Draft a piece of text with the multi-stage workflow. The draft passes safety and quality review, then waits for a human unless auto_approve is set."
    )]
    async fn create_draft(
        &self,
        Parameters(args): Parameters<CreateDraftArgs>,
    ) -> Result<CallToolResult, McpError> {
        tool_result(create(&self.state, &args.intent, args.auto_approve).await)
    }

    #[tool(description = "Check the status of a drafting session.")]
    async fn get_draft_status(
        &self,
        Parameters(args): Parameters<DraftStatusArgs>,
    ) -> Result<CallToolResult, McpError> {
        tool_result(status(&self.state, args.session_id).await)
    }

    #[tool(description = "List recent drafting sessions.")]
    async fn list_drafts(
        &self,
        Parameters(args): Parameters<ListDraftsArgs>,
    ) -> Result<CallToolResult, McpError> {
        tool_result(list(&self.state, args.limit, args.status.as_deref()).await)
    }
}

#[tool_handler]
impl ServerHandler for DraftTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Foundry drafts text through drafting, safety review and quality review, then waits for a human decision."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Serve the tools on stdin/stdout until the client disconnects.
pub async fn serve_stdio(state: SharedState) -> Result<()> {
    let service = DraftTools::new(state)
        .serve(stdio())
        .await
        .context("Failed to start MCP server")?;
    info!("MCP server ready on stdio");
    service.waiting().await.context("MCP server task failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::api::tests::test_state;
    use crate::stages::testing::Reply;
    use crate::workflow::DecisionPatch;

    const SAFE: &str = r#"{"safety_score": 95, "flags": [], "recommendations": []}"#;
    const WARM: &str = r#"{"quality_score": 88, "strengths": [], "improvements": []}"#;

    fn happy_replies() -> Vec<Reply> {
        vec![
            Reply::Text("A calm note about exams.".into()),
            Reply::Text(SAFE.into()),
            Reply::Text(WARM.into()),
        ]
    }

    #[tokio::test]
    async fn test_create_waits_for_review_by_default() {
        let state = test_state(happy_replies());
        let report = create(&state, "Write a note about exams", false).await.unwrap();

        assert_eq!(report["status"], "pending_review");
        assert_eq!(report["preview"]["draft"], "A calm note about exams.");
        assert_eq!(report["preview"]["safety_score"], 95);
        assert_eq!(report["preview"]["iterations"], 1);

        let session_id = report["session_id"].as_i64().unwrap();
        let row = status(&state, session_id).await.unwrap();
        assert_eq!(row["status"], "pending_review");
        assert!(row["review"].as_str().unwrap().starts_with("foundry review "));
    }

    #[tokio::test]
    async fn test_auto_approve_runs_to_the_end() {
        let state = test_state(happy_replies());
        let report = create(&state, "Write a note about exams", true).await.unwrap();

        assert_eq!(report["status"], "approved");
        assert_eq!(report["draft"], "A calm note about exams.");
        assert_eq!(report["metrics"]["quality_score"], 88);

        let thread_id = report["thread_id"].as_str().unwrap().to_string();
        let history = state.engine.history(&thread_id).await.unwrap();
        let approval = history
            .iter()
            .rev()
            .find_map(|c| match &c.update.human_decision {
                Some(DecisionPatch::Set(decision)) => Some(decision.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(approval.feedback(), Some(AUTO_APPROVE_FEEDBACK));

        let session_id = report["session_id"].as_i64().unwrap();
        let row = status(&state, session_id).await.unwrap();
        assert_eq!(row["status"], "approved");
        assert_eq!(row["final_artifact"], "A calm note about exams.");
        assert!(row.get("review").is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_blank_intent() {
        let state = test_state(Vec::new());
        let err = create(&state, "   ", false).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_status_of_unknown_session_is_an_error() {
        let state = test_state(Vec::new());
        let err = status(&state, 404).await.unwrap_err();
        assert!(err.to_string().contains("Session not found: 404"));
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_shortens_intents() {
        let state = test_state(Vec::new());
        let long_intent = "x".repeat(INTENT_CHARS + 20);
        let created = {
            let long_intent = long_intent.clone();
            state
                .db
                .call(move |db| {
                    db.create_session("t-a", &long_intent)?;
                    db.create_session("t-b", "short")
                })
                .await
                .unwrap()
        };
        let update = SessionUpdate {
            status: Some(SessionStatus::Approved),
            ..SessionUpdate::default()
        };
        state
            .db
            .call(move |db| db.update_session(created.id, &update))
            .await
            .unwrap();

        let all = list(&state, DEFAULT_LIST_LIMIT, None).await.unwrap();
        assert_eq!(all["count"], 2);
        let long = all["drafts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["thread_id"] == "t-a")
            .unwrap();
        assert_eq!(
            long["intent"].as_str().unwrap().len(),
            INTENT_CHARS + "...".len()
        );

        let approved = list(&state, DEFAULT_LIST_LIMIT, Some("approved")).await.unwrap();
        assert_eq!(approved["count"], 1);
        assert_eq!(approved["drafts"][0]["thread_id"], "t-b");

        assert!(list(&state, DEFAULT_LIST_LIMIT, Some("archived")).await.is_err());
    }

    #[test]
    fn test_list_args_default_limit() {
        let args: ListDraftsArgs = serde_json::from_str("{}").unwrap();
        assert_eq!(args.limit, DEFAULT_LIST_LIMIT);
        assert!(args.status.is_none());
    }
}
