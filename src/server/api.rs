use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::sessions;
use crate::db::{DbHandle, Session, SessionStatus, SessionUpdate};
use crate::errors::EngineError;
use crate::workflow::{Engine, EngineStatus, HumanDecision, Recovery, ReviewAction};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Engine,
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct GenerateRequest {
    pub intent: String,
}

#[derive(Serialize, Deserialize)]
pub struct RunAccepted {
    pub thread_id: String,
    pub session_id: Option<i64>,
    pub status: EngineStatus,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub action: String,
    pub edits: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Deserialize)]
pub struct SessionQuery {
    pub status: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: i64,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let msg = e.to_string();
        match e {
            EngineError::ThreadNotFound { .. } => ApiError::NotFound(msg),
            EngineError::NotPaused { .. }
            | EngineError::Busy { .. }
            | EngineError::ThreadExists { .. }
            | EngineError::TooManySubscribers { .. } => ApiError::Conflict(msg),
            EngineError::EmptyIntent => ApiError::BadRequest(msg),
            _ => ApiError::Internal(msg),
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/generate", post(generate))
        .route("/api/state/{thread_id}", get(get_state))
        .route("/api/history/{thread_id}", get(get_history))
        .route("/api/review/{thread_id}", post(submit_review))
        .route("/api/resume/{thread_id}", post(resume_thread))
        .route("/api/sessions", get(list_sessions))
        .route("/api/session/{id}", get(get_session).delete(delete_session))
        .route(
            "/api/session/thread/{thread_id}",
            delete(delete_session_by_thread),
        )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn generate(
    State(state): State<SharedState>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let intent = req.intent.trim().to_string();
    if intent.is_empty() {
        return Err(EngineError::EmptyIntent.into());
    }

    let thread_id = Uuid::new_v4().to_string();
    let session = {
        let thread_id = thread_id.clone();
        let intent = intent.clone();
        state
            .db
            .call(move |db| db.create_session(&thread_id, &intent))
            .await
            .map_err(internal)?
    };

    let handle = match state.engine.start_thread(&thread_id, &intent).await {
        Ok(handle) => handle,
        Err(e) => {
            let update = SessionUpdate {
                status: Some(SessionStatus::Failed),
                error_message: Some(e.to_string()),
                ..SessionUpdate::default()
            };
            sessions::record(&state.db, &thread_id, update)
                .await
                .map_err(internal)?;
            return Err(e.into());
        }
    };
    info!(thread_id = %thread_id, session_id = session.id, "generation started");
    sessions::track(state.db.clone(), handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            thread_id,
            session_id: Some(session.id),
            status: EngineStatus::Running,
        }),
    ))
}

async fn get_state(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.get_state(&thread_id).await?))
}

async fn get_history(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.history(&thread_id).await?))
}

async fn submit_review(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let action = ReviewAction::from_str(&req.action).map_err(ApiError::BadRequest)?;
    let decision = HumanDecision {
        action,
        edits: req.edits,
        feedback: req.feedback,
    };

    let handle = state.engine.resume(&thread_id, decision).await?;
    sessions::record(&state.db, &thread_id, sessions::after_decision(action))
        .await
        .map_err(internal)?;
    sessions::track(state.db.clone(), handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            thread_id,
            session_id: None,
            status: EngineStatus::Running,
        }),
    ))
}

async fn resume_thread(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.engine.recover(&thread_id).await? {
        Recovery::Resumed(handle) => {
            sessions::record(
                &state.db,
                &thread_id,
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    ..SessionUpdate::default()
                },
            )
            .await
            .map_err(internal)?;
            sessions::track(state.db.clone(), handle);
            Ok((
                StatusCode::ACCEPTED,
                Json(RunAccepted {
                    thread_id,
                    session_id: None,
                    status: EngineStatus::Running,
                }),
            ))
        }
        Recovery::AlreadyTerminal(status) => Ok((
            StatusCode::OK,
            Json(RunAccepted {
                thread_id,
                session_id: None,
                status,
            }),
        )),
    }
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(SessionStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let offset = query.offset.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let page = state
        .db
        .call(move |db| {
            Ok(SessionPage {
                sessions: db.list_sessions(status, offset, limit)?,
                total: db.count_sessions(status)?,
            })
        })
        .await
        .map_err(internal)?;
    Ok(Json(page))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .db
        .call(move |db| db.get_session(id))
        .await
        .map_err(internal)?;
    match session {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NotFound(format!("Session {} not found", id))),
    }
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .db
        .call(move |db| db.get_session(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;
    remove_thread(&state, session.thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_session_by_thread(
    State(state): State<SharedState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !remove_thread(&state, thread_id.clone()).await? {
        return Err(ApiError::NotFound(format!(
            "No session for thread {}",
            thread_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Drop a thread's checkpoints through the engine (refused while a run is
/// active), then its session row. Returns whether a session existed.
async fn remove_thread(state: &AppState, thread_id: String) -> Result<bool, ApiError> {
    state.engine.delete_thread(&thread_id).await?;
    let removed = state
        .db
        .call(move |db| db.delete_session_by_thread(&thread_id))
        .await
        .map_err(internal)?;
    Ok(removed)
}

// ── Tests ─────────────────────────────────────────────────────────────
