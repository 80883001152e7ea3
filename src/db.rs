use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::workflow::{Checkpoint, CheckpointStore, NewCheckpoint, StageName, StepSource};

/// Async-safe handle to the foundry database.
///
/// Wraps `FoundryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FoundryDb>>,
}

impl DbHandle {
    pub fn new(db: FoundryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FoundryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FoundryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

// ── Session records ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    PendingReview,
    Approved,
    Rejected,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Human-facing summary of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub thread_id: String,
    pub intent: String,
    pub status: SessionStatus,
    pub final_artifact: Option<String>,
    pub safety_score: Option<u8>,
    pub quality_score: Option<u8>,
    pub iteration_count: Option<u32>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields to overwrite on a session; `None` leaves the column alone.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub final_artifact: Option<String>,
    pub safety_score: Option<u8>,
    pub quality_score: Option<u8>,
    pub iteration_count: Option<u32>,
    pub error_message: Option<String>,
}

const SESSION_COLUMNS: &str = "id, thread_id, intent, status, final_artifact, safety_score, quality_score, iteration_count, error_message, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str =
    "thread_id, sequence_no, source, update_json, state_json, pending_stage, digest, created_at";

pub struct FoundryDb {
    conn: Connection,
}

impl FoundryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS checkpoints (
                    thread_id TEXT NOT NULL,
                    sequence_no INTEGER NOT NULL,
                    source TEXT NOT NULL,
                    update_json TEXT NOT NULL,
                    state_json TEXT NOT NULL,
                    pending_stage TEXT,
                    digest TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (thread_id, sequence_no)
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL UNIQUE,
                    intent TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    final_artifact TEXT,
                    safety_score INTEGER,
                    quality_score INTEGER,
                    iteration_count INTEGER,
                    error_message TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Append a checkpoint, rejecting it unless its sequence number is
    /// exactly one past the thread's latest.
    pub fn append_checkpoint(&self, new: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| StoreError::Database(e.into()))?;

        let next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_no) + 1, 0) FROM checkpoints WHERE thread_id = ?1",
                params![new.thread_id],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Database(e.into()))?;
        if new.sequence_no != next as u64 {
            return Err(StoreError::Conflict {
                thread_id: new.thread_id,
                expected: new.sequence_no,
                actual: next as u64,
            });
        }

        let checkpoint = Checkpoint::seal(new)?;
        let source = serde_json::to_string(&checkpoint.source).map_err(StoreError::Encode)?;
        let update = serde_json::to_string(&checkpoint.update).map_err(StoreError::Encode)?;
        let state = serde_json::to_string(&checkpoint.state).map_err(StoreError::Encode)?;
        tx.execute(
            "INSERT INTO checkpoints (thread_id, sequence_no, source, update_json, state_json, pending_stage, digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.thread_id,
                checkpoint.sequence_no as i64,
                source,
                update,
                state,
                checkpoint.pending_stage.map(|s| s.as_str()),
                checkpoint.digest,
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::Database(e.into()))?;
        tx.commit().map_err(|e| StoreError::Database(e.into()))?;
        Ok(checkpoint)
    }

    pub fn latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence_no DESC LIMIT 1",
                    CHECKPOINT_COLUMNS
                ),
                params![thread_id],
                CheckpointRow::from_row,
            )
            .optional()
            .map_err(|e| StoreError::Database(e.into()))?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    pub fn checkpoint_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence_no",
                CHECKPOINT_COLUMNS
            ))
            .map_err(|e| StoreError::Database(e.into()))?;
        let rows = stmt
            .query_map(params![thread_id], CheckpointRow::from_row)
            .map_err(|e| StoreError::Database(e.into()))?;
        let mut history = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StoreError::Database(e.into()))?;
            history.push(row.into_checkpoint()?);
        }
        Ok(history)
    }

    pub fn delete_checkpoints(&self, thread_id: &str) -> Result<usize, StoreError> {
        self.conn
            .execute(
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(|e| StoreError::Database(e.into()))
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, thread_id: &str, intent: &str) -> Result<Session> {
        self.conn
            .execute(
                "INSERT INTO sessions (thread_id, intent) VALUES (?1, ?2)",
                params![thread_id, intent],
            )
            .context("Failed to insert session")?;
        let id = self.conn.last_insert_rowid();
        self.get_session(id)?.context("Session not found after insert")
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    pub fn get_session_by_thread(&self, thread_id: &str) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE thread_id = ?1", SESSION_COLUMNS),
                params![thread_id],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session by thread")?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Newest first, optionally filtered by status.
    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM sessions
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit, offset],
                SessionRow::from_row,
            )
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    pub fn count_sessions(&self, status: Option<SessionStatus>) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE (?1 IS NULL OR status = ?1)",
                params![status.map(|s| s.as_str())],
                |row| row.get(0),
            )
            .context("Failed to count sessions")
    }

    pub fn update_session(&self, id: i64, update: &SessionUpdate) -> Result<Session> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET
                    status = COALESCE(?1, status),
                    final_artifact = COALESCE(?2, final_artifact),
                    safety_score = COALESCE(?3, safety_score),
                    quality_score = COALESCE(?4, quality_score),
                    iteration_count = COALESCE(?5, iteration_count),
                    error_message = COALESCE(?6, error_message),
                    updated_at = datetime('now')
                 WHERE id = ?7",
                params![
                    update.status.map(|s| s.as_str()),
                    update.final_artifact,
                    update.safety_score,
                    update.quality_score,
                    update.iteration_count,
                    update.error_message,
                    id,
                ],
            )
            .context("Failed to update session")?;
        if changed == 0 {
            anyhow::bail!("Session {} not found", id);
        }
        self.get_session(id)?.context("Session not found after update")
    }

    pub fn delete_session(&self, id: i64) -> Result<bool> {
        let Some(session) = self.get_session(id)? else {
            return Ok(false);
        };
        self.delete_session_by_thread(&session.thread_id)
    }

    /// Delete a thread's session row together with its checkpoints.
    pub fn delete_session_by_thread(&self, thread_id: &str) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin delete transaction")?;
        tx.execute(
            "DELETE FROM checkpoints WHERE thread_id = ?1",
            params![thread_id],
        )
        .context("Failed to delete checkpoints")?;
        let removed = tx
            .execute(
                "DELETE FROM sessions WHERE thread_id = ?1",
                params![thread_id],
            )
            .context("Failed to delete session")?;
        tx.commit().context("Failed to commit delete")?;
        Ok(removed > 0)
    }
}

/// Intermediate row struct for checkpoints before decoding the JSON columns.
struct CheckpointRow {
    thread_id: String,
    sequence_no: i64,
    source: String,
    update_json: String,
    state_json: String,
    pending_stage: Option<String>,
    digest: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get(0)?,
            sequence_no: row.get(1)?,
            source: row.get(2)?,
            update_json: row.get(3)?,
            state_json: row.get(4)?,
            pending_stage: row.get(5)?,
            digest: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        let thread_id = self.thread_id;
        let sequence_no = self.sequence_no as u64;
        let corrupt = |message: String| StoreError::Corrupt {
            thread_id: thread_id.clone(),
            sequence_no,
            message,
        };

        let source: StepSource = serde_json::from_str(&self.source)
            .map_err(|e| corrupt(format!("source: {}", e)))?;
        let update = serde_json::from_str(&self.update_json)
            .map_err(|e| corrupt(format!("update: {}", e)))?;
        let state = serde_json::from_str(&self.state_json)
            .map_err(|e| corrupt(format!("state: {}", e)))?;
        let pending_stage = self
            .pending_stage
            .as_deref()
            .map(StageName::from_str)
            .transpose()
            .map_err(corrupt)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(format!("created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            thread_id,
            sequence_no,
            source,
            update,
            state,
            pending_stage,
            digest: self.digest,
            created_at,
        })
    }
}

/// Intermediate row struct for sessions before parsing the status string.
struct SessionRow {
    id: i64,
    thread_id: String,
    intent: String,
    status: String,
    final_artifact: Option<String>,
    safety_score: Option<u8>,
    quality_score: Option<u8>,
    iteration_count: Option<u32>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            intent: row.get(2)?,
            status: row.get(3)?,
            final_artifact: row.get(4)?,
            safety_score: row.get(5)?,
            quality_score: row.get(6)?,
            iteration_count: row.get(7)?,
            error_message: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        Ok(Session {
            id: self.id,
            thread_id: self.thread_id,
            intent: self.intent,
            status,
            final_artifact: self.final_artifact,
            safety_score: self.safety_score,
            quality_score: self.quality_score,
            iteration_count: self.iteration_count,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// `CheckpointStore` backed by the `checkpoints` table.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: DbHandle,
}

impl SqliteCheckpointStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, StoreError> {
        self.db
            .call(move |db| Ok(db.append_checkpoint(checkpoint)))
            .await
            .map_err(StoreError::Database)?
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |db| Ok(db.latest_checkpoint(&thread_id)))
            .await
            .map_err(StoreError::Database)?
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |db| Ok(db.checkpoint_history(&thread_id)))
            .await
            .map_err(StoreError::Database)?
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<usize, StoreError> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |db| Ok(db.delete_checkpoints(&thread_id)))
            .await
            .map_err(StoreError::Database)?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::checkpoint::replay;
    use crate::workflow::{BlackboardState, Note, StateUpdate};

    fn origin(thread_id: &str) -> NewCheckpoint {
        NewCheckpoint {
            thread_id: thread_id.into(),
            sequence_no: 0,
            source: StepSource::Input,
            update: StateUpdate::default(),
            state: BlackboardState::new(thread_id, "Write about sleep"),
            pending_stage: None,
        }
    }

    fn step(prev: &Checkpoint, stage: StageName, pending: Option<StageName>) -> NewCheckpoint {
        let update = StateUpdate::default()
            .with_note(&prev.state, Note::new(stage, format!("{} ran", stage)))
            .stamped(Utc::now());
        NewCheckpoint {
            thread_id: prev.thread_id.clone(),
            sequence_no: prev.sequence_no + 1,
            source: StepSource::Stage(stage),
            state: prev.state.merged(&update),
            update,
            pending_stage: pending,
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('checkpoints', 'sessions')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2, "Expected 2 tables to exist");
        Ok(())
    }

    #[test]
    fn test_append_and_read_checkpoints() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let first = db.append_checkpoint(origin("t-1"))?;
        let second = db.append_checkpoint(step(
            &first,
            StageName::Coordinator,
            Some(StageName::HumanGate),
        ))?;

        let latest = db.latest_checkpoint("t-1")?.expect("latest exists");
        assert_eq!(latest, second);
        assert_eq!(latest.pending_stage, Some(StageName::HumanGate));

        let history = db.checkpoint_history("t-1")?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].source, StepSource::Input);
        assert!(db.latest_checkpoint("other")?.is_none());
        Ok(())
    }

    #[test]
    fn test_out_of_sequence_append_is_conflict() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let first = db.append_checkpoint(origin("t-1"))?;
        db.append_checkpoint(step(&first, StageName::Coordinator, None))?;

        let err = db
            .append_checkpoint(step(&first, StageName::Drafter, None))
            .unwrap_err();
        match err {
            StoreError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected Conflict, got {:?}", other),
        }
        assert_eq!(db.checkpoint_history("t-1")?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_replay_from_stored_history() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let mut last = db.append_checkpoint(origin("t-1"))?;
        for stage in [StageName::Coordinator, StageName::Drafter, StageName::SafetyReviewer] {
            last = db.append_checkpoint(step(&last, stage, None))?;
        }
        let history = db.checkpoint_history("t-1")?;
        let replayed = replay("t-1", &history)?;
        assert_eq!(replayed, last.state);
        Ok(())
    }

    #[test]
    fn test_corrupt_row_is_reported() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        db.append_checkpoint(origin("t-1"))?;
        db.conn.execute(
            "UPDATE checkpoints SET state_json = '{broken' WHERE thread_id = 't-1'",
            [],
        )?;
        assert!(matches!(
            db.latest_checkpoint("t-1"),
            Err(StoreError::Corrupt { sequence_no: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_checkpoints_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("foundry.db");
        {
            let db = FoundryDb::new(&path)?;
            let first = db.append_checkpoint(origin("t-1"))?;
            db.append_checkpoint(step(
                &first,
                StageName::Coordinator,
                Some(StageName::HumanGate),
            ))?;
        }
        let db = FoundryDb::new(&path)?;
        let latest = db.latest_checkpoint("t-1")?.expect("latest survives");
        assert_eq!(latest.sequence_no, 1);
        assert!(latest.is_paused());
        Ok(())
    }

    #[test]
    fn test_session_lifecycle() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let session = db.create_session("t-1", "Write about sleep")?;
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.final_artifact.is_none());

        let updated = db.update_session(
            session.id,
            &SessionUpdate {
                status: Some(SessionStatus::Approved),
                final_artifact: Some("final text".into()),
                safety_score: Some(91),
                quality_score: Some(77),
                iteration_count: Some(2),
                ..SessionUpdate::default()
            },
        )?;
        assert_eq!(updated.status, SessionStatus::Approved);
        assert_eq!(updated.final_artifact.as_deref(), Some("final text"));
        assert_eq!(updated.safety_score, Some(91));

        // A sparse update leaves other columns alone.
        let again = db.update_session(
            session.id,
            &SessionUpdate {
                error_message: Some("note".into()),
                ..SessionUpdate::default()
            },
        )?;
        assert_eq!(again.final_artifact.as_deref(), Some("final text"));
        assert_eq!(
            db.get_session_by_thread("t-1")?.map(|s| s.id),
            Some(session.id)
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_thread_session_is_rejected() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        db.create_session("t-1", "a")?;
        assert!(db.create_session("t-1", "b").is_err());
        Ok(())
    }

    #[test]
    fn test_update_missing_session_fails() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        assert!(db.update_session(42, &SessionUpdate::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_list_and_count_sessions_by_status() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        for i in 0..5 {
            let s = db.create_session(&format!("t-{}", i), "intent")?;
            if i % 2 == 0 {
                db.update_session(
                    s.id,
                    &SessionUpdate {
                        status: Some(SessionStatus::PendingReview),
                        ..SessionUpdate::default()
                    },
                )?;
            }
        }
        assert_eq!(db.count_sessions(None)?, 5);
        assert_eq!(db.count_sessions(Some(SessionStatus::PendingReview))?, 3);

        let page = db.list_sessions(None, 0, 2)?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].thread_id, "t-4");

        let pending = db.list_sessions(Some(SessionStatus::PendingReview), 0, 50)?;
        assert!(pending.iter().all(|s| s.status == SessionStatus::PendingReview));
        assert_eq!(pending.len(), 3);
        Ok(())
    }

    #[test]
    fn test_delete_session_removes_checkpoints() -> Result<()> {
        let db = FoundryDb::new_in_memory()?;
        let session = db.create_session("t-1", "intent")?;
        db.append_checkpoint(origin("t-1"))?;

        assert!(db.delete_session(session.id)?);
        assert!(db.get_session(session.id)?.is_none());
        assert!(db.checkpoint_history("t-1")?.is_empty());
        assert!(!db.delete_session(session.id)?);
        assert!(!db.delete_session_by_thread("t-1")?);
        Ok(())
    }

    #[test]
    fn test_session_status_parses() {
        assert_eq!(
            "pending_review".parse::<SessionStatus>(),
            Ok(SessionStatus::PendingReview)
        );
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[tokio::test]
    async fn test_sqlite_store_through_handle() {
        let handle = DbHandle::new(FoundryDb::new_in_memory().unwrap());
        let store = SqliteCheckpointStore::new(handle);
        let first = store.append(origin("t-1")).await.unwrap();
        let second = store
            .apply_external_update(
                "t-1",
                StateUpdate::default().stamped(Utc::now()),
                StageName::HumanGate,
            )
            .await
            .unwrap();
        assert_eq!(second.sequence_no, first.sequence_no + 1);
        assert_eq!(second.source, StepSource::External(StageName::HumanGate));
        assert_eq!(store.history("t-1").await.unwrap().len(), 2);
        assert_eq!(store.delete_thread("t-1").await.unwrap(), 2);
        assert!(store.latest("t-1").await.unwrap().is_none());
    }
}
