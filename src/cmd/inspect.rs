//! Read-only views of threads and sessions, plus `foundry delete`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use foundry::config::FoundryConfig;
use foundry::db::SessionStatus;
use foundry::llm::OfflineGenerator;
use foundry::server::{SharedState, open_state};
use foundry::ui::icons::{CHECK, CROSS};
use foundry::ui::progress::print_draft;
use foundry::workflow::StepSource;

fn open_read_only(project_dir: &Path) -> Result<SharedState> {
    let config = FoundryConfig::new(project_dir.to_path_buf())?;
    open_state(&config, Arc::new(OfflineGenerator))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn source_label(source: &StepSource) -> String {
    match source {
        StepSource::Input => "input".to_string(),
        StepSource::Stage(stage) => stage.to_string(),
        StepSource::External(stage) => format!("{} (external)", stage),
    }
}

pub async fn cmd_state(project_dir: &Path, thread_id: &str, json: bool) -> Result<()> {
    let state = open_read_only(project_dir)?;
    let snapshot = state.engine.get_state(thread_id).await?;
    if json {
        return print_json(&snapshot);
    }

    let board = &snapshot.state;
    println!();
    println!("Thread {}", style(&snapshot.thread_id).bold());
    println!("  status:      {}", snapshot.status);
    println!("  checkpoint:  #{}", snapshot.sequence_no);
    if let Some(stage) = snapshot.pending_stage {
        println!("  waiting for: {}", stage);
    }
    println!("  intent:      {}", board.intent);
    println!(
        "  iterations:  {}   safety: {}   quality: {}",
        board.iteration_count, board.safety_score, board.quality_score
    );
    if !board.revision_instructions.is_empty() {
        println!("  revisions:   {}", board.revision_instructions);
    }
    if let Some(reason) = state.engine.failure(thread_id)? {
        println!("  failure:     {}", style(reason).red());
    }
    print_draft(&board.current_draft);
    println!();
    Ok(())
}

pub async fn cmd_history(project_dir: &Path, thread_id: &str, json: bool) -> Result<()> {
    let state = open_read_only(project_dir)?;
    let history = state.engine.history(thread_id).await?;
    if json {
        return print_json(&history);
    }

    println!();
    println!(
        "{:>4}  {:<28} {:<10} {:>5} {:>6} {:>7}  {}",
        "seq", "source", "status", "iter", "safety", "quality", "digest"
    );
    for checkpoint in &history {
        let board = &checkpoint.state;
        let mut source = source_label(&checkpoint.source);
        if let Some(pending) = checkpoint.pending_stage {
            source = format!("{} -> {}?", source, pending);
        }
        println!(
            "{:>4}  {:<28} {:<10} {:>5} {:>6} {:>7}  {}",
            checkpoint.sequence_no,
            source,
            board.status.as_str(),
            board.iteration_count,
            board.safety_score,
            board.quality_score,
            &checkpoint.digest[..checkpoint.digest.len().min(12)]
        );
    }
    println!();
    Ok(())
}

/// Rebuild the thread's state from its updates and compare it with the
/// stored head.
pub async fn cmd_replay(project_dir: &Path, thread_id: &str) -> Result<()> {
    let state = open_read_only(project_dir)?;
    let replayed = state.engine.replay(thread_id).await?;
    // Compare against the stored head, not the snapshot, which marks failed
    // runs on top of the last good state.
    let history = state.engine.history(thread_id).await?;
    let Some(head) = history.last() else {
        anyhow::bail!("Thread {} has no checkpoints", thread_id);
    };

    println!();
    if replayed == head.state {
        println!(
            "{}Replayed {} checkpoints; state matches #{}",
            CHECK,
            history.len(),
            head.sequence_no
        );
        Ok(())
    } else {
        println!(
            "{}{}",
            CROSS,
            style("Replayed state differs from the stored head").red()
        );
        anyhow::bail!("Replay of {} diverged", thread_id)
    }
}

pub async fn cmd_sessions(project_dir: &Path, status: Option<&str>, limit: i64) -> Result<()> {
    let state = open_read_only(project_dir)?;
    let status = status
        .map(SessionStatus::from_str)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let sessions = state
        .db
        .call(move |db| db.list_sessions(status, 0, limit))
        .await?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!();
    println!(
        "{:>5}  {:<15} {:<36}  {:<20}  {}",
        "id", "status", "thread", "updated", "intent"
    );
    for session in sessions {
        let intent: String = session.intent.chars().take(48).collect();
        println!(
            "{:>5}  {:<15} {:<36}  {:<20}  {}",
            session.id,
            session.status.as_str(),
            session.thread_id,
            session.updated_at,
            intent
        );
    }
    println!();
    Ok(())
}

/// Remove a thread's checkpoints and its session row.
pub async fn cmd_delete(project_dir: &Path, thread_id: &str) -> Result<()> {
    let state = open_read_only(project_dir)?;
    let removed = state.engine.delete_thread(thread_id).await?;
    let session_removed = {
        let thread_id = thread_id.to_string();
        state
            .db
            .call(move |db| db.delete_session_by_thread(&thread_id))
            .await?
    };
    if removed == 0 && !session_removed {
        anyhow::bail!("Thread not found: {}", thread_id);
    }
    println!(
        "Deleted {} ({} checkpoints{})",
        thread_id,
        removed,
        if session_removed { ", session" } else { "" }
    );
    Ok(())
}
