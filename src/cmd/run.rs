//! Foreground drafting runs: `foundry run` and `foundry review`.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use foundry::config::FoundryConfig;
use foundry::db::{SessionStatus, SessionUpdate};
use foundry::errors::EngineError;
use foundry::llm::build_generator;
use foundry::server::{SharedState, open_state, sessions};
use foundry::ui::RunUI;
use foundry::ui::progress::{print_outcome, print_review_summary};
use foundry::workflow::{
    EngineStatus, HumanDecision, Recovery, ReviewAction, RunHandle, RunOutcome, WorkflowEvent,
};

/// How pauses at the review gate are answered.
#[derive(Debug, Clone, Copy)]
pub enum ReviewMode {
    /// Ask on the terminal.
    Prompt,
    /// Approve every draft without asking.
    AutoApprove,
    /// Leave the next pause for a later `foundry review`.
    StopAtPause,
}

pub async fn cmd_run(
    project_dir: &Path,
    intent: &str,
    max_iterations: Option<u32>,
    mode: ReviewMode,
    verbose: bool,
) -> Result<()> {
    let intent = intent.trim();
    if intent.is_empty() {
        bail!("Intent must not be empty");
    }
    let config =
        FoundryConfig::with_cli_args(project_dir.to_path_buf(), max_iterations, None, None)?;
    let generator = build_generator(&config.toml.llm)?;
    let state = open_state(&config, generator)?;

    let thread_id = Uuid::new_v4().to_string();
    let session = {
        let thread_id = thread_id.clone();
        let intent = intent.to_string();
        state
            .db
            .call(move |db| db.create_session(&thread_id, &intent))
            .await?
    };

    println!();
    println!("{}", style("Foundry").bold().cyan());
    println!("  thread:  {}", thread_id);
    println!("  session: {}", session.id);
    println!();

    let mut rx = state.engine.subscribe(&thread_id)?;
    let handle = match state.engine.start_thread(&thread_id, intent).await {
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
    info!(thread_id = %thread_id, "run started");

    drive(&state, &config, &thread_id, handle, &mut rx, mode, verbose).await
}

/// Answer the review gate of an existing thread, or restart one that stopped
/// mid-flight.
pub async fn cmd_review(
    project_dir: &Path,
    thread_id: &str,
    action: Option<&str>,
    feedback: Option<&str>,
    edits_file: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let config = FoundryConfig::new(project_dir.to_path_buf())?;
    let generator = build_generator(&config.toml.llm)?;
    let state = open_state(&config, generator)?;

    let mut rx = state.engine.subscribe(thread_id)?;
    let status = state.engine.status(thread_id).await?;
    let handle = match status {
        EngineStatus::PausedAtHumanGate => {
            let snapshot = state.engine.get_state(thread_id).await?;
            print_review_summary(&snapshot.state);
            let decision = match action {
                Some(action) => decision_from_args(action, feedback, edits_file)?,
                None => prompt_decision()?,
            };
            resume(&state, thread_id, decision).await?
        }
        EngineStatus::NotStarted => {
            state.engine.unsubscribe(thread_id, rx);
            return Err(EngineError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            }
            .into());
        }
        _ => match state.engine.recover(thread_id).await? {
            Recovery::Resumed(handle) => {
                println!("Restarting {} from its last checkpoint.", thread_id);
                let update = SessionUpdate {
                    status: Some(SessionStatus::Running),
                    ..SessionUpdate::default()
                };
                sessions::record(&state.db, thread_id, update).await?;
                handle
            }
            Recovery::AlreadyTerminal(status) => {
                println!("Thread {} already finished: {}", thread_id, status);
                return Ok(());
            }
        },
    };

    // A scripted review stops at the next pause instead of answering it.
    let mode = match action {
        Some(_) => ReviewMode::StopAtPause,
        None => ReviewMode::Prompt,
    };
    drive(&state, &config, thread_id, handle, &mut rx, mode, verbose).await
}

async fn resume(state: &SharedState, thread_id: &str, decision: HumanDecision) -> Result<RunHandle> {
    let action = decision.action;
    let handle = state.engine.resume(thread_id, decision).await?;
    sessions::record(&state.db, thread_id, sessions::after_decision(action)).await?;
    info!(thread_id = %thread_id, action = action.as_str(), "review submitted");
    Ok(handle)
}

/// Follow a thread in the foreground, answering each pause per `mode`, until
/// it finishes or a scripted review reaches its next pause.
async fn drive(
    state: &SharedState,
    config: &FoundryConfig,
    thread_id: &str,
    mut handle: RunHandle,
    rx: &mut broadcast::Receiver<WorkflowEvent>,
    mode: ReviewMode,
    verbose: bool,
) -> Result<()> {
    loop {
        let ui = RunUI::new(config.workflow().max_iterations, verbose);
        let result = follow(&ui, rx, handle).await;
        ui.finish();
        sessions::record(&state.db, thread_id, sessions::outcome_update(&result)).await?;

        match result? {
            RunOutcome::Paused { checkpoint } => {
                print_review_summary(&checkpoint.state);
                let decision = match mode {
                    ReviewMode::Prompt => prompt_decision()?,
                    ReviewMode::AutoApprove => {
                        println!("  {} (--yes flag)", style("Auto-approved").dim());
                        HumanDecision::approve()
                    }
                    ReviewMode::StopAtPause => {
                        println!();
                        println!(
                            "Waiting for review. Run 'foundry review {}' to continue.",
                            thread_id
                        );
                        return Ok(());
                    }
                };
                handle = resume(state, thread_id, decision).await?;
            }
            RunOutcome::Finished { status, checkpoint } => {
                print_outcome(status, &checkpoint.state);
                return match status {
                    EngineStatus::TerminalFailed => {
                        let reason = state
                            .engine
                            .failure(thread_id)?
                            .unwrap_or_else(|| "unknown failure".to_string());
                        bail!("Run {} failed: {}", thread_id, reason)
                    }
                    _ => Ok(()),
                };
            }
        }
    }
}

/// Forward engine events to the UI until the driver settles.
async fn follow(
    ui: &RunUI,
    rx: &mut broadcast::Receiver<WorkflowEvent>,
    handle: RunHandle,
) -> Result<RunOutcome, EngineError> {
    let wait = handle.wait();
    tokio::pin!(wait);
    loop {
        tokio::select! {
            result = &mut wait => {
                while let Ok(event) = rx.try_recv() {
                    ui.handle_event(&event);
                }
                return result;
            }
            event = rx.recv() => match event {
                Ok(event) => ui.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return (&mut wait).await,
            }
        }
    }
}

fn prompt_decision() -> Result<HumanDecision> {
    let options = &[
        "Approve this draft",
        "Send it back with feedback",
        "Cancel the run",
    ];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How should this draft proceed?")
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(HumanDecision::approve()),
        1 => {
            let feedback: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("What should change?")
                .interact_text()?;
            Ok(HumanDecision::reject(feedback, None))
        }
        2 => Ok(HumanDecision::cancel()),
        _ => unreachable!(),
    }
}

fn decision_from_args(
    action: &str,
    feedback: Option<&str>,
    edits_file: Option<&Path>,
) -> Result<HumanDecision> {
    let action = ReviewAction::from_str(action).map_err(anyhow::Error::msg)?;
    let edits = edits_file
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read edits from {}", path.display()))
        })
        .transpose()?;
    Ok(HumanDecision {
        action,
        edits,
        feedback: feedback.map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_args_reads_edits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edits.md");
        std::fs::write(&path, "revised text").unwrap();

        let decision = decision_from_args("reject", Some("shorter"), Some(&path)).unwrap();
        assert_eq!(decision.action, ReviewAction::Reject);
        assert_eq!(decision.edits(), Some("revised text"));
        assert_eq!(decision.feedback(), Some("shorter"));
    }

    #[test]
    fn test_decision_from_args_rejects_unknown_action() {
        let err = decision_from_args("publish", None, None).unwrap_err();
        assert!(err.to_string().contains("Invalid review action"));
    }
}
