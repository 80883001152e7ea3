use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use crate::stages::preview;
use crate::workflow::{
    DraftStatus, EngineStatus, Note, SafetyFlag, StageName, ThreadSnapshot, WorkflowEvent,
};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Drafts in step updates are cut to this many characters.
pub const DRAFT_PREVIEW_CHARS: usize = 500;

/// Step updates carry only the newest notes.
pub const RECENT_NOTES: usize = 5;

// ── Stream message types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    InitialState {
        snapshot: Box<ThreadSnapshot>,
    },
    StateUpdate {
        thread_id: String,
        sequence_no: u64,
        stage: StageName,
        status: DraftStatus,
        draft: String,
        draft_truncated: bool,
        safety_score: u8,
        quality_score: u8,
        iteration_count: u32,
        recent_notes: Vec<Note>,
    },
    Paused {
        thread_id: String,
        sequence_no: u64,
        pending_stage: StageName,
        draft: String,
        safety_score: u8,
        quality_score: u8,
        safety_flags: Vec<SafetyFlag>,
        iteration_count: u32,
    },
    Terminal {
        thread_id: String,
        sequence_no: u64,
        status: EngineStatus,
        final_draft: String,
        safety_score: u8,
        quality_score: u8,
        iteration_count: u32,
    },
    Error {
        thread_id: String,
        message: String,
    },
}

impl StreamMessage {
    /// Transport view of an engine event. Step updates are trimmed; pause
    /// and terminal messages carry the full draft.
    pub fn from_event(event: &WorkflowEvent) -> Self {
        match event {
            WorkflowEvent::StateUpdate {
                thread_id,
                sequence_no,
                stage,
                state,
            } => {
                let draft = preview(&state.current_draft, DRAFT_PREVIEW_CHARS);
                let skip = state.scratchpad.len().saturating_sub(RECENT_NOTES);
                Self::StateUpdate {
                    thread_id: thread_id.clone(),
                    sequence_no: *sequence_no,
                    stage: *stage,
                    status: state.status,
                    draft_truncated: draft != state.current_draft,
                    draft,
                    safety_score: state.safety_score,
                    quality_score: state.quality_score,
                    iteration_count: state.iteration_count,
                    recent_notes: state.scratchpad[skip..].to_vec(),
                }
            }
            WorkflowEvent::Paused {
                thread_id,
                sequence_no,
                pending_stage,
                state,
            } => Self::Paused {
                thread_id: thread_id.clone(),
                sequence_no: *sequence_no,
                pending_stage: *pending_stage,
                draft: state.current_draft.clone(),
                safety_score: state.safety_score,
                quality_score: state.quality_score,
                safety_flags: state.safety_flags.clone(),
                iteration_count: state.iteration_count,
            },
            WorkflowEvent::Terminal {
                thread_id,
                sequence_no,
                status,
                state,
            } => Self::Terminal {
                thread_id: thread_id.clone(),
                sequence_no: *sequence_no,
                status: *status,
                final_draft: state.current_draft.clone(),
                safety_score: state.safety_score,
                quality_score: state.quality_score,
                iteration_count: state.iteration_count,
            },
            WorkflowEvent::Error { thread_id, message } => Self::Error {
                thread_id: thread_id.clone(),
                message: message.clone(),
            },
        }
    }

    fn to_text(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                warn!("failed to serialize stream message: {}", e);
                None
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(thread_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, thread_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, thread_id: String) {
    let (mut sender, receiver) = socket.split();

    // Subscribe before reading the snapshot so no step falls in between.
    let rx = match state.engine.subscribe(&thread_id) {
        Ok(rx) => rx,
        Err(e) => {
            send_error(&mut sender, &thread_id, e.to_string()).await;
            return;
        }
    };
    let initial = match state.engine.get_state(&thread_id).await {
        Ok(snapshot) => StreamMessage::InitialState {
            snapshot: Box::new(snapshot),
        },
        Err(e) => {
            state.engine.unsubscribe(&thread_id, rx);
            send_error(&mut sender, &thread_id, e.to_string()).await;
            return;
        }
    };
    let finished = matches!(&initial, StreamMessage::InitialState { snapshot } if snapshot.status.is_terminal());
    let sent = match initial.to_text() {
        Some(msg) => sender.send(msg).await.is_ok(),
        None => true,
    };
    if !sent || finished {
        state.engine.unsubscribe(&thread_id, rx);
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let rx = run_socket_loop(sender, receiver, rx).await;
    state.engine.unsubscribe(&thread_id, rx);
    debug!(thread_id = %thread_id, "stream closed");
}

async fn send_error(sender: &mut SplitSink<WebSocket, Message>, thread_id: &str, message: String) {
    let error = StreamMessage::Error {
        thread_id: thread_id.to_string(),
        message,
    };
    if let Some(msg) = error.to_text() {
        let _ = sender.send(msg).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Core WebSocket loop with ping/pong keepalive. Hands the receiver back
/// so the caller can release the thread's channel.
///
/// Forwards engine events until the thread reaches a terminal event, the
/// client goes away, or no Pong arrives within [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<WorkflowEvent>,
) -> broadcast::Receiver<WorkflowEvent> {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let message = StreamMessage::from_event(&event);
                        if let Some(msg) = message.to_text()
                            && sender.send(msg).await.is_err()
                        {
                            break;
                        }
                        if matches!(event, WorkflowEvent::Terminal { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "stream listener lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
    rx
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::BlackboardState;

    fn state_with_draft(draft: &str, notes: usize) -> Box<BlackboardState> {
        let mut state = BlackboardState::new("t-1", "intent");
        state.current_draft = draft.to_string();
        for i in 0..notes {
            state
                .scratchpad
                .push(Note::new(StageName::Coordinator, format!("note {}", i)));
        }
        Box::new(state)
    }

    #[test]
    fn test_state_update_truncates_draft_and_notes() {
        let long = "x".repeat(DRAFT_PREVIEW_CHARS + 40);
        let event = WorkflowEvent::StateUpdate {
            thread_id: "t-1".into(),
            sequence_no: 3,
            stage: StageName::Drafter,
            state: state_with_draft(&long, 8),
        };
        match StreamMessage::from_event(&event) {
            StreamMessage::StateUpdate {
                draft,
                draft_truncated,
                recent_notes,
                ..
            } => {
                assert!(draft_truncated);
                assert_eq!(draft.chars().count(), DRAFT_PREVIEW_CHARS + 3);
                assert_eq!(recent_notes.len(), RECENT_NOTES);
                assert_eq!(recent_notes[0].message, "note 3");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_short_draft_is_not_marked_truncated() {
        let event = WorkflowEvent::StateUpdate {
            thread_id: "t-1".into(),
            sequence_no: 1,
            stage: StageName::Drafter,
            state: state_with_draft("short", 2),
        };
        match StreamMessage::from_event(&event) {
            StreamMessage::StateUpdate {
                draft,
                draft_truncated,
                recent_notes,
                ..
            } => {
                assert_eq!(draft, "short");
                assert!(!draft_truncated);
                assert_eq!(recent_notes.len(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_paused_carries_full_draft() {
        let long = "y".repeat(DRAFT_PREVIEW_CHARS * 2);
        let event = WorkflowEvent::Paused {
            thread_id: "t-1".into(),
            sequence_no: 5,
            pending_stage: StageName::HumanGate,
            state: state_with_draft(&long, 1),
        };
        let json = serde_json::to_value(StreamMessage::from_event(&event)).unwrap();
        assert_eq!(json["type"], "paused");
        assert_eq!(json["data"]["pending_stage"], "human_gate");
        assert_eq!(json["data"]["draft"].as_str().unwrap().len(), long.len());
    }

    #[test]
    fn test_terminal_serialization() {
        let event = WorkflowEvent::Terminal {
            thread_id: "t-1".into(),
            sequence_no: 9,
            status: EngineStatus::TerminalApproved,
            state: state_with_draft("done", 0),
        };
        let json = serde_json::to_value(StreamMessage::from_event(&event)).unwrap();
        assert_eq!(json["type"], "terminal");
        assert_eq!(json["data"]["status"], "terminal_approved");
        assert_eq!(json["data"]["final_draft"], "done");
    }
}
