//! Per-thread fan-out of engine progress to live listeners.
//!
//! Publishing never waits: each thread has a bounded `tokio::sync::broadcast`
//! channel, and a listener that falls behind simply misses events (it sees
//! `RecvError::Lagged`). The checkpoint store stays the source of truth.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use super::engine::EngineStatus;
use super::stage::StageName;
use super::state::BlackboardState;
use crate::errors::EngineError;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 32;

/// Events yielded by the engine. States are always full and untruncated.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StateUpdate {
        thread_id: String,
        sequence_no: u64,
        stage: StageName,
        state: Box<BlackboardState>,
    },
    Paused {
        thread_id: String,
        sequence_no: u64,
        pending_stage: StageName,
        state: Box<BlackboardState>,
    },
    Terminal {
        thread_id: String,
        sequence_no: u64,
        status: EngineStatus,
        state: Box<BlackboardState>,
    },
    Error {
        thread_id: String,
        message: String,
    },
}

impl WorkflowEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            Self::StateUpdate { thread_id, .. }
            | Self::Paused { thread_id, .. }
            | Self::Terminal { thread_id, .. }
            | Self::Error { thread_id, .. } => thread_id,
        }
    }

    /// Paused, terminal and error events end a driver's run.
    pub fn ends_run(&self) -> bool {
        !matches!(self, Self::StateUpdate { .. })
    }
}

#[derive(Debug)]
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<WorkflowEvent>>>,
    capacity: usize,
    max_subscribers: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_SUBSCRIBERS)
    }
}

impl EventHub {
    pub fn new(capacity: usize, max_subscribers: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            max_subscribers,
        }
    }

    pub fn subscribe(
        &self,
        thread_id: &str,
    ) -> Result<broadcast::Receiver<WorkflowEvent>, EngineError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|e| anyhow::anyhow!("event hub lock poisoned: {}", e))?;
        let capacity = self.capacity;
        let tx = channels
            .entry(thread_id.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        if tx.receiver_count() >= self.max_subscribers {
            return Err(EngineError::TooManySubscribers {
                thread_id: thread_id.to_string(),
                limit: self.max_subscribers,
            });
        }
        Ok(tx.subscribe())
    }

    /// Deliver `event` to the thread's current listeners. Returns how many
    /// receivers were handed the event.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        let Ok(mut channels) = self.channels.lock() else {
            tracing::warn!("event hub lock poisoned, dropping event");
            return 0;
        };
        let thread_id = event.thread_id().to_string();
        let Some(tx) = channels.get(&thread_id) else {
            return 0;
        };
        if tx.receiver_count() == 0 {
            channels.remove(&thread_id);
            return 0;
        }
        tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self, thread_id: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(thread_id).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Forget the thread's channel if nobody listens on it. Returns whether
    /// it was removed.
    pub fn release(&self, thread_id: &str) -> bool {
        let Ok(mut channels) = self.channels.lock() else {
            return false;
        };
        if channels
            .get(thread_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(thread_id);
            return true;
        }
        false
    }

    /// Threads that currently have a channel.
    pub fn thread_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Drop the thread's channel. Listeners drain what they have and then
    /// see the channel closed.
    pub fn close(&self, thread_id: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(thread_id);
        }
    }
}
