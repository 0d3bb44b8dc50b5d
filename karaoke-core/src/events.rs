//! Process-wide push channel for session notifications.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

/// One notification, serialized as `{"event": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Progress {
        track_id: String,
        progress: u8,
        stage: String,
    },
    FirstChunk {
        track_id: String,
        url: String,
    },
    ChunkUpdated {
        track_id: String,
        url: String,
        chunk: usize,
    },
    Complete {
        track_id: String,
        url: String,
    },
    Error {
        track_id: String,
        error: String,
    },
}

impl SessionEvent {
    pub fn track_id(&self) -> &str {
        match self {
            SessionEvent::Progress { track_id, .. }
            | SessionEvent::FirstChunk { track_id, .. }
            | SessionEvent::ChunkUpdated { track_id, .. }
            | SessionEvent::Complete { track_id, .. }
            | SessionEvent::Error { track_id, .. } => track_id,
        }
    }
}

/// Fan-out to every live subscriber. Subscribers whose receiver was dropped
/// are pruned on the next publish.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
