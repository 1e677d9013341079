//! Message bridge: the only place the core writes into chat history.
//!
//! The history itself belongs to the host. The live engine calls the bridge
//! for every transcript delta and once per completed turn.

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::events::{ChatEntry, TranscriptDirection};

/// Host-side sink for live-session output.
pub trait MessageBridge: Send + Sync + 'static {
    /// Live display of a partial transcript. `text` is the delta.
    fn on_transcript_delta(&self, direction: TranscriptDirection, text: &str);

    /// A turn finished: one user entry followed by one assistant entry.
    fn on_turn_complete(&self, user: ChatEntry, assistant: ChatEntry);
}

/// Bridge that records entries in memory and re-broadcasts them.
///
/// Useful for hosts that consume history asynchronously, and for tests.
pub struct HistoryBridge {
    history: Mutex<Vec<ChatEntry>>,
    deltas: Mutex<Vec<(TranscriptDirection, String)>>,
    entry_tx: broadcast::Sender<ChatEntry>,
}

impl HistoryBridge {
    pub fn new() -> Self {
        let (entry_tx, _) = broadcast::channel(64);
        Self {
            history: Mutex::new(Vec::new()),
            deltas: Mutex::new(Vec::new()),
            entry_tx,
        }
    }

    /// Snapshot of every entry emitted so far.
    pub fn history(&self) -> Vec<ChatEntry> {
        self.history.lock().clone()
    }

    /// Every delta seen so far, in arrival order.
    pub fn deltas(&self) -> Vec<(TranscriptDirection, String)> {
        self.deltas.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEntry> {
        self.entry_tx.subscribe()
    }
}

impl Default for HistoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBridge for HistoryBridge {
    fn on_transcript_delta(&self, direction: TranscriptDirection, text: &str) {
        self.deltas.lock().push((direction, text.to_owned()));
    }

    fn on_turn_complete(&self, user: ChatEntry, assistant: ChatEntry) {
        {
            let mut history = self.history.lock();
            history.push(user.clone());
            history.push(assistant.clone());
        }
        let _ = self.entry_tx.send(user);
        let _ = self.entry_tx.send(assistant);
    }
}
