//! Control messages between the page and the supervisor.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Page → supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate the installed generation without waiting for old clients.
    SkipWaiting,
}

impl WorkerMessage {
    /// Parse a wire message. Unrecognized shapes yield `None`.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Supervisor → every open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// First install finished populating the critical cache.
    SwInstalled { message: String },
}

/// Best-effort broadcast to however many pages are listening.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    tx: broadcast::Sender<ClientMessage>,
}

impl ClientChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it;
    /// zero listeners is not an error.
    pub fn publish(&self, message: ClientMessage) -> usize {
        match self.tx.send(message) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No clients listening for broadcast");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
        self.tx.subscribe()
    }
}

impl Default for ClientChannel {
    fn default() -> Self {
        Self::new(16)
    }
}
