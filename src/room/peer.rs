//! Peer handles
//!
//! A `PeerHandle` is the registry's reference to one live connection. Sending
//! through it enqueues onto that connection's outbound queue, which is drained
//! by a single writer task so writes to one socket are always serialized.

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default capacity of a connection's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors that can occur when sending to a peer
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {0} is closed")]
    Closed(ConnectionId),
}

/// Result type for peer operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Unique identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque message relayed between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Length of the payload in bytes
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short printable form for log lines, at most `max_chars` characters.
    ///
    /// Binary payloads are summarized by size only.
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Payload::Text(text) => match text.char_indices().nth(max_chars) {
                Some((end, _)) => text[..end].to_string(),
                None => text.clone(),
            },
            Payload::Binary(data) => format!("<{} bytes binary>", data.len()),
        }
    }
}

/// Handle used to deliver payloads to one connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Payload>,
}

impl PeerHandle {
    /// Create a handle together with the receiving end of its outbound queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection's writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a payload for delivery, waiting for space if the queue is full
    pub async fn send(&self, payload: Payload) -> PeerResult<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| PeerError::Closed(self.id))
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerHandle {}

impl Hash for PeerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
