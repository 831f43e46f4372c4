//! Room registry
//!
//! Maps room identifiers to the connections currently joined to them.
//! A room exists exactly while it has at least one member: it is created by
//! the first join and removed by the last leave.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ConnectionId, PeerHandle};

/// Room identifier, taken verbatim from the connection request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Default)]
struct Rooms {
    /// Members of each non-empty room
    rooms: HashMap<RoomId, HashMap<ConnectionId, PeerHandle>>,
    /// Reverse index: the single room each connection belongs to
    memberships: HashMap<ConnectionId, RoomId>,
}

impl Rooms {
    fn remove_member(&mut self, room_id: &RoomId, id: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            self.rooms.remove(room_id);
            debug!("Room {} is empty, removed", room_id);
        }
        if removed && self.memberships.get(&id) == Some(room_id) {
            self.memberships.remove(&id);
        }
        removed
    }
}

/// Concurrency-safe registry of rooms and their members
///
/// Locks are held only while the maps are read or mutated, never while
/// sending to a peer. Broadcasts iterate over a [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: RwLock<Rooms>,
}

impl RoomRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed
    ///
    /// A connection belongs to at most one room; joining a second room moves it.
    pub async fn join(&self, room_id: &RoomId, peer: PeerHandle) {
        let id = peer.id();
        let mut inner = self.inner.write().await;

        if let Some(previous) = inner.memberships.get(&id).cloned() {
            if &previous != room_id {
                warn!(
                    "Connection {} joined room {} while in room {}, moving it",
                    id, room_id, previous
                );
                inner.remove_member(&previous, id);
            }
        }

        inner
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(id, peer);
        inner.memberships.insert(id, room_id.clone());
        debug!("Connection {} joined room {}", id, room_id);
    }

    /// Remove a connection from a room; absent rooms or members are ignored
    pub async fn leave(&self, room_id: &RoomId, id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if inner.remove_member(room_id, id) {
            debug!("Connection {} left room {}", id, room_id);
        }
    }

    /// Point-in-time copy of a room's members (empty if the room is absent)
    pub async fn snapshot(&self, room_id: &RoomId) -> Vec<PeerHandle> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Number of members in a room
    pub async fn member_count(&self, room_id: &RoomId) -> usize {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).map_or(0, |members| members.len())
    }

    /// Identifiers of all current rooms
    pub async fn room_ids(&self) -> Vec<RoomId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<RoomId> = inner.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The room a connection currently belongs to
    pub async fn room_of(&self, id: ConnectionId) -> Option<RoomId> {
        self.inner.read().await.memberships.get(&id).cloned()
    }
}
