//! Request routing
//!
//! Maps request paths onto the relay's two endpoints: the room WebSocket at
//! `/ws/{room_id}` and the `/health` status query. Paths are matched after
//! percent-decoding, so `/ws/my%20room` joins room `my room` and an encoded
//! slash (`/ws/a%2Fb`) does not match a single room segment.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::room::RoomId;

/// Path prefix of the room WebSocket endpoint
pub const ROOM_PREFIX: &str = "/ws/";

/// Path of the health endpoint
pub const HEALTH_PATH: &str = "/health";

/// Destination of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// WebSocket upgrade into a room
    Room(RoomId),
    /// Health/status query
    Health,
    NotFound,
}

impl Route {
    /// Route a request target; any query string is ignored
    pub fn parse(target: &str) -> Self {
        let raw_path = target.split(['?', '#']).next().unwrap_or_default();
        let Ok(path) = percent_decode_str(raw_path).decode_utf8() else {
            return Route::NotFound;
        };

        if path == HEALTH_PATH {
            return Route::Health;
        }

        match path.strip_prefix(ROOM_PREFIX) {
            Some(room) if !room.is_empty() && !room.contains('/') => {
                Route::Room(RoomId::new(room))
            }
            _ => Route::NotFound,
        }
    }
}

/// Body of the health response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Number of rooms with at least one member
    pub rooms: usize,
}

impl HealthStatus {
    pub fn ok(rooms: usize) -> Self {
        Self {
            status: "ok".to_string(),
            rooms,
        }
    }
}
