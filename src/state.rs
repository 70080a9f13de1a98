//! Shared application state.
//!
//! Rooms run as independent message loops; the shared state only holds the
//! registry of their command senders plus the process-wide services every
//! handler needs.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::handlers::RoomHandle;
use crate::store::Store;

/// Global application state.
pub struct AppState {
    /// Room registry (room_id -> command channel of the room's loop).
    pub rooms: DashMap<String, RoomHandle>,
    /// File-backed persistence.
    pub store: Arc<Store>,
    /// Configuration.
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        Self {
            rooms: DashMap::new(),
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }

    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }
}
