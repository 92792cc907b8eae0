// Lazy room registry with per-room configuration overrides.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::RouterConfig;
use crate::room::Room;

struct Inner {
    base: RouterConfig,
    overrides: HashMap<String, RouterConfig>,
    rooms: HashMap<String, Arc<Room>>,
}

/// Thread-safe name-to-room map. Rooms are created on first reference and
/// kept for the life of the process; an empty room is a few hundred bytes.
pub struct RoomManager {
    inner: RwLock<Inner>,
}

impl RoomManager {
    pub fn new(base: RouterConfig, overrides: HashMap<String, RouterConfig>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                base,
                overrides,
                rooms: HashMap::new(),
            }),
        }
    }

    /// Look up a room, creating it on first use. An empty name maps to
    /// `"default"`.
    pub fn get(&self, name: &str) -> Arc<Room> {
        let name = if name.is_empty() { "default" } else { name };
        {
            let inner = self.inner.read().expect("rooms lock");
            if let Some(room) = inner.rooms.get(name) {
                return Arc::clone(room);
            }
        }

        // Re-check under the write lock so two racing streams cannot create
        // the room twice.
        let mut inner = self.inner.write().expect("rooms lock");
        if let Some(room) = inner.rooms.get(name) {
            return Arc::clone(room);
        }
        let cfg = inner
            .overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| inner.base.clone());
        let room = Room::new(name, cfg);
        inner.rooms.insert(name.to_string(), Arc::clone(&room));
        room
    }

    /// The base configuration, used for preface limits before a stream has
    /// named its room.
    pub fn base_config(&self) -> RouterConfig {
        self.inner.read().expect("rooms lock").base.clone()
    }

    /// Replace the stored configuration maps and push the merged config
    /// into every existing room. In-flight messages are unaffected.
    pub fn update_config(&self, base: RouterConfig, overrides: HashMap<String, RouterConfig>) {
        let mut inner = self.inner.write().expect("rooms lock");
        inner.base = base;
        inner.overrides = overrides;
        for (name, room) in &inner.rooms {
            let cfg = inner
                .overrides
                .get(name)
                .cloned()
                .unwrap_or_else(|| inner.base.clone());
            room.set_config(cfg);
        }
    }
}
