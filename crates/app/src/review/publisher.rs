use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::data::{EndNote, FramePacket, SharedPacket};

/// Sink for the playback loop's output. Keeps the loop decoupled from the
/// HTTP layer so it can be driven by a recording double in tests.
pub(crate) trait Publisher: Send + Sync {
    fn publish(&self, room: &str, packet: FramePacket);
    fn finish(&self, room: &str, note: EndNote);
}

/// Latest-frame mailbox per room. The HTTP handlers poll it at their own pace;
/// slow consumers see dropped frames, never backpressure on the loop.
#[derive(Clone, Default)]
pub(crate) struct RoomFeed {
    latest: SharedPacket,
    note: Arc<Mutex<Option<EndNote>>>,
}

impl RoomFeed {
    pub(crate) fn latest(&self) -> Option<FramePacket> {
        if let Ok(guard) = self.latest.lock() {
            guard.clone()
        } else {
            None
        }
    }

    pub(crate) fn note(&self) -> Option<EndNote> {
        if let Ok(guard) = self.note.lock() {
            guard.clone()
        } else {
            None
        }
    }
}

#[derive(Default)]
pub(crate) struct RoomHub {
    rooms: Mutex<HashMap<String, RoomFeed>>,
}

impl RoomHub {
    /// Register a feed for a joined room. Only `join` creates feeds; lookups
    /// for unknown rooms must not grow the map.
    pub(crate) fn create(&self, room: &str) -> RoomFeed {
        let mut rooms = self.rooms.lock().unwrap_or_else(|err| err.into_inner());
        rooms.entry(room.to_string()).or_default().clone()
    }

    pub(crate) fn get(&self, room: &str) -> Option<RoomFeed> {
        let rooms = self.rooms.lock().unwrap_or_else(|err| err.into_inner());
        rooms.get(room).cloned()
    }

    pub(crate) fn drop_room(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|err| err.into_inner());
        rooms.remove(room);
    }
}

impl Publisher for RoomHub {
    fn publish(&self, room: &str, packet: FramePacket) {
        // Frames for rooms that already left are dropped on the floor.
        let Some(feed) = self.get(room) else { return };
        let slot = feed.latest.lock();
        if let Ok(mut slot) = slot {
            *slot = Some(packet);
        }
    }

    fn finish(&self, room: &str, note: EndNote) {
        let Some(feed) = self.get(room) else { return };
        let slot = feed.note.lock();
        if let Ok(mut slot) = slot {
            *slot = Some(note);
        }
    }
}
