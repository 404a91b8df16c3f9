use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    thread::JoinHandle,
};

use tracing::warn;

use super::{error::ReviewError, session::Session};

/// Playback thread bookkeeping for one room. `closed` flips when the room is
/// removed so an in-flight start cannot attach a loop to a dead room.
#[derive(Default)]
struct PlaybackSlot {
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

struct RoomEntry {
    session: Arc<Session>,
    slot: Arc<Mutex<PlaybackSlot>>,
}

/// Maps room names to live sessions and their playback threads.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    inner: Mutex<HashMap<String, RoomEntry>>,
}

impl SessionRegistry {
    fn locked(&self) -> MutexGuard<'_, HashMap<String, RoomEntry>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Register a new room. Joining a name that is already live is rejected so
    /// two reviewers cannot silently share a transport.
    pub(crate) fn create(&self, room: &str) -> Result<Arc<Session>, ReviewError> {
        let mut rooms = self.locked();
        if rooms.contains_key(room) {
            return Err(ReviewError::AlreadyExists(room.to_string()));
        }
        let session = Arc::new(Session::new(room));
        rooms.insert(
            room.to_string(),
            RoomEntry {
                session: session.clone(),
                slot: Arc::default(),
            },
        );
        Ok(session)
    }

    pub(crate) fn get(&self, room: &str) -> Result<Arc<Session>, ReviewError> {
        self.locked()
            .get(room)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| ReviewError::SessionNotFound(room.to_string()))
    }

    /// Run `f` with exclusive access to the room's playback thread handle.
    /// Concurrent starts for one room serialize on the slot lock, so a
    /// stop-join-spawn-attach sequence is atomic per room; `remove` contends
    /// on the same lock and closes the slot, so `f` never runs for a room
    /// that has been torn down.
    pub(crate) fn with_playback_slot<T>(
        &self,
        room: &str,
        f: impl FnOnce(&Arc<Session>, &mut Option<JoinHandle<()>>) -> T,
    ) -> Result<T, ReviewError> {
        let (session, slot) = {
            let rooms = self.locked();
            let entry = rooms
                .get(room)
                .ok_or_else(|| ReviewError::SessionNotFound(room.to_string()))?;
            (entry.session.clone(), entry.slot.clone())
        };
        let mut slot = slot.lock().unwrap_or_else(|err| err.into_inner());
        if slot.closed {
            return Err(ReviewError::SessionNotFound(room.to_string()));
        }
        Ok(f(&session, &mut slot.handle))
    }

    /// Drop the room, stopping and joining its playback thread outside the
    /// registry lock.
    pub(crate) fn remove(&self, room: &str) -> Result<(), ReviewError> {
        let entry = self
            .locked()
            .remove(room)
            .ok_or_else(|| ReviewError::SessionNotFound(room.to_string()))?;
        let handle = {
            let mut slot = entry.slot.lock().unwrap_or_else(|err| err.into_inner());
            slot.closed = true;
            slot.handle.take()
        };
        entry.session.stop();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(room, "playback thread panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn create_and_get() {
        let registry = SessionRegistry::default();
        let created = registry.create("demo").unwrap();
        let fetched = registry.get("demo").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[test]
    fn duplicate_join_rejected() {
        let registry = SessionRegistry::default();
        registry.create("demo").unwrap();
        assert!(matches!(
            registry.create("demo"),
            Err(ReviewError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_frees_the_name() {
        let registry = SessionRegistry::default();
        registry.create("demo").unwrap();
        registry.remove("demo").unwrap();
        assert!(matches!(
            registry.get("demo"),
            Err(ReviewError::SessionNotFound(_))
        ));
        registry.create("demo").unwrap();
    }

    #[test]
    fn remove_unknown_room_errors() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.remove("ghost"),
            Err(ReviewError::SessionNotFound(_))
        ));
    }

    #[test]
    fn slot_access_for_unknown_room_errors() {
        let registry = SessionRegistry::default();
        assert!(matches!(
            registry.with_playback_slot("ghost", |_, _| ()),
            Err(ReviewError::SessionNotFound(_))
        ));
    }

    #[test]
    fn slot_access_for_one_room_is_serialized() {
        let registry = Arc::new(SessionRegistry::default());
        registry.create("demo").unwrap();
        let in_slot = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let in_slot = in_slot.clone();
            handles.push(thread::spawn(move || {
                registry
                    .with_playback_slot("demo", |_, _| {
                        assert!(!in_slot.swap(true, Ordering::SeqCst));
                        thread::sleep(Duration::from_millis(20));
                        in_slot.store(false, Ordering::SeqCst);
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn remove_waits_for_an_in_flight_start_and_joins_its_loop() {
        let registry = Arc::new(SessionRegistry::default());
        registry.create("demo").unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let starter = {
            let registry = registry.clone();
            let entered = entered.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                registry
                    .with_playback_slot("demo", move |session, handle_slot| {
                        entered.store(true, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        let session = session.clone();
                        *handle_slot = Some(thread::spawn(move || {
                            while !session.flags().stopped {
                                thread::sleep(Duration::from_millis(1));
                            }
                            finished.store(true, Ordering::SeqCst);
                        }));
                    })
                    .unwrap();
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        registry.remove("demo").unwrap();
        starter.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn remove_joins_the_attached_playback_thread() {
        let registry = SessionRegistry::default();
        let session = registry.create("demo").unwrap();
        registry
            .with_playback_slot("demo", |session, handle_slot| {
                let session = session.clone();
                *handle_slot = Some(thread::spawn(move || {
                    while !session.flags().stopped {
                        thread::sleep(Duration::from_millis(1));
                    }
                }));
            })
            .unwrap();
        registry.remove("demo").unwrap();
        assert!(session.flags().stopped);
    }
}
