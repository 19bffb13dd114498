//! Registry of live rooms and of which session sits in which room

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::actor::RoomCommand;

/// Handle to a running room actor
#[derive(Clone)]
pub struct RoomHandle {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub wager: u64,
    pub created_at: u64,
    pub command_tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Queue a command for the room's next tick. False if the room is gone.
    pub async fn send(&self, command: RoomCommand) -> bool {
        self.command_tx.send(command).await.is_ok()
    }
}

/// Public listing entry for a room
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_id: Uuid,
    pub participants: [Uuid; 2],
    pub wager: u64,
    pub created_at: u64,
}

impl From<&RoomHandle> for RoomSummary {
    fn from(handle: &RoomHandle) -> Self {
        Self {
            room_id: handle.id,
            participants: handle.participants,
            wager: handle.wager,
            created_at: handle.created_at,
        }
    }
}

/// Registry of all rooms that have not been garbage-collected yet
pub struct RoomRegistry {
    rooms: DashMap<Uuid, RoomHandle>,
    /// session -> room, for sessions still bound to an unresolved room
    members: DashMap<Uuid, Uuid>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            members: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<RoomHandle> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    /// Register a room and bind its participants to it
    pub fn insert(&self, handle: RoomHandle) {
        for session_id in handle.participants {
            self.members.insert(session_id, handle.id);
        }
        self.rooms.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<RoomHandle> {
        self.release_members(id);
        self.rooms.remove(id).map(|(_, h)| h)
    }

    /// Unbind a room's participants, leaving the room itself registered
    pub fn release_members(&self, room_id: &Uuid) {
        if let Some(handle) = self.rooms.get(room_id) {
            for session_id in handle.participants {
                self.members.remove_if(&session_id, |_, r| r == room_id);
            }
        }
    }

    pub fn room_of(&self, session_id: &Uuid) -> Option<Uuid> {
        self.members.get(session_id).map(|r| *r)
    }

    /// The room a session is currently playing in
    pub fn handle_for_session(&self, session_id: &Uuid) -> Option<RoomHandle> {
        self.room_of(session_id).and_then(|room_id| self.get(&room_id))
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn bound_sessions(&self) -> usize {
        self.members.len()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.iter().map(|r| r.value().into()).collect();
        rooms.sort_by_key(|r| r.created_at);
        rooms
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(participants: [Uuid; 2]) -> (RoomHandle, mpsc::Receiver<RoomCommand>) {
        let (command_tx, rx) = mpsc::channel(8);
        let handle = RoomHandle {
            id: Uuid::new_v4(),
            participants,
            wager: 100,
            created_at: 0,
            command_tx,
        };
        (handle, rx)
    }

    #[test]
    fn release_unbinds_members_but_keeps_room() {
        let registry = RoomRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (room, _rx) = handle([a, b]);
        let room_id = room.id;
        registry.insert(room);

        assert_eq!(registry.room_of(&a), Some(room_id));
        assert!(registry.handle_for_session(&b).is_some());

        registry.release_members(&room_id);
        assert_eq!(registry.room_of(&a), None);
        assert_eq!(registry.active_rooms(), 1);

        registry.remove(&room_id);
        assert_eq!(registry.active_rooms(), 0);
    }

    #[test]
    fn release_does_not_unbind_a_newer_room() {
        let registry = RoomRegistry::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (old, _old_rx) = handle([a, b]);
        let old_id = old.id;
        registry.insert(old);
        registry.release_members(&old_id);

        let (new, _new_rx) = handle([a, c]);
        let new_id = new.id;
        registry.insert(new);

        registry.remove(&old_id);
        assert_eq!(registry.room_of(&a), Some(new_id));
        assert_eq!(registry.bound_sessions(), 2);
    }
}
