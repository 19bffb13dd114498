//! Spectator fan-out
//!
//! Each room actor owns its own [`Spectators`] list and pushes full snapshots
//! to it. [`SpectatorIndex`] only records which room a spectator watches so
//! that unsubscribe can be routed and spectator actions can be refused at the
//! transport boundary. [`SpectatorHub`] ties the two together for callers
//! outside the room.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ws::protocol::{RoomSnapshot, ServerMsg};
use crate::ws::session::{Session, Transport};

use super::actor::RoomCommand;
use super::registry::RoomRegistry;

/// Errors from spectate requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpectateError {
    #[error("room not found")]
    RoomNotFound,

    #[error("room has already finished")]
    RoomResolved,

    #[error("participants cannot spectate while in a room")]
    ParticipantCannotSpectate,
}

impl SpectateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::RoomResolved => "room_resolved",
            Self::ParticipantCannotSpectate => "participant_cannot_spectate",
        }
    }
}

/// Read-only subscribers of one room, owned by that room's actor
#[derive(Default)]
pub struct Spectators {
    subscribers: Vec<(Uuid, Transport)>,
}

impl Spectators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscriber
    pub fn subscribe(&mut self, spectator: Uuid, transport: Transport) {
        self.unsubscribe(spectator);
        self.subscribers.push((spectator, transport));
    }

    pub fn unsubscribe(&mut self, spectator: Uuid) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(id, _)| *id != spectator);
        self.subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Fire-and-forget to every subscriber; closed transports are pruned.
    /// Returns how many subscribers accepted the message.
    pub fn publish(&mut self, msg: &ServerMsg) -> usize {
        self.subscribers.retain(|(_, t)| t.is_open());
        self.subscribers
            .iter()
            .filter(|(_, t)| t.send(msg.clone()))
            .count()
    }

    /// Remove every subscriber, returning their ids
    pub fn drain(&mut self) -> Vec<Uuid> {
        self.subscribers.drain(..).map(|(id, _)| id).collect()
    }
}

/// spectator -> watched room
pub struct SpectatorIndex {
    watching: DashMap<Uuid, Uuid>,
}

impl SpectatorIndex {
    pub fn new() -> Self {
        Self {
            watching: DashMap::new(),
        }
    }

    pub fn insert(&self, spectator: Uuid, room_id: Uuid) -> Option<Uuid> {
        self.watching.insert(spectator, room_id)
    }

    pub fn remove(&self, spectator: &Uuid) -> Option<Uuid> {
        self.watching.remove(spectator).map(|(_, room)| room)
    }

    /// Remove only if the spectator still watches `room_id`
    pub fn remove_if_watching(&self, spectator: &Uuid, room_id: &Uuid) -> bool {
        self.watching
            .remove_if(spectator, |_, r| r == room_id)
            .is_some()
    }

    pub fn room_of(&self, spectator: &Uuid) -> Option<Uuid> {
        self.watching.get(spectator).map(|r| *r)
    }

    pub fn is_spectating(&self, session_id: &Uuid) -> bool {
        self.watching.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.watching.len()
    }
}

impl Default for SpectatorIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribe/unsubscribe entry point for transports
pub struct SpectatorHub {
    rooms: Arc<RoomRegistry>,
    index: Arc<SpectatorIndex>,
}

impl SpectatorHub {
    pub fn new(rooms: Arc<RoomRegistry>, index: Arc<SpectatorIndex>) -> Self {
        Self { rooms, index }
    }

    pub fn is_spectating(&self, session_id: &Uuid) -> bool {
        self.index.is_spectating(session_id)
    }

    pub fn spectator_count(&self) -> usize {
        self.index.len()
    }

    /// Start watching `room_id`; the reply is a full snapshot of its latest tick
    pub async fn subscribe(
        &self,
        session: &Session,
        room_id: Uuid,
    ) -> Result<RoomSnapshot, SpectateError> {
        if self.rooms.room_of(&session.id).is_some() {
            return Err(SpectateError::ParticipantCannotSpectate);
        }
        let handle = self.rooms.get(&room_id).ok_or(SpectateError::RoomNotFound)?;

        if self.index.room_of(&session.id) != Some(room_id) {
            self.unsubscribe(session.id).await;
        }
        self.index.insert(session.id, room_id);

        let (reply, response) = oneshot::channel();
        let sent = handle
            .send(RoomCommand::Spectate {
                spectator: session.id,
                transport: session.transport.clone(),
                reply,
            })
            .await;

        let outcome = if sent {
            response.await.unwrap_or(Err(SpectateError::RoomResolved))
        } else {
            Err(SpectateError::RoomResolved)
        };

        match &outcome {
            Ok(_) => info!(session_id = %session.id, room_id = %room_id, "Spectator subscribed"),
            Err(_) => {
                self.index.remove_if_watching(&session.id, &room_id);
            }
        }
        outcome
    }

    /// Stop watching. Not spectating is a no-op.
    pub async fn unsubscribe(&self, spectator: Uuid) -> bool {
        let Some(room_id) = self.index.remove(&spectator) else {
            return false;
        };
        if let Some(handle) = self.rooms.get(&room_id) {
            handle.send(RoomCommand::StopSpectating { spectator }).await;
        }
        debug!(session_id = %spectator, room_id = %room_id, "Spectator unsubscribed");
        true
    }
}
