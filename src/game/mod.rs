//! Battle rooms: state machine, resolver, per-room actor and spectators

pub mod actor;
pub mod arena;
pub mod bot;
pub mod events;
pub mod registry;
pub mod resolver;
pub mod room;
pub mod rules;
pub mod settlement;
pub mod spectators;

pub use actor::{Contender, RoomCommand, RoomContext, RoomSpawner};
pub use registry::{RoomHandle, RoomRegistry};
pub use settlement::Settlement;
pub use spectators::{SpectateError, SpectatorHub};

use crate::ws::protocol::{ActionKind, Position};

/// Combat intent from a participant, as received from its transport
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub target: Option<Position>,
    /// Advisory; logged, never trusted for ordering or cooldowns
    pub client_timestamp: Option<u64>,
}
