//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Matchmaking bucket a player queues into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    /// Wagered queue; entries only pair with equal wagers
    Tier(u32),
    /// Practice queue; ignores wager and falls back to a bot opponent
    Tutorial,
}

impl QueueClass {
    pub fn ignores_wager(&self) -> bool {
        matches!(self, Self::Tutorial)
    }
}

/// Fighter descriptor chosen by the player, frozen for the whole match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fighter {
    pub name: String,
    pub max_health: u32,
}

/// Combat action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Quick strike, medium reach
    Attack,
    /// Slow strike, short reach, double damage
    HeavyAttack,
    /// Reposition inside the arena
    Move,
}

/// Arena position. Not interpreted beyond distance checks and arena bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    /// Facing in radians
    #[serde(default)]
    pub facing: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, facing: f32) -> Self {
        Self { x, y, facing }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.facing.is_finite()
    }

    /// Whether the point lies inside a square arena centered on the origin
    pub fn within(&self, half_extent: f32) -> bool {
        self.x.abs() <= half_extent && self.y.abs() <= half_extent
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Enter the matchmaking queue
    JoinQueue {
        fighter: Fighter,
        #[serde(default)]
        wager_amount: u64,
        queue_class: QueueClass,
    },

    /// Leave the matchmaking queue (no-op if not queued)
    LeaveQueue,

    /// Combat intent for the current room
    SubmitAction {
        action: ActionKind,
        #[serde(default)]
        target: Option<Position>,
        /// Advisory only, never used for ordering or cooldowns
        #[serde(default)]
        client_timestamp: Option<u64>,
    },

    /// Watch a room read-only
    SpectateMatch { room_id: Uuid },

    /// Stop watching the current room
    StopSpectating,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        session_id: Uuid,
        display_name: String,
        server_time: u64,
    },

    /// Player is waiting in a queue
    QueueJoined {
        queue_class: QueueClass,
        position: usize,
    },

    /// Player is no longer queued
    QueueLeft,

    /// A room was created for this player
    MatchFound {
        room_id: Uuid,
        opponent: OpponentSummary,
        snapshot: RoomSnapshot,
        is_first_participant: bool,
    },

    /// Room countdown starting
    MatchCountdown { seconds_remaining: u32 },

    /// Room became active
    MatchStarted { tick: u64 },

    /// Outcome of an accepted action, sent to both participants
    ActionResult {
        event: ActionEvent,
        /// Session eliminated by this action, if any
        eliminated: Option<Uuid>,
        battle_over: bool,
    },

    /// Request refused; room state is unchanged
    Rejected { reason: Rejection },

    /// Opponent lost its connection and has a grace window to return
    OpponentConnectionLost { grace_remaining_ms: u64 },

    /// Opponent came back inside its grace window
    OpponentReconnected,

    /// Opponent never came back; the match is forfeited in your favour
    OpponentDisconnected,

    /// Rejoined an in-progress room after a reconnect
    MatchResumed { room_id: Uuid, snapshot: RoomSnapshot },

    /// Full room state
    RoomSnapshot { snapshot: RoomSnapshot },

    /// Room reached its terminal state
    MatchEnded { result: MatchResult },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// What a participant learns about its opponent on pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentSummary {
    pub session_id: Uuid,
    pub wallet: String,
    pub fighter: Fighter,
    pub is_bot: bool,
}

/// Room lifecycle phase as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Countdown,
    Active,
    Resolved,
}

/// Participant state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub session_id: Uuid,
    pub fighter_name: String,
    pub is_bot: bool,
    pub health: u32,
    pub max_health: u32,
    pub position: Position,
    pub alive: bool,
    pub connected: bool,
    /// Cooldown remaining on the room clock (0 = can act)
    pub cooldown_remaining_ms: u64,
}

/// Full, self-contained room state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    /// Room tick this snapshot was taken after
    pub tick: u64,
    pub phase: PhaseKind,
    pub countdown_remaining_ms: u64,
    /// Match timer budget left
    pub remaining_ms: u64,
    pub wager: u64,
    pub participants: Vec<ParticipantSnapshot>,
    pub spectators: usize,
    pub result: Option<MatchResult>,
}

/// Outcome of one resolved action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// Per-room action sequence number
    pub seq: u64,
    pub actor: Uuid,
    pub kind: ActionKind,
    pub target: Option<Uuid>,
    pub hit: bool,
    pub damage: u32,
    /// Target health after the action
    pub target_health: Option<u32>,
    /// Actor position after the action
    pub actor_position: Position,
}

/// Why a room resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultReason {
    Elimination,
    Timeout,
    Disconnect,
    Voided,
}

/// Final per-participant line of a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultParticipant {
    pub session_id: Uuid,
    pub wallet: String,
    pub is_bot: bool,
    pub final_health: u32,
}

/// Terminal outcome of a room, handed to the profile store and escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub room_id: Uuid,
    /// None means draw or void
    pub winner: Option<Uuid>,
    pub loser: Option<Uuid>,
    pub reason: ResultReason,
    /// Time spent in the active phase
    pub duration_ms: u64,
    pub wager: u64,
    pub participants: Vec<ResultParticipant>,
}

impl MatchResult {
    pub fn wallet_of(&self, session_id: Uuid) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.session_id == session_id)
            .map(|p| p.wallet.as_str())
    }
}

/// Broad error class of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Malformed or illegal request
    Validation,
    /// Request against a room in the wrong state, or a foreign room
    StateConflict,
}

/// Reasons a request is refused without touching room state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    #[error("room is not accepting actions")]
    RoomNotActive,

    #[error("session is not a participant of this room")]
    NotParticipant,

    #[error("participant has been eliminated")]
    Eliminated,

    #[error("action on cooldown for another {retry_in_ms}ms")]
    CooldownActive { retry_in_ms: u64 },

    #[error("target position is outside the arena")]
    InvalidTarget,

    #[error("spectators cannot act")]
    SpectatorReadOnly,

    #[error("session is not in a room")]
    NotInRoom,

    #[error("too many messages")]
    RateLimited,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::CooldownActive { .. }
            | Self::InvalidTarget
            | Self::SpectatorReadOnly
            | Self::RateLimited => RejectionKind::Validation,
            Self::RoomNotActive | Self::NotParticipant | Self::Eliminated | Self::NotInRoom => {
                RejectionKind::StateConflict
            }
        }
    }
}
