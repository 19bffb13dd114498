//! Combat-relevant room state, the input and output of the resolver

use uuid::Uuid;

use crate::ws::protocol::{Fighter, ParticipantSnapshot, Position};

/// Which side of the room a participant occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Seat {
    First,
    Second,
}

impl Seat {
    pub const BOTH: [Seat; 2] = [Seat::First, Seat::Second];

    pub fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }

    pub fn opponent(self) -> Seat {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Who drives a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Human,
    /// Server-side stand-in for tutorial rooms
    Bot,
}

/// A combatant as handed to a new room
#[derive(Debug, Clone)]
pub struct Entrant {
    pub session_id: Uuid,
    pub wallet: String,
    pub fighter: Fighter,
    pub kind: ParticipantKind,
}

impl Entrant {
    pub fn human(session_id: Uuid, wallet: impl Into<String>, fighter: Fighter) -> Self {
        Self {
            session_id,
            wallet: wallet.into(),
            fighter,
            kind: ParticipantKind::Human,
        }
    }

    /// Tutorial stand-in mirroring the human's fighter
    pub fn bot(opposing: &Fighter) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            wallet: String::new(),
            fighter: Fighter {
                name: "Training Dummy".to_string(),
                max_health: opposing.max_health,
            },
            kind: ParticipantKind::Bot,
        }
    }
}

/// Per-combatant authoritative state
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantState {
    pub session_id: Uuid,
    pub wallet: String,
    pub fighter: Fighter,
    pub kind: ParticipantKind,
    pub health: u32,
    pub max_health: u32,
    pub position: Position,
    /// Room clock time at which the next action is allowed
    pub cooldown_until_ms: u64,
    pub alive: bool,
    pub connected: bool,
    /// Set only while disconnected
    pub grace_deadline_ms: Option<u64>,
}

impl ParticipantState {
    pub fn spawn(entrant: Entrant, position: Position) -> Self {
        let max_health = entrant.fighter.max_health;
        Self {
            session_id: entrant.session_id,
            wallet: entrant.wallet,
            fighter: entrant.fighter,
            kind: entrant.kind,
            health: max_health,
            max_health,
            position,
            cooldown_until_ms: 0,
            alive: true,
            connected: true,
            grace_deadline_ms: None,
        }
    }

    pub fn is_bot(&self) -> bool {
        self.kind == ParticipantKind::Bot
    }

    pub fn cooldown_remaining(&self, now_ms: u64) -> u64 {
        self.cooldown_until_ms.saturating_sub(now_ms)
    }

    pub fn snapshot(&self, now_ms: u64) -> ParticipantSnapshot {
        ParticipantSnapshot {
            session_id: self.session_id,
            fighter_name: self.fighter.name.clone(),
            is_bot: self.is_bot(),
            health: self.health,
            max_health: self.max_health,
            position: self.position,
            alive: self.alive,
            connected: self.connected,
            cooldown_remaining_ms: self.cooldown_remaining(now_ms),
        }
    }
}

/// Everything the resolver reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaState {
    pub participants: [ParticipantState; 2],
    /// Room seed; combined with `action_seq` for the per-action roll
    pub seed: u64,
    /// Number of actions resolved so far
    pub action_seq: u64,
}

impl ArenaState {
    pub fn new(participants: [ParticipantState; 2], seed: u64) -> Self {
        Self {
            participants,
            seed,
            action_seq: 0,
        }
    }

    pub fn get(&self, seat: Seat) -> &ParticipantState {
        &self.participants[seat.index()]
    }

    pub fn get_mut(&mut self, seat: Seat) -> &mut ParticipantState {
        &mut self.participants[seat.index()]
    }

    pub fn seat_of(&self, session_id: Uuid) -> Option<Seat> {
        Seat::BOTH
            .into_iter()
            .find(|seat| self.get(*seat).session_id == session_id)
    }

    pub fn alive_seats(&self) -> Vec<Seat> {
        Seat::BOTH
            .into_iter()
            .filter(|seat| self.get(*seat).alive)
            .collect()
    }

    /// Health bounds and the alive flag agree for every participant
    pub fn check_invariants(&self) -> Result<(), String> {
        for p in &self.participants {
            if p.health > p.max_health {
                return Err(format!(
                    "participant {} health {} exceeds max {}",
                    p.session_id, p.health, p.max_health
                ));
            }
            if p.alive != (p.health > 0) {
                return Err(format!(
                    "participant {} alive flag disagrees with health {}",
                    p.session_id, p.health
                ));
            }
        }
        Ok(())
    }
}
