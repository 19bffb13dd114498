//! Battle room state machine
//!
//! ```text
//! new() ──→ Countdown ──(countdown elapsed)──→ Active ──→ Resolved
//!               │                                 │
//!               └──────(grace deadline passed)────┴──(elimination / timer / forfeit)
//! ```
//!
//! All time is measured on the room clock, which only moves in [`BattleRoom::advance`].
//! Countdown, cooldowns, the match timer and grace deadlines are therefore plain
//! numbers compared against the clock; resolving the room retires all of them at once.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::config::GameConfig;
use crate::util::time::{ticks_to_millis, TICK_MILLIS};
use crate::ws::protocol::{
    ActionEvent, ActionKind, MatchResult, PhaseKind, Position, Rejection, ResultParticipant,
    ResultReason, RoomSnapshot,
};

use super::arena::{ArenaState, Entrant, ParticipantState, Seat};
use super::events::RoomEvent;
use super::resolver::resolve;
use super::rules::CombatRules;
use super::ActionRequest;

/// Spawn band along x for the first seat; the second seat is mirrored
const SPAWN_X: (f32, f32) = (-2.5, -1.0);
const SPAWN_Y: (f32, f32) = (-1.0, 1.0);

/// Room lifecycle; only ever moves forward
#[derive(Debug, Clone, PartialEq)]
pub enum RoomPhase {
    Countdown { remaining_ms: u64 },
    Active,
    Resolved(MatchResult),
}

impl RoomPhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Countdown { .. } => PhaseKind::Countdown,
            Self::Active => PhaseKind::Active,
            Self::Resolved(_) => PhaseKind::Resolved,
        }
    }
}

/// Authoritative state of one match
pub struct BattleRoom {
    id: Uuid,
    wager: u64,
    phase: RoomPhase,
    arena: ArenaState,
    rules: CombatRules,
    /// Room clock
    clock_ms: u64,
    tick: u64,
    /// Room clock when the Active phase began
    started_at_ms: Option<u64>,
    /// Match timer budget
    remaining_ms: u64,
    grace_ms: u64,
    log: Vec<RoomEvent>,
}

impl BattleRoom {
    pub fn new(id: Uuid, seed: u64, wager: u64, entrants: [Entrant; 2], config: &GameConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let [first, second] = entrants;

        let first_pos = Position::new(
            rng.gen_range(SPAWN_X.0..=SPAWN_X.1),
            rng.gen_range(SPAWN_Y.0..=SPAWN_Y.1),
            0.0,
        );
        let second_pos = Position::new(
            -rng.gen_range(SPAWN_X.0..=SPAWN_X.1),
            rng.gen_range(SPAWN_Y.0..=SPAWN_Y.1),
            std::f32::consts::PI,
        );

        let arena = ArenaState::new(
            [
                ParticipantState::spawn(first, first_pos),
                ParticipantState::spawn(second, second_pos),
            ],
            seed,
        );

        let mut room = Self {
            id,
            wager,
            phase: RoomPhase::Countdown {
                remaining_ms: ticks_to_millis(config.countdown),
            },
            arena,
            rules: config.combat.clone(),
            clock_ms: 0,
            tick: 0,
            started_at_ms: None,
            remaining_ms: ticks_to_millis(config.match_duration),
            grace_ms: ticks_to_millis(config.reconnect_grace),
            log: Vec::new(),
        };
        room.log.push(RoomEvent::PhaseChanged {
            phase: PhaseKind::Countdown,
            tick: 0,
        });
        room
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.phase, RoomPhase::Resolved(_))
    }

    pub fn result(&self) -> Option<&MatchResult> {
        match &self.phase {
            RoomPhase::Resolved(result) => Some(result),
            _ => None,
        }
    }

    pub fn arena(&self) -> &ArenaState {
        &self.arena
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining_ms
    }

    pub fn rules(&self) -> &CombatRules {
        &self.rules
    }

    pub fn seat_of(&self, session_id: Uuid) -> Option<Seat> {
        self.arena.seat_of(session_id)
    }

    pub fn participant(&self, seat: Seat) -> &ParticipantState {
        self.arena.get(seat)
    }

    /// Log entries appended at or after `cursor`
    pub fn events_since(&self, cursor: usize) -> &[RoomEvent] {
        &self.log[cursor.min(self.log.len())..]
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Validate and apply one action from a participant
    pub fn submit_action(
        &mut self,
        session_id: Uuid,
        request: &ActionRequest,
    ) -> Result<ActionEvent, Rejection> {
        if self.phase != RoomPhase::Active {
            return Err(Rejection::RoomNotActive);
        }
        let seat = self.seat_of(session_id).ok_or(Rejection::NotParticipant)?;
        let actor = self.arena.get(seat);
        if !actor.alive {
            return Err(Rejection::Eliminated);
        }
        let retry_in_ms = actor.cooldown_remaining(self.clock_ms);
        if retry_in_ms > 0 {
            return Err(Rejection::CooldownActive { retry_in_ms });
        }
        self.validate_target(request)?;

        let (next, events) = resolve(&self.arena, seat, request, self.clock_ms, &self.rules);
        if let Err(violation) = next.check_invariants() {
            self.void(&violation);
            return Err(Rejection::RoomNotActive);
        }
        self.arena = next;

        let battle_over = events.iter().find_map(|e| match e {
            RoomEvent::BattleOver { winner } => Some(*winner),
            _ => None,
        });
        let action = events.iter().find_map(|e| match e {
            RoomEvent::Action(action) => Some(action.clone()),
            _ => None,
        });
        self.log.extend(events);

        if let Some(winner) = battle_over {
            let winner = self.seat_of(winner);
            self.resolve_match(winner, ResultReason::Elimination);
        }

        action.ok_or(Rejection::RoomNotActive)
    }

    fn validate_target(&self, request: &ActionRequest) -> Result<(), Rejection> {
        match request.target {
            Some(target) if !target.is_finite() => Err(Rejection::InvalidTarget),
            Some(target) if !target.within(self.rules.arena_half_extent) => {
                Err(Rejection::InvalidTarget)
            }
            None if request.kind == ActionKind::Move => Err(Rejection::InvalidTarget),
            _ => Ok(()),
        }
    }

    /// Transport loss for a participant: start its grace window.
    /// Returns false when nothing changed.
    pub fn handle_disconnect(&mut self, session_id: Uuid) -> bool {
        if self.is_resolved() {
            return false;
        }
        let Some(seat) = self.seat_of(session_id) else {
            return false;
        };
        let deadline = self.clock_ms + self.grace_ms;
        let participant = self.arena.get_mut(seat);
        if !participant.connected || participant.is_bot() {
            return false;
        }
        participant.connected = false;
        participant.grace_deadline_ms = Some(deadline);
        self.log.push(RoomEvent::ParticipantDisconnected {
            session_id,
            grace_ms: self.grace_ms,
        });
        true
    }

    /// A participant is back. Inside the grace window nothing but the
    /// connection flag changes.
    pub fn handle_reconnect(&mut self, session_id: Uuid) -> Result<(), Rejection> {
        if self.is_resolved() {
            return Err(Rejection::RoomNotActive);
        }
        let seat = self.seat_of(session_id).ok_or(Rejection::NotParticipant)?;
        let clock_ms = self.clock_ms;
        let participant = self.arena.get_mut(seat);
        if participant.connected {
            return Ok(());
        }
        match participant.grace_deadline_ms {
            Some(deadline) if clock_ms >= deadline => Err(Rejection::RoomNotActive),
            _ => {
                participant.connected = true;
                participant.grace_deadline_ms = None;
                self.log.push(RoomEvent::ParticipantReconnected { session_id });
                Ok(())
            }
        }
    }

    /// Advance the room clock by one tick
    pub fn advance(&mut self) {
        if self.is_resolved() {
            return;
        }
        self.clock_ms += TICK_MILLIS;
        self.tick += 1;

        if self.check_forfeits() {
            return;
        }

        match self.phase {
            RoomPhase::Countdown { remaining_ms } => {
                let remaining_ms = remaining_ms.saturating_sub(TICK_MILLIS);
                if remaining_ms == 0 {
                    self.phase = RoomPhase::Active;
                    self.started_at_ms = Some(self.clock_ms);
                    self.log.push(RoomEvent::PhaseChanged {
                        phase: PhaseKind::Active,
                        tick: self.tick,
                    });
                } else {
                    self.phase = RoomPhase::Countdown { remaining_ms };
                }
            }
            RoomPhase::Active => {
                self.remaining_ms = self.remaining_ms.saturating_sub(TICK_MILLIS);
                if self.remaining_ms == 0 {
                    self.resolve_timeout();
                }
            }
            RoomPhase::Resolved(_) => {}
        }
    }

    /// Resolve by forfeit once a grace deadline has passed
    fn check_forfeits(&mut self) -> bool {
        let clock_ms = self.clock_ms;
        let expired = Seat::BOTH.into_iter().find(|seat| {
            let p = self.arena.get(*seat);
            !p.connected && p.grace_deadline_ms.is_some_and(|d| clock_ms >= d)
        });
        let Some(expired) = expired else {
            return false;
        };

        let other = expired.opponent();
        if self.arena.get(other).connected {
            self.resolve_match(Some(other), ResultReason::Disconnect);
        } else {
            self.resolve_match(None, ResultReason::Voided);
        }
        true
    }

    /// Timer ran out: strictly higher health wins, otherwise a draw
    fn resolve_timeout(&mut self) {
        let first = self.arena.get(Seat::First).health;
        let second = self.arena.get(Seat::Second).health;
        let winner = match first.cmp(&second) {
            std::cmp::Ordering::Greater => Some(Seat::First),
            std::cmp::Ordering::Less => Some(Seat::Second),
            std::cmp::Ordering::Equal => None,
        };
        self.resolve_match(winner, ResultReason::Timeout);
    }

    /// Resolve as void after an unrecoverable internal failure
    pub fn void(&mut self, why: &str) {
        if self.is_resolved() {
            return;
        }
        tracing::error!(room_id = %self.id, reason = why, "Voiding room");
        self.resolve_match(None, ResultReason::Voided);
    }

    fn resolve_match(&mut self, winner: Option<Seat>, reason: ResultReason) {
        if self.is_resolved() {
            return;
        }
        let duration_ms = self
            .started_at_ms
            .map(|start| self.clock_ms.saturating_sub(start))
            .unwrap_or(0);

        let result = MatchResult {
            room_id: self.id,
            winner: winner.map(|s| self.arena.get(s).session_id),
            loser: winner.map(|s| self.arena.get(s.opponent()).session_id),
            reason,
            duration_ms,
            wager: self.wager,
            participants: self
                .arena
                .participants
                .iter()
                .map(|p| ResultParticipant {
                    session_id: p.session_id,
                    wallet: p.wallet.clone(),
                    is_bot: p.is_bot(),
                    final_health: p.health,
                })
                .collect(),
        };

        for p in self.arena.participants.iter_mut() {
            p.grace_deadline_ms = None;
        }
        self.log.push(RoomEvent::Resolved(result.clone()));
        self.phase = RoomPhase::Resolved(result);
    }

    /// Full snapshot of the current tick
    pub fn snapshot(&self, spectators: usize) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id,
            tick: self.tick,
            phase: self.phase.kind(),
            countdown_remaining_ms: match self.phase {
                RoomPhase::Countdown { remaining_ms } => remaining_ms,
                _ => 0,
            },
            remaining_ms: self.remaining_ms,
            wager: self.wager,
            participants: self
                .arena
                .participants
                .iter()
                .map(|p| p.snapshot(self.clock_ms))
                .collect(),
            spectators,
            result: self.result().cloned(),
        }
    }
}
