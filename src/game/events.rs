//! Room event log entries and their translation into outbound messages

use uuid::Uuid;

use crate::ws::protocol::{ActionEvent, MatchResult, PhaseKind, ResultReason, ServerMsg};

/// One entry of a room's append-only event log
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    PhaseChanged { phase: PhaseKind, tick: u64 },
    Action(ActionEvent),
    Elimination { session_id: Uuid },
    BattleOver { winner: Uuid },
    ParticipantDisconnected { session_id: Uuid, grace_ms: u64 },
    ParticipantReconnected { session_id: Uuid },
    Resolved(MatchResult),
}

impl RoomEvent {
    /// Events that change what a snapshot would show
    pub fn changes_state(&self) -> bool {
        !matches!(self, Self::BattleOver { .. })
    }
}

/// Who an outbound message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Both combatants
    Participants,
    /// One combatant
    Participant(Uuid),
    /// The combatant facing the given session
    OpponentOf(Uuid),
    /// Combatants and spectators
    Everyone,
}

/// Translate a slice of the event log into addressed messages.
///
/// Elimination and battle-over entries fold into the preceding action's
/// `ActionResult`.
pub fn outbound_messages(events: &[RoomEvent]) -> Vec<(Audience, ServerMsg)> {
    let mut out = Vec::new();
    let mut iter = events.iter().peekable();

    while let Some(event) = iter.next() {
        match event {
            RoomEvent::PhaseChanged {
                phase: PhaseKind::Active,
                tick,
            } => out.push((Audience::Participants, ServerMsg::MatchStarted { tick: *tick })),
            RoomEvent::PhaseChanged { .. } => {}
            RoomEvent::Action(action) => {
                let mut eliminated = None;
                let mut battle_over = false;
                while let Some(next) = iter.peek() {
                    match next {
                        RoomEvent::Elimination { session_id } => eliminated = Some(*session_id),
                        RoomEvent::BattleOver { .. } => battle_over = true,
                        _ => break,
                    }
                    iter.next();
                }
                out.push((
                    Audience::Participants,
                    ServerMsg::ActionResult {
                        event: action.clone(),
                        eliminated,
                        battle_over,
                    },
                ));
            }
            RoomEvent::Elimination { .. } | RoomEvent::BattleOver { .. } => {}
            RoomEvent::ParticipantDisconnected {
                session_id,
                grace_ms,
            } => out.push((
                Audience::OpponentOf(*session_id),
                ServerMsg::OpponentConnectionLost {
                    grace_remaining_ms: *grace_ms,
                },
            )),
            RoomEvent::ParticipantReconnected { session_id } => out.push((
                Audience::OpponentOf(*session_id),
                ServerMsg::OpponentReconnected,
            )),
            RoomEvent::Resolved(result) => {
                if let (ResultReason::Disconnect, Some(winner)) = (result.reason, result.winner) {
                    out.push((Audience::Participant(winner), ServerMsg::OpponentDisconnected));
                }
                out.push((
                    Audience::Everyone,
                    ServerMsg::MatchEnded {
                        result: result.clone(),
                    },
                ));
            }
        }
    }

    out
}
