//! Tutorial stand-in: decides the bot's action for a tick

use crate::ws::protocol::{ActionKind, Position};

use super::arena::{ArenaState, Seat};
use super::rules::CombatRules;
use super::ActionRequest;

/// Close in on the opponent, then strike whenever the cooldown allows
pub fn next_action(
    arena: &ArenaState,
    seat: Seat,
    now_ms: u64,
    rules: &CombatRules,
) -> Option<ActionRequest> {
    let me = arena.get(seat);
    let opponent = arena.get(seat.opponent());
    if !me.alive || !opponent.alive || me.cooldown_remaining(now_ms) > 0 {
        return None;
    }

    // Keep a margin inside reach so the aim tolerance never matters
    let reach = rules.attack.range - 0.5;
    let request = if me.position.distance(&opponent.position) > reach {
        ActionRequest {
            kind: ActionKind::Move,
            target: Some(Position::new(
                opponent.position.x,
                opponent.position.y,
                me.position.facing,
            )),
            client_timestamp: None,
        }
    } else {
        ActionRequest {
            kind: ActionKind::Attack,
            target: None,
            client_timestamp: None,
        }
    };
    Some(request)
}
