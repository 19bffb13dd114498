//! Action resolution - the only place health and alive flags change
//!
//! [`resolve`] is a pure transition: the same arena, seat, request and clock
//! always produce the same next arena and events. The single probability
//! check per strike is drawn from a generator seeded by the room seed and the
//! action sequence number, so replays and spectator mirrors never diverge.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::ws::protocol::{ActionEvent, ActionKind, Position};

use super::arena::{ArenaState, Seat};
use super::events::RoomEvent;
use super::rules::CombatRules;
use super::ActionRequest;

/// Apply one already-validated action for `seat` at room time `now_ms`
pub fn resolve(
    arena: &ArenaState,
    seat: Seat,
    request: &ActionRequest,
    now_ms: u64,
    rules: &CombatRules,
) -> (ArenaState, Vec<RoomEvent>) {
    let mut next = arena.clone();
    next.action_seq += 1;
    let seq = next.action_seq;
    let stats = *rules.for_kind(request.kind);

    next.get_mut(seat).cooldown_until_ms = now_ms + stats.cooldown_ms;

    let mut events = Vec::new();

    match request.kind {
        ActionKind::Move => {
            let actor = next.get_mut(seat);
            if let Some(target) = request.target {
                actor.position = step_towards(actor.position, target, rules);
            }
            events.push(RoomEvent::Action(ActionEvent {
                seq,
                actor: actor.session_id,
                kind: request.kind,
                target: None,
                hit: false,
                damage: 0,
                target_health: None,
                actor_position: actor.position,
            }));
        }
        ActionKind::Attack | ActionKind::HeavyAttack => {
            let actor_position = next.get(seat).position;
            let actor_id = next.get(seat).session_id;
            let defender = next.get_mut(seat.opponent());
            let aim = request.target.unwrap_or(defender.position);

            let in_reach = defender.alive
                && actor_position.distance(&aim) <= stats.range
                && aim.distance(&defender.position) <= rules.aim_tolerance;
            let hit = in_reach && roll(next_seed(arena.seed, seq)) < stats.hit_chance;

            let damage = if hit { stats.damage.min(defender.health) } else { 0 };
            defender.health -= damage;
            let eliminated = defender.alive && defender.health == 0;
            if eliminated {
                defender.alive = false;
            }
            let defender_id = defender.session_id;
            let defender_health = defender.health;

            events.push(RoomEvent::Action(ActionEvent {
                seq,
                actor: actor_id,
                kind: request.kind,
                target: Some(defender_id),
                hit,
                damage,
                target_health: Some(defender_health),
                actor_position,
            }));

            if eliminated {
                events.push(RoomEvent::Elimination {
                    session_id: defender_id,
                });
                let alive = next.alive_seats();
                if let [survivor] = alive.as_slice() {
                    events.push(RoomEvent::BattleOver {
                        winner: next.get(*survivor).session_id,
                    });
                }
            }
        }
    }

    (next, events)
}

fn next_seed(seed: u64, seq: u64) -> u64 {
    seed ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn roll(seed: u64) -> f64 {
    ChaCha8Rng::seed_from_u64(seed).gen::<f64>()
}

/// Move at most `max_step` towards `target`, staying inside the arena
fn step_towards(from: Position, target: Position, rules: &CombatRules) -> Position {
    let distance = from.distance(&target);
    let (x, y) = if distance <= rules.max_step || distance == 0.0 {
        (target.x, target.y)
    } else {
        let scale = rules.max_step / distance;
        (
            from.x + (target.x - from.x) * scale,
            from.y + (target.y - from.y) * scale,
        )
    };
    let limit = rules.arena_half_extent;
    Position::new(x.clamp(-limit, limit), y.clamp(-limit, limit), target.facing)
}
