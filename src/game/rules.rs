//! Combat constants - per-action stats and arena geometry

use crate::ws::protocol::ActionKind;

/// Stats of one action kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionStats {
    /// Damage on hit
    pub damage: u32,
    /// Max distance between actor and aim point
    pub range: f32,
    /// Room-clock time before the actor may act again
    pub cooldown_ms: u64,
    /// Probability that an in-reach strike lands
    pub hit_chance: f64,
}

/// Full rule table used by the resolver
#[derive(Debug, Clone, PartialEq)]
pub struct CombatRules {
    pub attack: ActionStats,
    pub heavy_attack: ActionStats,
    pub movement: ActionStats,
    /// Arena is the square [-half_extent, half_extent]^2
    pub arena_half_extent: f32,
    /// Max distance between the aim point and the defender for a strike to connect
    pub aim_tolerance: f32,
    /// Longest single step a Move may take
    pub max_step: f32,
}

impl CombatRules {
    pub fn for_kind(&self, kind: ActionKind) -> &ActionStats {
        match kind {
            ActionKind::Attack => &self.attack,
            ActionKind::HeavyAttack => &self.heavy_attack,
            ActionKind::Move => &self.movement,
        }
    }
}

impl Default for CombatRules {
    fn default() -> Self {
        Self {
            attack: ActionStats {
                damage: 15,
                range: 6.0,
                cooldown_ms: 1_000,
                hit_chance: 0.85,
            },
            heavy_attack: ActionStats {
                damage: 30,
                range: 2.5,
                cooldown_ms: 3_000,
                hit_chance: 0.6,
            },
            movement: ActionStats {
                damage: 0,
                range: 0.0,
                cooldown_ms: 200,
                hit_chance: 0.0,
            },
            arena_half_extent: 10.0,
            aim_tolerance: 1.5,
            max_step: 3.0,
        }
    }
}

#[cfg(test)]
impl CombatRules {
    /// Same table with every strike landing when in reach
    pub fn certain_hits() -> Self {
        let mut rules = Self::default();
        rules.attack.hit_chance = 1.0;
        rules.heavy_attack.hit_chance = 1.0;
        rules
    }

    /// Same table with no strike ever landing
    pub fn certain_misses() -> Self {
        let mut rules = Self::default();
        rules.attack.hit_chance = 0.0;
        rules.heavy_attack.hit_chance = 0.0;
        rules
    }
}
