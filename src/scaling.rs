//! Scaling engine.
//!
//! Pure functions mapping a run's configuration and party composition into
//! target levels, level bands and stat multipliers, plus the forced stat
//! block applied to every summoned creature. Nothing in here touches
//! manager state; the session and run managers feed inputs in and apply
//! the outputs through the world surface.

use crate::catalog::BaseStats;
use crate::config::{DifficultyTier, ScalingSettings};
use crate::world::{ForcedStats, MovementKind};
use crate::MAX_CREATURE_LEVEL;

/// Wander radius given to trash creatures after force-scaling.
pub const TRASH_PATROL_RADIUS: f32 = 5.0;

/// Anchor level for creature selection and scaling.
///
/// Solo: the requester's own level. Party: the integer-truncated mean of
/// all present members.
pub fn effective_level(levels: &[u8]) -> u8 {
    if levels.is_empty() {
        return 1;
    }
    if levels.len() == 1 {
        return levels[0];
    }
    let total: u32 = levels.iter().map(|&l| l as u32).sum();
    (total / levels.len() as u32) as u8
}

/// Level band for party-scaled sessions: effective ± band, clamped to
/// [1, 83], then clamped into the tier's range. A band inverted by the
/// tier clamp collapses onto its max.
pub fn level_band(effective: u8, band: u8, tier: &DifficultyTier) -> (u8, u8) {
    let mut min = effective.saturating_sub(band).max(1);
    let mut max = effective.saturating_add(band).min(MAX_CREATURE_LEVEL);

    min = min.max(tier.min_level);
    max = max.min(tier.max_level);

    if min > max {
        min = max;
    }
    (min, max)
}

/// Anchor and band for sessions that ignore party level: the tier midpoint
/// and the tier's full range.
pub fn tier_anchor(tier: &DifficultyTier) -> (u8, (u8, u8)) {
    (tier.midpoint(), (tier.min_level, tier.max_level))
}

/// Party-size scale shared by health and damage: the solo discount below
/// two members, linear growth per extra member above.
fn party_scale(party_size: usize, solo_mult: f32, per_player: f32) -> f32 {
    if party_size <= 1 {
        solo_mult
    } else {
        1.0 + (party_size as f32 - 1.0) * per_player
    }
}

pub fn health_multiplier(tier: &DifficultyTier, party_size: usize, s: &ScalingSettings) -> f32 {
    tier.health_mult * party_scale(party_size, s.solo_multiplier, s.per_player_health)
}

pub fn damage_multiplier(tier: &DifficultyTier, party_size: usize, s: &ScalingSettings) -> f32 {
    tier.damage_mult * party_scale(party_size, s.solo_multiplier, s.per_player_damage)
}

/// Boss damage uses party scaling and the dedicated boss multiplier only.
/// The tier's base damage multiplier is deliberately left out so the boss
/// multiplier is not stacked on an already-boosted base.
pub fn boss_damage_multiplier(party_size: usize, s: &ScalingSettings) -> f32 {
    party_scale(party_size, s.solo_multiplier, s.per_player_damage) * s.boss_damage_mult
}

/// Roguelike tier curve for health and damage.
///
/// Linear up to the exponential threshold; past it, each tier adds
/// `step * factor^(distance past threshold)` on top of the linear part
/// accrued up to the threshold.
pub fn tier_multiplier(tier: u32, step: f32, threshold: u32, factor: f32) -> f32 {
    if tier <= 1 {
        return 1.0;
    }
    if tier <= threshold {
        return 1.0 + (tier - 1) as f32 * step;
    }
    let linear_part = (threshold.saturating_sub(1)) as f32 * step;
    let mut exp_part = 0.0f32;
    for t in threshold..tier {
        exp_part += step * factor.powi((t - threshold + 1) as i32);
    }
    1.0 + linear_part + exp_part
}

/// Armor scales linearly only, at its own rate.
pub fn tier_armor_multiplier(tier: u32, step: f32) -> f32 {
    if tier <= 1 {
        1.0
    } else {
        1.0 + (tier - 1) as f32 * step
    }
}

/// Compute the stat block for forcing a creature to `target_level`.
///
/// `base` comes from the class/level table for the *target* level, never
/// from the creature's own template; `attack_time_ms` is the only template
/// value that survives. Damage derives from base damage plus the attack
/// power bonus, spread over the attack time.
pub fn forced_stats(
    base: &BaseStats,
    target_level: u8,
    attack_time_ms: u32,
    health_mult: f32,
    damage_mult: f32,
    armor_mult: f32,
    is_boss: bool,
) -> ForcedStats {
    let health = ((base.base_hp as f32) * health_mult).max(1.0) as u32;

    let ap_bonus = base.attack_power as f32 / 14.0;
    let mut attack_time = attack_time_ms as f32 / 1000.0;
    if attack_time <= 0.0 {
        attack_time = 2.0;
    }
    let mut damage_min = (base.base_damage + ap_bonus) * attack_time * damage_mult;
    let mut damage_max = (base.base_damage * 1.5 + ap_bonus) * attack_time * damage_mult;
    damage_min = damage_min.max(1.0);
    damage_max = damage_max.max(damage_min);

    let armor = (base.base_armor as f32 * armor_mult) as u32;

    ForcedStats {
        level: target_level,
        health,
        damage_min,
        damage_max,
        armor,
        movement: if is_boss {
            MovementKind::IdleAtSpawn
        } else {
            MovementKind::Patrol { radius: TRASH_PATROL_RADIUS }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(min: u8, max: u8) -> DifficultyTier {
        DifficultyTier {
            id: 1,
            name: "Test".into(),
            min_level: min,
            max_level: max,
            health_mult: 1.2,
            damage_mult: 1.1,
            reward_mult: 1.0,
            mob_count_mult: 1.0,
        }
    }

    #[test]
    fn test_effective_level_truncated_mean() {
        assert_eq!(effective_level(&[20]), 20);
        assert_eq!(effective_level(&[20, 23]), 21); // 43/2 truncates
        assert_eq!(effective_level(&[10, 20, 31]), 20);
        assert_eq!(effective_level(&[]), 1);
    }

    #[test]
    fn test_band_solo_level_20_no_tier_clamp() {
        // Solo level-20 player, tier [15,25], band 3 -> [17,23].
        let t = tier(15, 25);
        assert_eq!(level_band(20, 3, &t), (17, 23));
    }

    #[test]
    fn test_band_clamps_into_tier() {
        let t = tier(30, 44);
        // Player far below the tier: band collapses onto tier minimum.
        assert_eq!(level_band(10, 3, &t), (30, 30));
        // Player far above: collapses onto tier maximum.
        assert_eq!(level_band(60, 3, &t), (44, 44));
        // Partial overlap clips one side only.
        assert_eq!(level_band(31, 3, &t), (30, 34));
    }

    #[test]
    fn test_band_invariant_within_tier_bounds() {
        let t = tier(15, 48);
        for effective in 1..=MAX_CREATURE_LEVEL {
            for band in 0..=10u8 {
                let (lo, hi) = level_band(effective, band, &t);
                assert!(t.min_level <= lo, "lo {} below tier at eff {}", lo, effective);
                assert!(lo <= hi);
                assert!(hi <= t.max_level);
            }
        }
    }

    #[test]
    fn test_tier_anchor_uses_midpoint_and_full_range() {
        let t = tier(30, 44);
        let (anchor, band) = tier_anchor(&t);
        assert_eq!(anchor, 37);
        assert_eq!(band, (30, 44));
    }

    #[test]
    fn test_health_multiplier_identities() {
        let s = ScalingSettings::default();
        let t = tier(1, 80);
        // Solo: exactly tier x solo multiplier.
        let solo = health_multiplier(&t, 1, &s);
        assert!((solo - t.health_mult * s.solo_multiplier).abs() < 1e-6);
        // Party of n relates to solo by the documented ratio.
        for n in 2..=5usize {
            let hn = health_multiplier(&t, n, &s);
            let expected =
                solo * (1.0 + (n as f32 - 1.0) * s.per_player_health) / s.solo_multiplier;
            assert!((hn - expected).abs() < 1e-5, "n={}", n);
        }
    }

    #[test]
    fn test_boss_damage_skips_tier_base() {
        let s = ScalingSettings::default();
        let bd = boss_damage_multiplier(3, &s);
        let expected = (1.0 + 2.0 * s.per_player_damage) * s.boss_damage_mult;
        assert!((bd - expected).abs() < 1e-6);
        // Tier damage multiplier never appears in the boss figure.
        let t = tier(1, 80);
        assert!((damage_multiplier(&t, 3, &s) / (1.0 + 2.0 * s.per_player_damage) - t.damage_mult)
            .abs()
            < 1e-6);
    }

    #[test]
    fn test_tier_curve_linear_then_exponential() {
        // threshold 5, factor 1.15, step 0.10:
        // tier 8 -> 1 + 4*0.10 + 0.10*(1.15^1 + 1.15^2 + 1.15^3)
        let expected = 1.0 + 4.0 * 0.10
            + 0.10 * (1.15f32.powi(1) + 1.15f32.powi(2) + 1.15f32.powi(3));
        let got = tier_multiplier(8, 0.10, 5, 1.15);
        assert!((got - expected).abs() < 1e-5, "got {} expected {}", got, expected);

        assert!((tier_multiplier(1, 0.10, 5, 1.15) - 1.0).abs() < 1e-6);
        assert!((tier_multiplier(3, 0.10, 5, 1.15) - 1.2).abs() < 1e-6);
        assert!((tier_multiplier(5, 0.10, 5, 1.15) - 1.4).abs() < 1e-6);
    }

    #[test]
    fn test_armor_scales_linearly_only() {
        assert!((tier_armor_multiplier(1, 0.05) - 1.0).abs() < 1e-6);
        assert!((tier_armor_multiplier(12, 0.05) - 1.55).abs() < 1e-6);
    }

    #[test]
    fn test_forced_stats_floors_and_ordering() {
        let base = BaseStats { base_hp: 500, base_damage: 10.0, base_armor: 400, attack_power: 70 };
        let stats = forced_stats(&base, 30, 2000, 2.0, 1.5, 1.0, false);
        assert_eq!(stats.level, 30);
        assert_eq!(stats.health, 1000);
        assert!(stats.damage_min >= 1.0);
        assert!(stats.damage_max >= stats.damage_min);
        assert_eq!(stats.movement, MovementKind::Patrol { radius: TRASH_PATROL_RADIUS });

        // Tiny multipliers still produce at least 1 damage and 1 health.
        let weak = forced_stats(&base, 1, 2000, 0.0000001, 0.0000001, 1.0, true);
        assert!(weak.health >= 1);
        assert!(weak.damage_min >= 1.0);
        assert_eq!(weak.movement, MovementKind::IdleAtSpawn);
    }

    #[test]
    fn test_forced_stats_zero_attack_time_defaults() {
        let base = BaseStats { base_hp: 100, base_damage: 10.0, base_armor: 0, attack_power: 14 };
        let a = forced_stats(&base, 10, 0, 1.0, 1.0, 1.0, false);
        let b = forced_stats(&base, 10, 2000, 1.0, 1.0, 1.0, false);
        assert!((a.damage_min - b.damage_min).abs() < 1e-6);
    }
}
