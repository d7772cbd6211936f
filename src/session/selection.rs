//! Creature, reward and loot selection.
//!
//! Theme-constrained creature picks and item picks share one shape: build
//! candidate lists through a cascade of progressively looser filters, stop
//! at the first non-empty list, then pick uniformly at random. Selection
//! never aborts a run; when every cascade step comes up empty the caller
//! degrades (skips the drop or grants gold only).

use std::collections::HashMap;

use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::{CreatureTemplate, EntityCatalog, ItemKind, ItemQuality, ItemTemplate};
use crate::config::{CreatureType, Theme};

/// Select a creature entry for a theme.
///
/// Boss picks cascade: themed bosses, themed trash promoted to boss,
/// any-type bosses, any-type trash. Trash picks: themed trash, any-type
/// trash. Original template level is irrelevant — every summon is
/// force-scaled to the session's target level afterwards, so each theme
/// has the whole template pool of its types available.
pub fn select_creature<R: Rng>(
    catalog: &EntityCatalog,
    theme: &Theme,
    is_boss: bool,
    rng: &mut R,
) -> Option<u32> {
    let themed_entries = |pool: &HashMap<CreatureType, Vec<CreatureTemplate>>| {
        let mut out = Vec::new();
        for (ctype, templates) in pool {
            if theme.matches(*ctype) {
                out.extend(templates.iter().map(|t| t.entry));
            }
        }
        out
    };
    let all_entries = |pool: &HashMap<CreatureType, Vec<CreatureTemplate>>| {
        pool.values().flatten().map(|t| t.entry).collect::<Vec<u32>>()
    };

    let cascade: Vec<Vec<u32>> = if is_boss {
        vec![
            themed_entries(&catalog.bosses_by_type),
            themed_entries(&catalog.trash_by_type),
            all_entries(&catalog.bosses_by_type),
            all_entries(&catalog.trash_by_type),
        ]
    } else {
        vec![themed_entries(&catalog.trash_by_type), all_entries(&catalog.trash_by_type)]
    };

    for (step, candidates) in cascade.iter().enumerate() {
        if !candidates.is_empty() {
            if step > 0 {
                warn!(
                    "No '{}' creatures at cascade step {} (boss={}), using fallback pool",
                    theme.name, step, is_boss
                );
            }
            debug!(
                "{} candidates for theme '{}' (boss={})",
                candidates.len(),
                theme.name,
                is_boss
            );
            return candidates.choose(rng).copied();
        }
    }

    warn!("Zero creature candidates for theme '{}' (boss={})", theme.name, is_boss);
    None
}

/// Highest armor subclass a class can wear: 1=cloth 2=leather 3=mail
/// 4=plate.
pub fn max_armor_subclass(class: u8) -> u8 {
    match class {
        5 | 8 | 9 => 1,
        4 | 11 => 2,
        3 | 7 => 3,
        1 | 2 | 6 => 4,
        _ => 4,
    }
}

/// Eligibility bitmask for a class id, bit (class - 1); unknown ids allow
/// everything.
pub fn class_bitmask(class: u8) -> i32 {
    if class == 0 || class > 11 {
        0x7FF
    } else {
        1 << (class - 1)
    }
}

fn usable_by_class(item: &ItemTemplate, class: u8) -> bool {
    if item.allowed_classes != -1 && (item.allowed_classes & class_bitmask(class)) == 0 {
        return false;
    }
    if item.kind == ItemKind::Armor
        && item.armor_subclass > 0
        && item.armor_subclass <= 4
        && item.armor_subclass > max_armor_subclass(class)
    {
        return false;
    }
    true
}

/// Widening windows below the recipient level for reward selection.
/// `None` drops the lower bound entirely.
const REWARD_WINDOWS: [Option<u8>; 5] = [Some(3), Some(8), Some(15), Some(25), None];

fn reward_candidates<'a>(
    items: &'a [ItemTemplate],
    level: u8,
    quality: ItemQuality,
    class: u8,
    below: Option<u8>,
) -> Vec<&'a ItemTemplate> {
    let lo = below.map(|b| level.saturating_sub(b)).unwrap_or(0);
    items
        .iter()
        .filter(|i| i.quality == quality)
        // Rewards never exceed the recipient's level.
        .filter(|i| i.required_level <= level && i.required_level >= lo)
        .filter(|i| usable_by_class(i, class))
        .collect()
}

/// Select a completion reward of exactly `quality` for a recipient.
///
/// Walks the widening level windows; returns the first non-empty window's
/// uniform pick.
pub fn select_reward_item<R: Rng>(
    items: &[ItemTemplate],
    level: u8,
    quality: ItemQuality,
    class: u8,
    rng: &mut R,
) -> Option<u32> {
    for below in REWARD_WINDOWS {
        let candidates = reward_candidates(items, level, quality, class, below);
        if !candidates.is_empty() {
            return candidates.choose(rng).map(|i| i.entry);
        }
    }
    None
}

/// Reward selection with the full fallback ladder: requested quality
/// through the windows, then each lower quality down to uncommon, then a
/// soft pass that drops the level constraint but keeps quality and class
/// filters.
pub fn select_reward_with_fallbacks<R: Rng>(
    items: &[ItemTemplate],
    level: u8,
    quality: ItemQuality,
    class: u8,
    rng: &mut R,
) -> Option<u32> {
    if let Some(entry) = select_reward_item(items, level, quality, class, rng) {
        return Some(entry);
    }

    let mut q = quality;
    while q > ItemQuality::Uncommon {
        q = match q {
            ItemQuality::Epic => ItemQuality::Rare,
            _ => ItemQuality::Uncommon,
        };
        warn!("No quality {:?} reward at level {} for class {}, trying {:?}", quality, level, class, q);
        if let Some(entry) = select_reward_item(items, level, q, class, rng) {
            return Some(entry);
        }
    }

    // Soft fallback: no level constraint at all.
    let mut q = quality;
    loop {
        let candidates: Vec<&ItemTemplate> = items
            .iter()
            .filter(|i| i.quality == q)
            .filter(|i| usable_by_class(i, class))
            .collect();
        if let Some(item) = candidates.choose(rng) {
            warn!("Reward for level {} class {} found only outside the level windows", level, class);
            return Some(item.entry);
        }
        if q == ItemQuality::Uncommon {
            return None;
        }
        q = match q {
            ItemQuality::Epic => ItemQuality::Rare,
            _ => ItemQuality::Uncommon,
        };
    }
}

/// Loot windows: (levels below, levels above), strict to very wide.
const LOOT_WINDOWS: [(u8, u8); 4] = [(3, 1), (5, 2), (8, 3), (15, 5)];

/// Select a kill-loot item within a quality range.
///
/// `class` filters equipment usability; pass `None` for unfiltered junk
/// rolls. Items without a level requirement are sanity-checked against an
/// expected item-level ceiling instead.
pub fn select_loot_item<R: Rng>(
    items: &[ItemTemplate],
    level: u8,
    min_quality: ItemQuality,
    max_quality: ItemQuality,
    equipment_only: bool,
    class: Option<u8>,
    rng: &mut R,
) -> Option<u32> {
    let expected_max_ilvl = level as u16 * 2 + 10;

    let base_filter = |i: &&ItemTemplate| -> bool {
        if i.quality < min_quality || i.quality > max_quality {
            return false;
        }
        if equipment_only && !i.is_equipment() {
            return false;
        }
        if (equipment_only || i.is_equipment()) && class.map(|c| !usable_by_class(i, c)).unwrap_or(false)
        {
            return false;
        }
        true
    };

    for (below, above) in LOOT_WINDOWS {
        let lo = level.saturating_sub(below);
        let hi = level.saturating_add(above).min(crate::MAX_CREATURE_LEVEL);
        let candidates: Vec<&ItemTemplate> = items
            .iter()
            .filter(base_filter)
            .filter(|i| {
                if i.required_level > 0 {
                    i.required_level >= lo && i.required_level <= hi
                } else {
                    i.item_level <= expected_max_ilvl
                }
            })
            .collect();
        if !candidates.is_empty() {
            return candidates.choose(rng).map(|i| i.entry);
        }
    }

    // Final fallback: drop the level window, keep the item-level ceiling.
    let candidates: Vec<&ItemTemplate> = items
        .iter()
        .filter(base_filter)
        .filter(|i| i.item_level <= expected_max_ilvl)
        .collect();
    candidates.choose(rng).map(|i| i.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        BaseStatsRow, CatalogData, CreatureRank, CreatureTemplate, ItemKind, MapSpawnPoints,
    };
    use crate::config::CreatureType;

    fn creature(
        entry: u32,
        ctype: CreatureType,
        rank: CreatureRank,
    ) -> CreatureTemplate {
        CreatureTemplate {
            entry,
            name: format!("creature {}", entry),
            ctype,
            min_level: 1,
            max_level: 80,
            rank,
            unit_class: 1,
            attack_time_ms: 2000,
        }
    }

    fn item(
        entry: u32,
        required_level: u8,
        quality: ItemQuality,
        kind: ItemKind,
        armor_subclass: u8,
    ) -> ItemTemplate {
        ItemTemplate {
            entry,
            name: format!("item {}", entry),
            required_level,
            quality,
            kind,
            armor_subclass,
            allowed_classes: -1,
            item_level: required_level as u16 + 10,
        }
    }

    fn catalog_with(creatures: Vec<CreatureTemplate>) -> EntityCatalog {
        EntityCatalog::build(CatalogData {
            creatures,
            base_stats: Vec::<BaseStatsRow>::new(),
            items: Vec::new(),
            spawn_points: Vec::<MapSpawnPoints>::new(),
        })
    }

    fn theme_of(types: Vec<CreatureType>) -> Theme {
        Theme { id: 1, name: "Test".into(), creature_types: types }
    }

    #[test]
    fn test_boss_cascade_prefers_themed_bosses() {
        let catalog = catalog_with(vec![
            creature(1, CreatureType::Undead, CreatureRank::Elite),
            creature(2, CreatureType::Undead, CreatureRank::Normal),
            creature(3, CreatureType::Beast, CreatureRank::Elite),
        ]);
        let theme = theme_of(vec![CreatureType::Undead]);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(select_creature(&catalog, &theme, true, &mut rng), Some(1));
        }
    }

    #[test]
    fn test_boss_cascade_promotes_themed_trash() {
        // No undead bosses: themed trash wins over the beast boss.
        let catalog = catalog_with(vec![
            creature(2, CreatureType::Undead, CreatureRank::Normal),
            creature(3, CreatureType::Beast, CreatureRank::Elite),
        ]);
        let theme = theme_of(vec![CreatureType::Undead]);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(select_creature(&catalog, &theme, true, &mut rng), Some(2));
        }
    }

    #[test]
    fn test_boss_cascade_falls_through_to_any_type() {
        let catalog = catalog_with(vec![creature(3, CreatureType::Beast, CreatureRank::Elite)]);
        let theme = theme_of(vec![CreatureType::Undead]);
        let mut rng = rand::thread_rng();
        assert_eq!(select_creature(&catalog, &theme, true, &mut rng), Some(3));
    }

    #[test]
    fn test_trash_cascade_and_empty_pool() {
        let catalog = catalog_with(vec![creature(3, CreatureType::Beast, CreatureRank::Normal)]);
        let theme = theme_of(vec![CreatureType::Undead]);
        let mut rng = rand::thread_rng();
        assert_eq!(select_creature(&catalog, &theme, false, &mut rng), Some(3));

        let empty = catalog_with(vec![]);
        assert_eq!(select_creature(&empty, &theme, false, &mut rng), None);
    }

    #[test]
    fn test_wildcard_theme_uses_all_types() {
        let catalog = catalog_with(vec![
            creature(1, CreatureType::Undead, CreatureRank::Normal),
            creature(2, CreatureType::Beast, CreatureRank::Normal),
        ]);
        let theme = theme_of(vec![]);
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(select_creature(&catalog, &theme, false, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_reward_widening_window_finds_lower_level_epic() {
        // Quality 4 request at level 40: nothing strict, one epic at 30
        // inside the +-15 window. It must be returned, not an empty result.
        let items = vec![
            item(10, 30, ItemQuality::Epic, ItemKind::Weapon, 0),
            item(11, 40, ItemQuality::Rare, ItemKind::Weapon, 0),
        ];
        let mut rng = rand::thread_rng();
        assert_eq!(
            select_reward_item(&items, 40, ItemQuality::Epic, 1, &mut rng),
            Some(10)
        );
    }

    #[test]
    fn test_reward_never_exceeds_recipient_level() {
        let items = vec![
            item(10, 45, ItemQuality::Epic, ItemKind::Weapon, 0),
            item(11, 38, ItemQuality::Epic, ItemKind::Weapon, 0),
        ];
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(
                select_reward_item(&items, 40, ItemQuality::Epic, 1, &mut rng),
                Some(11)
            );
        }
    }

    #[test]
    fn test_reward_quality_fallback_ladder() {
        let items = vec![item(12, 40, ItemQuality::Uncommon, ItemKind::Weapon, 0)];
        let mut rng = rand::thread_rng();
        assert_eq!(
            select_reward_with_fallbacks(&items, 40, ItemQuality::Epic, 1, &mut rng),
            Some(12)
        );
        assert_eq!(select_reward_with_fallbacks(&[], 40, ItemQuality::Epic, 1, &mut rng), None);
    }

    #[test]
    fn test_armor_proficiency_enforced() {
        // Class 8 (caster) can only wear cloth.
        let items = vec![
            item(20, 40, ItemQuality::Rare, ItemKind::Armor, 4),
            item(21, 40, ItemQuality::Rare, ItemKind::Armor, 1),
        ];
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(
                select_reward_item(&items, 40, ItemQuality::Rare, 8, &mut rng),
                Some(21)
            );
        }
        // A plate wearer may receive either piece.
        assert!(select_reward_item(&items, 40, ItemQuality::Rare, 1, &mut rng).is_some());
    }

    #[test]
    fn test_class_mask_enforced() {
        let mut restricted = item(30, 40, ItemQuality::Rare, ItemKind::Weapon, 0);
        restricted.allowed_classes = class_bitmask(4); // rogue only
        let items = vec![restricted];
        let mut rng = rand::thread_rng();
        assert_eq!(select_reward_item(&items, 40, ItemQuality::Rare, 1, &mut rng), None);
        assert_eq!(select_reward_item(&items, 40, ItemQuality::Rare, 4, &mut rng), Some(30));
    }

    #[test]
    fn test_loot_windows_then_ilvl_capped_fallback() {
        let items = vec![
            item(40, 12, ItemQuality::Uncommon, ItemKind::Weapon, 0),
            // No level requirement: gated by the item-level ceiling.
            ItemTemplate {
                entry: 41,
                name: "junk".into(),
                required_level: 0,
                quality: ItemQuality::Poor,
                kind: ItemKind::Miscellaneous,
                armor_subclass: 0,
                allowed_classes: -1,
                item_level: 200,
            },
        ];
        let mut rng = rand::thread_rng();
        // Level 10: the strict window tops out at 11, the second window
        // reaches 12 and catches the weapon.
        assert_eq!(
            select_loot_item(&items, 10, ItemQuality::Uncommon, ItemQuality::Epic, true, Some(1), &mut rng),
            Some(40)
        );
        // Item level 200 junk stays above the ceiling (level*2+10) at any
        // player level, so it never drops.
        assert_eq!(
            select_loot_item(&items, 10, ItemQuality::Poor, ItemQuality::Common, false, None, &mut rng),
            None
        );
        assert_eq!(
            select_loot_item(&items, 80, ItemQuality::Poor, ItemQuality::Common, false, None, &mut rng),
            None
        );
    }
}
