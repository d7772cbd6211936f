//! Entity/pool catalog.
//!
//! Scans the static template data once at startup and partitions it into
//! indexed pools: creatures by type and rank, reward/loot items, base
//! stats by (unit class, level), and spawn points per map. Pure read-only
//! lookups after construction; an admin reload builds a fresh catalog and
//! swaps it into the [`CatalogStore`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::CreatureType;
use crate::world::Position;

/// Template rank, as recorded in the static creature data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatureRank {
    Normal,
    Elite,
    RareElite,
    WorldBoss,
    Rare,
}

/// One creature template from the static data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatureTemplate {
    pub entry: u32,
    pub name: String,
    pub ctype: CreatureType,
    pub min_level: u8,
    pub max_level: u8,
    pub rank: CreatureRank,
    /// Unit class used for the base-stats lookup.
    pub unit_class: u8,
    pub attack_time_ms: u32,
}

/// Canonical base stats for one (unit class, level) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseStats {
    pub base_hp: u32,
    pub base_damage: f32,
    pub base_armor: u32,
    pub attack_power: u32,
}

/// Row shape for the base-stats table in the catalog file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseStatsRow {
    pub unit_class: u8,
    pub level: u8,
    #[serde(flatten)]
    pub stats: BaseStats,
}

/// Item quality, poor through epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemQuality {
    Poor,
    Common,
    Uncommon,
    Rare,
    Epic,
}

/// Broad item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Consumable,
    Weapon,
    Armor,
    TradeGoods,
    Miscellaneous,
}

/// One item template, used for both the reward and the loot pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTemplate {
    pub entry: u32,
    pub name: String,
    /// 0 means "no level requirement" (junk, consumables).
    pub required_level: u8,
    pub quality: ItemQuality,
    pub kind: ItemKind,
    /// For armor: 1=cloth 2=leather 3=mail 4=plate, 0 otherwise.
    pub armor_subclass: u8,
    /// Class eligibility bitmask, bit (class_id - 1); -1 allows all.
    pub allowed_classes: i32,
    pub item_level: u16,
}

impl ItemTemplate {
    pub fn is_equipment(&self) -> bool {
        matches!(self.kind, ItemKind::Weapon | ItemKind::Armor)
    }
}

/// Spawn points of one map, as stored in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSpawnPoints {
    pub map_id: u32,
    pub points: Vec<Position>,
}

/// Raw catalog file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogData {
    pub creatures: Vec<CreatureTemplate>,
    pub base_stats: Vec<BaseStatsRow>,
    pub items: Vec<ItemTemplate>,
    pub spawn_points: Vec<MapSpawnPoints>,
}

/// Indexed pools built once from [`CatalogData`].
pub struct EntityCatalog {
    pub(crate) trash_by_type: HashMap<CreatureType, Vec<CreatureTemplate>>,
    pub(crate) bosses_by_type: HashMap<CreatureType, Vec<CreatureTemplate>>,
    templates_by_entry: HashMap<u32, CreatureTemplate>,
    items_by_entry: HashMap<u32, ItemTemplate>,
    class_level_stats: HashMap<(u8, u8), BaseStats>,
    pub(crate) reward_items: Vec<ItemTemplate>,
    pub(crate) loot_items: Vec<ItemTemplate>,
    spawn_points: HashMap<u32, Vec<Position>>,
}

impl EntityCatalog {
    pub fn build(data: CatalogData) -> Self {
        let mut trash_by_type: HashMap<CreatureType, Vec<CreatureTemplate>> = HashMap::new();
        let mut bosses_by_type: HashMap<CreatureType, Vec<CreatureTemplate>> = HashMap::new();
        let mut templates_by_entry = HashMap::new();

        let mut trash_count = 0u32;
        let mut boss_count = 0u32;
        for c in data.creatures {
            templates_by_entry.insert(c.entry, c.clone());
            match c.rank {
                // World bosses are never eligible
                CreatureRank::WorldBoss => {}
                CreatureRank::Normal => {
                    trash_by_type.entry(c.ctype).or_default().push(c);
                    trash_count += 1;
                }
                CreatureRank::Elite | CreatureRank::RareElite | CreatureRank::Rare => {
                    bosses_by_type.entry(c.ctype).or_default().push(c);
                    boss_count += 1;
                }
            }
        }

        let mut class_level_stats = HashMap::new();
        for row in data.base_stats {
            class_level_stats.insert((row.unit_class, row.level), row.stats);
        }

        let mut reward_items = Vec::new();
        let mut loot_items = Vec::new();
        let mut items_by_entry = HashMap::new();
        for item in data.items {
            items_by_entry.insert(item.entry, item.clone());
            if item.is_equipment()
                && item.required_level > 0
                && item.quality >= ItemQuality::Uncommon
            {
                reward_items.push(item.clone());
            }
            // Equipment with no level requirement is excluded from drops;
            // consumables and junk without one are fine.
            if !item.is_equipment() || item.required_level > 0 {
                loot_items.push(item);
            }
        }

        let spawn_points = data
            .spawn_points
            .into_iter()
            .map(|m| (m.map_id, m.points))
            .collect::<HashMap<_, _>>();

        info!(
            "Catalog built — {} trash creatures, {} potential bosses, {} reward items, {} loot items, {} stat rows",
            trash_count,
            boss_count,
            reward_items.len(),
            loot_items.len(),
            class_level_stats.len()
        );
        for (ctype, vec) in &trash_by_type {
            info!("  Trash {:?}: {} entries", ctype, vec.len());
        }
        for (ctype, vec) in &bosses_by_type {
            info!("  Boss  {:?}: {} entries", ctype, vec.len());
        }

        Self {
            trash_by_type,
            bosses_by_type,
            templates_by_entry,
            items_by_entry,
            class_level_stats,
            reward_items,
            loot_items,
            spawn_points,
        }
    }

    /// Load from a JSON file, falling back to the built-in demo catalog.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<CatalogData>(&content) {
                Ok(data) => {
                    info!("Catalog data loaded from {:?}", path);
                    Self::build(data)
                }
                Err(e) => {
                    warn!("Failed to parse catalog file {:?}: {} — using built-in data", path, e);
                    Self::with_defaults()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read catalog file {:?}: {}", path, e);
                }
                info!("No catalog file at {:?}, using built-in data", path);
                Self::with_defaults()
            }
        }
    }

    /// Built-in demo catalog: a modest creature roster, formula-generated
    /// base stats, and an item pool spread across levels and qualities.
    pub fn with_defaults() -> Self {
        Self::build(default_catalog_data())
    }

    /// Base stats for a (unit class, level) pair, falling back to class 1
    /// at the same level when the exact class row is missing.
    pub fn base_stats(&self, unit_class: u8, level: u8) -> Option<BaseStats> {
        self.class_level_stats
            .get(&(unit_class, level))
            .or_else(|| self.class_level_stats.get(&(1, level)))
            .copied()
    }

    pub fn creature(&self, entry: u32) -> Option<&CreatureTemplate> {
        self.templates_by_entry.get(&entry)
    }

    pub fn item(&self, entry: u32) -> Option<&ItemTemplate> {
        self.items_by_entry.get(&entry)
    }

    pub fn spawn_points(&self, map_id: u32) -> &[Position] {
        self.spawn_points.get(&map_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn trash_pool_size(&self) -> usize {
        self.trash_by_type.values().map(|v| v.len()).sum()
    }

    pub fn boss_pool_size(&self) -> usize {
        self.bosses_by_type.values().map(|v| v.len()).sum()
    }
}

/// Swap-able handle to the current catalog, mirroring `ConfigStore`.
pub struct CatalogStore {
    slot: RwLock<Arc<EntityCatalog>>,
}

impl CatalogStore {
    pub fn new(catalog: EntityCatalog) -> Self {
        Self { slot: RwLock::new(Arc::new(catalog)) }
    }

    pub fn current(&self) -> Arc<EntityCatalog> {
        self.slot.read().clone()
    }

    pub fn replace(&self, catalog: EntityCatalog) {
        *self.slot.write() = Arc::new(catalog);
        info!("Entity catalog swapped");
    }
}

fn default_catalog_data() -> CatalogData {
    use CreatureRank::*;
    use CreatureType::*;

    let roster: &[(u32, &str, CreatureType, u8, u8, CreatureRank, u8, u32)] = &[
        // entry, name, type, min, max, rank, unit class, attack time ms
        (1001, "Carrion Shambler", Undead, 4, 9, Normal, 1, 2000),
        (1002, "Gravebound Archer", Undead, 12, 18, Normal, 1, 2200),
        (1003, "Plague Acolyte", Undead, 24, 31, Normal, 8, 2000),
        (1004, "Frostmarrow Revenant", Undead, 55, 62, Normal, 2, 1800),
        (1005, "Bonegrinder Behemoth", Undead, 38, 44, Elite, 1, 2400),
        (1006, "The Pale Warden", Undead, 70, 76, RareElite, 2, 2000),
        (1011, "Mire Stalker", Beast, 6, 12, Normal, 1, 1800),
        (1012, "Razorquill Matriarch", Beast, 20, 26, Normal, 1, 1600),
        (1013, "Duskmane Prowler", Beast, 41, 48, Normal, 1, 1500),
        (1014, "Ironhide Alpha", Beast, 33, 39, Elite, 1, 2100),
        (1015, "Old Thornback", Beast, 62, 70, Rare, 1, 2300),
        (1021, "Cinder Imp", Demon, 9, 15, Normal, 8, 2000),
        (1022, "Voidclaw Tormentor", Demon, 35, 42, Normal, 2, 1900),
        (1023, "Pitspawn Overseer", Demon, 58, 66, Elite, 1, 2200),
        (1031, "Galestone Whirl", Elemental, 14, 20, Normal, 8, 2000),
        (1032, "Magmaheart Colossus", Elemental, 47, 54, Elite, 1, 2600),
        (1033, "Tideborn Fury", Elemental, 27, 33, Normal, 8, 1900),
        (1041, "Hillcrusher Brute", Giant, 30, 37, Normal, 1, 2500),
        (1042, "Stonefist Tyrant", Giant, 66, 74, Elite, 1, 2700),
        (1051, "Blackfen Marauder", Humanoid, 10, 16, Normal, 1, 2000),
        (1052, "Cultist Flameweaver", Humanoid, 29, 36, Normal, 8, 2100),
        (1053, "Renegade Bladesworn", Humanoid, 49, 56, Normal, 1, 1700),
        (1054, "Warlord Hargrim", Humanoid, 43, 50, Elite, 1, 2200),
        (1055, "Captain Veldra", Humanoid, 75, 82, RareElite, 1, 2000),
        (1061, "Clockwork Sentry", Mechanical, 18, 24, Normal, 2, 2000),
        (1062, "Siege Automaton", Mechanical, 52, 60, Elite, 2, 2800),
        (1071, "Emberwing Drake", Dragonkin, 25, 32, Normal, 1, 1900),
        (1072, "Azurescale Broodguard", Dragonkin, 59, 67, Elite, 2, 2100),
        (1073, "Korvash the Ancient", Dragonkin, 78, 83, RareElite, 1, 2400),
        // World bosses exist in the data but are excluded from the pools.
        (1099, "Maw of the Deep", Beast, 80, 83, WorldBoss, 1, 3000),
    ];

    let creatures = roster
        .iter()
        .map(|&(entry, name, ctype, min_level, max_level, rank, unit_class, attack_time_ms)| {
            CreatureTemplate {
                entry,
                name: name.to_string(),
                ctype,
                min_level,
                max_level,
                rank,
                unit_class,
                attack_time_ms,
            }
        })
        .collect();

    // Base stats for unit classes 1 (melee), 2 (hybrid), 8 (caster) at
    // every level. Simple monotone curves; hosts feed real tables.
    let mut base_stats = Vec::new();
    for unit_class in [1u8, 2, 8] {
        for level in 1..=crate::MAX_CREATURE_LEVEL {
            let l = level as f32;
            let (hp_scale, dmg_scale, armor_scale) = match unit_class {
                1 => (1.0, 1.0, 1.0),
                2 => (0.85, 0.95, 0.8),
                _ => (0.7, 1.1, 0.5),
            };
            base_stats.push(BaseStatsRow {
                unit_class,
                level,
                stats: BaseStats {
                    base_hp: ((40.0 + l * 14.0 + l * l * 0.6) * hp_scale) as u32,
                    base_damage: (1.5 + l * 0.9) * dmg_scale,
                    base_armor: ((l * 20.0) * armor_scale) as u32,
                    attack_power: (l * 3.0) as u32,
                },
            });
        }
    }

    // Item pool: weapons and armor at 5-level steps across qualities,
    // plus low-quality junk and consumables for trash drops.
    let mut items = Vec::new();
    let mut next_entry = 5000u32;
    for step in 1..=16u32 {
        let required_level = (step * 5).min(80) as u8;
        for &(quality, tag) in &[
            (ItemQuality::Uncommon, "Tempered"),
            (ItemQuality::Rare, "Runebound"),
            (ItemQuality::Epic, "Sovereign"),
        ] {
            items.push(ItemTemplate {
                entry: next_entry,
                name: format!("{} Blade of Rank {}", tag, step),
                required_level,
                quality,
                kind: ItemKind::Weapon,
                armor_subclass: 0,
                allowed_classes: -1,
                item_level: required_level as u16 + 10,
            });
            next_entry += 1;
            for subclass in 1..=4u8 {
                let piece = match subclass {
                    1 => "Robe",
                    2 => "Jerkin",
                    3 => "Hauberk",
                    _ => "Breastplate",
                };
                items.push(ItemTemplate {
                    entry: next_entry,
                    name: format!("{} {} of Rank {}", tag, piece, step),
                    required_level,
                    quality,
                    kind: ItemKind::Armor,
                    armor_subclass: subclass,
                    allowed_classes: -1,
                    item_level: required_level as u16 + 8,
                });
                next_entry += 1;
            }
        }
    }
    for step in 1..=16u32 {
        let level = (step * 5).min(80) as u8;
        items.push(ItemTemplate {
            entry: next_entry,
            name: format!("Tattered Relic No. {}", step),
            required_level: 0,
            quality: ItemQuality::Poor,
            kind: ItemKind::Miscellaneous,
            armor_subclass: 0,
            allowed_classes: -1,
            item_level: level as u16,
        });
        next_entry += 1;
        items.push(ItemTemplate {
            entry: next_entry,
            name: format!("Field Ration No. {}", step),
            required_level: 0,
            quality: ItemQuality::Common,
            kind: ItemKind::Consumable,
            armor_subclass: 0,
            allowed_classes: -1,
            item_level: level as u16,
        });
        next_entry += 1;
    }

    // Spawn points per default dungeon: a trail leading away from the
    // entrance, with the far end reserved for the boss placement.
    let dungeon_entrances: &[(u32, [f32; 3])] = &[
        (101, [-21.5, 4.0, 33.2]),
        (102, [8.0, -2.5, -14.7]),
        (103, [44.1, 10.0, 5.3]),
        (104, [-3.9, 0.0, 61.8]),
        (105, [17.4, 22.0, -48.0]),
        (106, [-55.0, -8.0, 12.6]),
        (107, [2.2, 15.5, 27.9]),
        (108, [-12.8, 3.0, -71.4]),
        (109, [63.7, 40.0, -9.1]),
        (110, [-30.0, 12.0, 55.5]),
        (111, [9.6, -6.0, -25.3]),
        (112, [-47.2, 18.0, -36.8]),
    ];
    let spawn_points = dungeon_entrances
        .iter()
        .map(|&(map_id, [ex, ey, ez])| {
            let points = (1..=14u32)
                .map(|i| {
                    let d = i as f32;
                    Position::new(
                        ex + d * 7.0 + if i % 2 == 0 { 3.0 } else { -2.0 },
                        ey,
                        ez + d * 4.5 + if i % 3 == 0 { -4.0 } else { 2.0 },
                    )
                })
                .collect();
            MapSpawnPoints { map_id, points }
        })
        .collect();

    CatalogData { creatures, base_stats, items, spawn_points }
}
