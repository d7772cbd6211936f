//! Engine configuration.
//!
//! Static tables (difficulty tiers, themes, dungeon catalog) plus the
//! scalar tunables. Loaded once from `engine.json` when present, otherwise
//! from hardcoded defaults. Reload builds a whole new table set and swaps
//! it into the [`ConfigStore`]; the managers re-resolve through the store
//! on every operation, so a swap can never leave them holding entries from
//! a previous table.

use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::world::Position;

/// Creature categories a theme can constrain a run to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreatureType {
    Beast,
    Dragonkin,
    Demon,
    Elemental,
    Giant,
    Undead,
    Humanoid,
    Mechanical,
}

/// One row in the difficulty table. Selected once per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyTier {
    pub id: u32,
    pub name: String,
    pub min_level: u8,
    pub max_level: u8,
    pub health_mult: f32,
    pub damage_mult: f32,
    pub reward_mult: f32,
    pub mob_count_mult: f32,
}

impl DifficultyTier {
    /// A player can select this difficulty once they meet the minimum level.
    pub fn is_valid_for_level(&self, level: u8) -> bool {
        level >= self.min_level
    }

    /// True while the player is within the intended band (not over-leveled).
    pub fn is_on_level_for(&self, level: u8) -> bool {
        level >= self.min_level && level <= self.max_level
    }

    pub fn midpoint(&self) -> u8 {
        ((self.min_level as u16 + self.max_level as u16) / 2) as u8
    }
}

/// A theme groups creature types. An empty list means "any".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub creature_types: Vec<CreatureType>,
}

impl Theme {
    pub fn is_any(&self) -> bool {
        self.creature_types.is_empty()
    }

    pub fn matches(&self, ctype: CreatureType) -> bool {
        self.is_any() || self.creature_types.contains(&ctype)
    }
}

/// Static metadata about one dungeon map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DungeonInfo {
    pub map_id: u32,
    pub name: String,
    pub min_level: u8,
    pub max_level: u8,
    pub entrance: Option<Position>,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// Creature scaling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSettings {
    /// Creatures are selected within effective level ± this band.
    pub level_band: u8,
    pub per_player_health: f32,
    pub per_player_damage: f32,
    pub solo_multiplier: f32,
    pub elite_health_mult: f32,
    pub elite_damage_mult: f32,
    pub boss_health_mult: f32,
    pub boss_damage_mult: f32,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            level_band: 3,
            per_player_health: 0.25,
            per_player_damage: 0.10,
            solo_multiplier: 0.50,
            elite_health_mult: 2.0,
            elite_damage_mult: 1.5,
            boss_health_mult: 8.0,
            boss_damage_mult: 1.5,
        }
    }
}

/// Reward tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSettings {
    pub xp_multiplier: f32,
    /// Percent chances for the completion item quality roll.
    pub rare_chance: u32,
    pub epic_chance: u32,
}

impl Default for RewardSettings {
    fn default() -> Self {
        Self { xp_multiplier: 1.0, rare_chance: 40, epic_chance: 15 }
    }
}

/// Population tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationSettings {
    pub boss_count: u32,
    /// Percent chance for a trash spawn to be promoted to elite.
    pub elite_chance: u32,
}

impl Default for PopulationSettings {
    fn default() -> Self {
        Self { boss_count: 1, elite_chance: 20 }
    }
}

/// Timers and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub cooldown_minutes: u32,
    pub time_limit_enabled: bool,
    pub time_limit_minutes: u32,
    pub max_concurrent_runs: u32,
    /// Seconds a completed session lingers before teardown.
    pub completion_teleport_delay: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            cooldown_minutes: 5,
            time_limit_enabled: false,
            time_limit_minutes: 30,
            max_concurrent_runs: 20,
            completion_teleport_delay: 30,
        }
    }
}

/// Roguelike progression tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoguelikeSettings {
    pub enabled: bool,
    /// Grace window after each floor teleport, in seconds.
    pub transition_grace_secs: u64,
    pub hp_scaling_per_tier: f32,
    pub dmg_scaling_per_tier: f32,
    pub armor_scaling_per_tier: f32,
    /// Tiers at or below this scale linearly; beyond it, growth compounds.
    pub exponential_threshold: u32,
    pub exponential_factor: f32,
    pub affix_start_tier: u32,
    pub second_affix_tier: u32,
    pub third_affix_tier: u32,
}

impl Default for RoguelikeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            transition_grace_secs: 30,
            hp_scaling_per_tier: 0.10,
            dmg_scaling_per_tier: 0.08,
            armor_scaling_per_tier: 0.05,
            exponential_threshold: 5,
            exponential_factor: 1.15,
            affix_start_tier: 3,
            second_affix_tier: 7,
            third_affix_tier: 10,
        }
    }
}

/// Everything the engine reads at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub difficulties: Vec<DifficultyTier>,
    pub themes: Vec<Theme>,
    pub dungeons: Vec<DungeonInfo>,
    pub scaling: ScalingSettings,
    pub rewards: RewardSettings,
    pub population: PopulationSettings,
    pub timers: TimerSettings,
    pub roguelike: RoguelikeSettings,
    /// When non-empty, only these maps are offered.
    pub dungeon_allowlist: Vec<u32>,
    pub dungeon_denylist: Vec<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            difficulties: default_difficulties(),
            themes: default_themes(),
            dungeons: default_dungeons(),
            scaling: ScalingSettings::default(),
            rewards: RewardSettings::default(),
            population: PopulationSettings::default(),
            timers: TimerSettings::default(),
            roguelike: RoguelikeSettings::default(),
            dungeon_allowlist: Vec::new(),
            dungeon_denylist: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read config file {:?}: {}", path, e);
                }
                info!("No config file at {:?}, using built-in defaults", path);
                return Self::default().sanitized();
            }
        };

        match serde_json::from_str::<EngineConfig>(&content) {
            Ok(cfg) => {
                let cfg = cfg.sanitized();
                info!(
                    "Config loaded from {:?} — {} difficulties, {} themes, {} dungeons",
                    path,
                    cfg.difficulties.len(),
                    cfg.themes.len(),
                    cfg.dungeons.len()
                );
                cfg
            }
            Err(e) => {
                error!("Failed to parse {:?}: {} — using built-in defaults", path, e);
                Self::default().sanitized()
            }
        }
    }

    /// Apply allow/deny lists and guarantee non-empty tables.
    fn sanitized(mut self) -> Self {
        if !self.dungeon_allowlist.is_empty() {
            let allow = self.dungeon_allowlist.clone();
            self.dungeons.retain(|d| allow.contains(&d.map_id));
        }
        if !self.dungeon_denylist.is_empty() {
            let deny = self.dungeon_denylist.clone();
            self.dungeons.retain(|d| !deny.contains(&d.map_id));
        }

        if self.difficulties.is_empty() {
            warn!("No difficulties configured, using defaults");
            self.difficulties = default_difficulties();
        }
        if self.themes.is_empty() {
            warn!("No themes configured, using defaults");
            self.themes = default_themes();
        }
        self
    }

    pub fn difficulty(&self, id: u32) -> Option<&DifficultyTier> {
        self.difficulties.iter().find(|d| d.id == id)
    }

    pub fn theme(&self, id: u32) -> Option<&Theme> {
        self.themes.iter().find(|t| t.id == id)
    }

    pub fn dungeon(&self, map_id: u32) -> Option<&DungeonInfo> {
        self.dungeons.iter().find(|d| d.map_id == map_id)
    }

    pub fn difficulties_for_level(&self, level: u8) -> Vec<&DifficultyTier> {
        self.difficulties.iter().filter(|d| d.is_valid_for_level(level)).collect()
    }

    /// Available dungeons whose level range intersects [min, max].
    pub fn dungeons_for_level(&self, min_level: u8, max_level: u8) -> Vec<&DungeonInfo> {
        self.dungeons
            .iter()
            .filter(|d| d.available && d.max_level >= min_level && d.min_level <= max_level)
            .collect()
    }
}

fn default_difficulties() -> Vec<DifficultyTier> {
    vec![
        DifficultyTier {
            id: 1,
            name: "Novice".into(),
            min_level: 1,
            max_level: 19,
            health_mult: 1.0,
            damage_mult: 1.0,
            reward_mult: 1.0,
            mob_count_mult: 1.0,
        },
        DifficultyTier {
            id: 2,
            name: "Veteran".into(),
            min_level: 20,
            max_level: 39,
            health_mult: 1.2,
            damage_mult: 1.1,
            reward_mult: 1.25,
            mob_count_mult: 1.0,
        },
        DifficultyTier {
            id: 3,
            name: "Champion".into(),
            min_level: 40,
            max_level: 59,
            health_mult: 1.5,
            damage_mult: 1.25,
            reward_mult: 1.5,
            mob_count_mult: 1.1,
        },
        DifficultyTier {
            id: 4,
            name: "Legend".into(),
            min_level: 60,
            max_level: 83,
            health_mult: 2.0,
            damage_mult: 1.5,
            reward_mult: 2.0,
            mob_count_mult: 1.2,
        },
    ]
}

fn default_themes() -> Vec<Theme> {
    use CreatureType::*;
    vec![
        Theme { id: 1, name: "Restless Dead".into(), creature_types: vec![Undead] },
        Theme { id: 2, name: "Wild Hunt".into(), creature_types: vec![Beast] },
        Theme { id: 3, name: "Demonfall".into(), creature_types: vec![Demon] },
        Theme { id: 4, name: "Primal Surge".into(), creature_types: vec![Elemental, Giant] },
        Theme { id: 5, name: "Ironworks".into(), creature_types: vec![Mechanical] },
        Theme { id: 6, name: "Warband".into(), creature_types: vec![Humanoid] },
        Theme { id: 7, name: "Brood of the Wyrm".into(), creature_types: vec![Dragonkin] },
        Theme { id: 8, name: "Anything Goes".into(), creature_types: vec![] },
    ]
}

fn default_dungeons() -> Vec<DungeonInfo> {
    // Built-in dungeon catalog. A host normally overrides this via
    // engine.json with its own maps and entrance coordinates.
    let defs: &[(u32, &str, u8, u8, [f32; 3])] = &[
        (101, "Rotgrub Warrens", 8, 18, [-21.5, 4.0, 33.2]),
        (102, "Sunken Hollow", 12, 24, [8.0, -2.5, -14.7]),
        (103, "Emberfall Mine", 16, 28, [44.1, 10.0, 5.3]),
        (104, "Gloomspore Caverns", 22, 34, [-3.9, 0.0, 61.8]),
        (105, "Bleakwind Keep", 28, 40, [17.4, 22.0, -48.0]),
        (106, "The Drowned Vault", 34, 46, [-55.0, -8.0, 12.6]),
        (107, "Ashen Sanctum", 40, 52, [2.2, 15.5, 27.9]),
        (108, "Thornveil Depths", 46, 58, [-12.8, 3.0, -71.4]),
        (109, "Stormrest Spire", 52, 64, [63.7, 40.0, -9.1]),
        (110, "The Shattered Bastion", 58, 70, [-30.0, 12.0, 55.5]),
        (111, "Nightfen Barrow", 64, 76, [9.6, -6.0, -25.3]),
        (112, "Halls of the Forgotten", 70, 83, [-47.2, 18.0, -36.8]),
    ];

    defs.iter()
        .map(|&(map_id, name, lo, hi, [x, y, z])| DungeonInfo {
            map_id,
            name: name.to_string(),
            min_level: lo,
            max_level: hi,
            entrance: Some(Position::new(x, y, z)),
            available: true,
        })
        .collect()
}

/// Swap-able handle to the current configuration.
///
/// Managers keep an `Arc<ConfigStore>` and call [`ConfigStore::current`]
/// at the top of every operation; an admin reload replaces the inner Arc
/// without touching in-flight operations.
pub struct ConfigStore {
    slot: RwLock<Arc<EngineConfig>>,
}

impl ConfigStore {
    pub fn new(config: EngineConfig) -> Self {
        Self { slot: RwLock::new(Arc::new(config)) }
    }

    pub fn current(&self) -> Arc<EngineConfig> {
        self.slot.read().clone()
    }

    pub fn replace(&self, config: EngineConfig) {
        *self.slot.write() = Arc::new(config);
        info!("Engine configuration swapped");
    }
}
