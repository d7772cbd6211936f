//! World query/mutate surface.
//!
//! The engine never touches game objects directly. Every participant and
//! summoned creature is an opaque stable id, resolved through [`WorldOps`]
//! on each access. The hosting server provides the real implementation;
//! [`memory::MemoryWorld`] is an in-process implementation used by the
//! bundled host binary and the tests.

mod memory;

pub use memory::MemoryWorld;

use serde::{Deserialize, Serialize};

/// Opaque id of a player-controlled actor.
pub type ActorId = u64;

/// Opaque id of a world entity (creature) the engine summoned or tracks.
pub type EntityId = u64;

/// A point in the world, with facing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub orientation: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, orientation: 0.0 }
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Where an actor currently is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub map_id: u32,
    pub instance_id: u32,
    pub position: Position,
}

/// Rank a summoned entity is displayed and fought at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRank {
    Normal,
    Elite,
    Boss,
}

/// Movement behavior applied when an entity is force-scaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MovementKind {
    /// Hold position at the spawn point (bosses).
    IdleAtSpawn,
    /// Wander within a small radius of the spawn point (trash).
    Patrol { radius: f32 },
}

/// Full stat block computed by the scaling engine and applied to an entity.
///
/// Applying this also clears every elemental resistance and mechanic/school
/// immunity the template carried: those values belong to the entity's
/// original level and must not leak through.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedStats {
    pub level: u8,
    pub health: u32,
    pub damage_min: f32,
    pub damage_max: f32,
    pub armor: u32,
    pub movement: MovementKind,
}

/// Snapshot of a world entity returned by region queries.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub template: u32,
    pub rank: EntityRank,
    pub alive: bool,
    pub position: Position,
}

/// Outcome of granting an item to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemDelivery {
    /// Stored directly in the actor's inventory.
    Inventory,
    /// Inventory was full; the item was delivered by mail instead.
    Mailed,
    /// The item could not be delivered at all.
    Failed,
}

/// Abstract world surface the engine orchestrates against.
///
/// All methods are synchronous; the engine calls them from within its tick.
/// Implementations must tolerate ids that no longer resolve (logged-out
/// actors, despawned entities) by returning `None`/`false` rather than
/// panicking.
pub trait WorldOps: Send + Sync {
    // --- Actors ---
    fn actor_name(&self, actor: ActorId) -> Option<String>;
    fn actor_level(&self, actor: ActorId) -> Option<u8>;
    /// Class id used for item eligibility (armor proficiency, class masks).
    fn actor_class(&self, actor: ActorId) -> Option<u8>;
    fn actor_location(&self, actor: ActorId) -> Option<Location>;
    fn actor_alive(&self, actor: ActorId) -> bool;
    fn actor_in_combat(&self, actor: ActorId) -> bool;
    fn actor_online(&self, actor: ActorId) -> bool;
    /// Current party of an actor, leader first. A solo actor yields `[actor]`.
    fn party_members(&self, actor: ActorId) -> Vec<ActorId>;
    fn relocate_actor(&self, actor: ActorId, destination: &Location) -> bool;
    fn resurrect_actor(&self, actor: ActorId);
    fn send_message(&self, actor: ActorId, text: &str);
    fn give_money(&self, actor: ActorId, amount: u32);
    fn give_experience(&self, actor: ActorId, amount: u32);
    fn give_item(&self, actor: ActorId, item: u32) -> ItemDelivery;
    /// Replace the actor's stacking all-stats buff with `stacks` stacks.
    fn set_stat_buff(&self, actor: ActorId, stacks: u32);
    fn clear_stat_buff(&self, actor: ActorId);
    fn stat_buff_stacks(&self, actor: ActorId) -> u32;

    // --- Entities / instances ---
    /// Reserve a fresh instance of a map for a session.
    fn create_instance(&self, map_id: u32) -> u32;
    /// Despawn pre-existing hostile entities and unlock doors in an
    /// instance. Returns the number of entities removed.
    fn reset_instance(&self, map_id: u32, instance_id: u32) -> u32;
    fn summon_entity(
        &self,
        map_id: u32,
        instance_id: u32,
        template: u32,
        position: Position,
        rank: EntityRank,
    ) -> Option<EntityId>;
    fn remove_entity(&self, entity: EntityId);
    fn apply_forced_stats(&self, entity: EntityId, stats: &ForcedStats) -> bool;
    fn entity_alive(&self, entity: EntityId) -> bool;
    fn entity_position(&self, entity: EntityId) -> Option<Position>;
    /// Boss-ranked entities within `radius` of a point in an instance,
    /// whatever spawned them. Used by the phase-resolution scan.
    fn boss_entities_near(
        &self,
        map_id: u32,
        instance_id: u32,
        position: &Position,
        radius: f32,
    ) -> Vec<EntitySnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 0.001);
        assert!((b.distance_to(&a) - 5.0).abs() < 0.001);
    }
}
