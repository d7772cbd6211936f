//! In-memory world implementation.
//!
//! Backs the bundled host binary and the test suite. Actors and entities
//! live in flat maps behind a single guard; every [`WorldOps`] call is one
//! short critical section, so the engine's own lock ordering is never
//! entangled with the world's.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{
    ActorId, EntityId, EntityRank, EntitySnapshot, ForcedStats, ItemDelivery, Location, Position,
    WorldOps,
};

/// Mutable state of one actor.
#[derive(Debug, Clone)]
struct ActorState {
    name: String,
    level: u8,
    class: u8,
    location: Location,
    alive: bool,
    in_combat: bool,
    online: bool,
    money: u64,
    experience: u64,
    items: Vec<u32>,
    inventory_full: bool,
    buff_stacks: u32,
    messages: Vec<String>,
}

/// Mutable state of one summoned entity.
#[derive(Debug, Clone)]
struct EntityState {
    map_id: u32,
    instance_id: u32,
    template: u32,
    rank: EntityRank,
    position: Position,
    alive: bool,
    stats: Option<ForcedStats>,
}

#[derive(Debug, Default)]
struct WorldState {
    actors: HashMap<ActorId, ActorState>,
    entities: HashMap<EntityId, EntityState>,
    parties: Vec<Vec<ActorId>>,
    next_entity_id: EntityId,
    next_instance_id: u32,
}

/// In-memory [`WorldOps`] implementation.
pub struct MemoryWorld {
    state: Mutex<WorldState>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorldState {
                // Entity ids start high to avoid confusion with actor ids
                next_entity_id: 10000,
                next_instance_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Register an actor standing at a position in the open world.
    pub fn add_actor(
        &self,
        id: ActorId,
        name: &str,
        level: u8,
        class: u8,
        map_id: u32,
        position: Position,
    ) {
        let mut state = self.state.lock();
        state.actors.insert(
            id,
            ActorState {
                name: name.to_string(),
                level,
                class,
                location: Location { map_id, instance_id: 0, position },
                alive: true,
                in_combat: false,
                online: true,
                money: 0,
                experience: 0,
                items: Vec::new(),
                inventory_full: false,
                buff_stacks: 0,
                messages: Vec::new(),
            },
        );
    }

    /// Group actors into one party. The first id is the leader.
    pub fn form_party(&self, members: &[ActorId]) {
        let mut state = self.state.lock();
        state.parties.retain(|p| !p.iter().any(|m| members.contains(m)));
        state.parties.push(members.to_vec());
    }

    pub fn kill_actor(&self, actor: ActorId) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.alive = false;
            a.in_combat = false;
        }
    }

    pub fn set_actor_combat(&self, actor: ActorId, in_combat: bool) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.in_combat = in_combat;
        }
    }

    pub fn set_actor_online(&self, actor: ActorId, online: bool) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.online = online;
        }
    }

    pub fn set_inventory_full(&self, actor: ActorId, full: bool) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.inventory_full = full;
        }
    }

    pub fn kill_entity(&self, entity: EntityId) {
        if let Some(e) = self.state.lock().entities.get_mut(&entity) {
            e.alive = false;
        }
    }

    pub fn actor_money(&self, actor: ActorId) -> u64 {
        self.state.lock().actors.get(&actor).map(|a| a.money).unwrap_or(0)
    }

    pub fn actor_experience(&self, actor: ActorId) -> u64 {
        self.state.lock().actors.get(&actor).map(|a| a.experience).unwrap_or(0)
    }

    pub fn actor_items(&self, actor: ActorId) -> Vec<u32> {
        self.state.lock().actors.get(&actor).map(|a| a.items.clone()).unwrap_or_default()
    }

    pub fn actor_messages(&self, actor: ActorId) -> Vec<String> {
        self.state.lock().actors.get(&actor).map(|a| a.messages.clone()).unwrap_or_default()
    }

    /// All living entities inside one instance.
    pub fn living_entities_in(&self, map_id: u32, instance_id: u32) -> Vec<EntityId> {
        self.state
            .lock()
            .entities
            .iter()
            .filter(|(_, e)| e.alive && e.map_id == map_id && e.instance_id == instance_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn entity_stats(&self, entity: EntityId) -> Option<ForcedStats> {
        self.state.lock().entities.get(&entity).and_then(|e| e.stats.clone())
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldOps for MemoryWorld {
    fn actor_name(&self, actor: ActorId) -> Option<String> {
        self.state.lock().actors.get(&actor).map(|a| a.name.clone())
    }

    fn actor_level(&self, actor: ActorId) -> Option<u8> {
        self.state.lock().actors.get(&actor).map(|a| a.level)
    }

    fn actor_class(&self, actor: ActorId) -> Option<u8> {
        self.state.lock().actors.get(&actor).map(|a| a.class)
    }

    fn actor_location(&self, actor: ActorId) -> Option<Location> {
        let state = self.state.lock();
        state.actors.get(&actor).filter(|a| a.online).map(|a| a.location)
    }

    fn actor_alive(&self, actor: ActorId) -> bool {
        self.state.lock().actors.get(&actor).map(|a| a.online && a.alive).unwrap_or(false)
    }

    fn actor_in_combat(&self, actor: ActorId) -> bool {
        self.state.lock().actors.get(&actor).map(|a| a.in_combat).unwrap_or(false)
    }

    fn actor_online(&self, actor: ActorId) -> bool {
        self.state.lock().actors.get(&actor).map(|a| a.online).unwrap_or(false)
    }

    fn party_members(&self, actor: ActorId) -> Vec<ActorId> {
        let state = self.state.lock();
        for party in &state.parties {
            if party.contains(&actor) {
                return party
                    .iter()
                    .copied()
                    .filter(|m| state.actors.get(m).map(|a| a.online).unwrap_or(false))
                    .collect();
            }
        }
        if state.actors.contains_key(&actor) {
            vec![actor]
        } else {
            Vec::new()
        }
    }

    fn relocate_actor(&self, actor: ActorId, destination: &Location) -> bool {
        let mut state = self.state.lock();
        match state.actors.get_mut(&actor) {
            Some(a) if a.online => {
                a.location = *destination;
                true
            }
            _ => false,
        }
    }

    fn resurrect_actor(&self, actor: ActorId) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.alive = true;
        }
    }

    fn send_message(&self, actor: ActorId, text: &str) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.messages.push(text.to_string());
        }
    }

    fn give_money(&self, actor: ActorId, amount: u32) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.money += amount as u64;
        }
    }

    fn give_experience(&self, actor: ActorId, amount: u32) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.experience += amount as u64;
        }
    }

    fn give_item(&self, actor: ActorId, item: u32) -> ItemDelivery {
        let mut state = self.state.lock();
        match state.actors.get_mut(&actor) {
            Some(a) if !a.inventory_full => {
                a.items.push(item);
                ItemDelivery::Inventory
            }
            Some(a) => {
                a.items.push(item);
                ItemDelivery::Mailed
            }
            None => ItemDelivery::Failed,
        }
    }

    fn set_stat_buff(&self, actor: ActorId, stacks: u32) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.buff_stacks = stacks;
        }
    }

    fn clear_stat_buff(&self, actor: ActorId) {
        if let Some(a) = self.state.lock().actors.get_mut(&actor) {
            a.buff_stacks = 0;
        }
    }

    fn stat_buff_stacks(&self, actor: ActorId) -> u32 {
        self.state.lock().actors.get(&actor).map(|a| a.buff_stacks).unwrap_or(0)
    }

    fn create_instance(&self, _map_id: u32) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_instance_id;
        state.next_instance_id += 1;
        id
    }

    fn reset_instance(&self, map_id: u32, instance_id: u32) -> u32 {
        let mut state = self.state.lock();
        let before = state.entities.len();
        state
            .entities
            .retain(|_, e| !(e.map_id == map_id && e.instance_id == instance_id));
        (before - state.entities.len()) as u32
    }

    fn summon_entity(
        &self,
        map_id: u32,
        instance_id: u32,
        template: u32,
        position: Position,
        rank: EntityRank,
    ) -> Option<EntityId> {
        let mut state = self.state.lock();
        let id = state.next_entity_id;
        state.next_entity_id += 1;
        state.entities.insert(
            id,
            EntityState {
                map_id,
                instance_id,
                template,
                rank,
                position,
                alive: true,
                stats: None,
            },
        );
        Some(id)
    }

    fn remove_entity(&self, entity: EntityId) {
        self.state.lock().entities.remove(&entity);
    }

    fn apply_forced_stats(&self, entity: EntityId, stats: &ForcedStats) -> bool {
        let mut state = self.state.lock();
        match state.entities.get_mut(&entity) {
            Some(e) => {
                e.stats = Some(stats.clone());
                true
            }
            None => false,
        }
    }

    fn entity_alive(&self, entity: EntityId) -> bool {
        self.state.lock().entities.get(&entity).map(|e| e.alive).unwrap_or(false)
    }

    fn entity_position(&self, entity: EntityId) -> Option<Position> {
        self.state.lock().entities.get(&entity).map(|e| e.position)
    }

    fn boss_entities_near(
        &self,
        map_id: u32,
        instance_id: u32,
        position: &Position,
        radius: f32,
    ) -> Vec<EntitySnapshot> {
        self.state
            .lock()
            .entities
            .iter()
            .filter(|(_, e)| {
                e.map_id == map_id
                    && e.instance_id == instance_id
                    && e.rank == EntityRank::Boss
                    && position.distance_to(&e.position) <= radius
            })
            .map(|(id, e)| EntitySnapshot {
                id: *id,
                template: e.template,
                rank: e.rank,
                alive: e.alive,
                position: e.position,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_membership_skips_offline() {
        let world = MemoryWorld::new();
        world.add_actor(1, "Aeris", 20, 1, 0, Position::new(0.0, 0.0, 0.0));
        world.add_actor(2, "Borun", 22, 5, 0, Position::new(1.0, 0.0, 0.0));
        world.form_party(&[1, 2]);

        assert_eq!(world.party_members(1), vec![1, 2]);
        world.set_actor_online(2, false);
        assert_eq!(world.party_members(1), vec![1]);
    }

    #[test]
    fn test_boss_scan_respects_radius_and_rank() {
        let world = MemoryWorld::new();
        let inst = world.create_instance(10);
        let near = world
            .summon_entity(10, inst, 7, Position::new(5.0, 0.0, 0.0), EntityRank::Boss)
            .unwrap();
        world
            .summon_entity(10, inst, 8, Position::new(100.0, 0.0, 0.0), EntityRank::Boss)
            .unwrap();
        world
            .summon_entity(10, inst, 9, Position::new(5.0, 0.0, 0.0), EntityRank::Normal)
            .unwrap();

        let origin = Position::new(0.0, 0.0, 0.0);
        let found = world.boss_entities_near(10, inst, &origin, 40.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, near);
    }

    #[test]
    fn test_give_item_falls_back_to_mail_when_full() {
        let world = MemoryWorld::new();
        world.add_actor(1, "Aeris", 20, 1, 0, Position::default());
        assert_eq!(world.give_item(1, 500), ItemDelivery::Inventory);
        world.set_inventory_full(1, true);
        assert_eq!(world.give_item(1, 501), ItemDelivery::Mailed);
        assert_eq!(world.give_item(99, 502), ItemDelivery::Failed);
    }
}
