//! Session manager.
//!
//! Owns every active challenge run and drives the session state machine:
//! capacity-checked creation, relocation into a fresh instance, themed
//! population with force-scaled creatures, death polling, the deferred
//! boss phase-resolution protocol, timers, rewards, cooldowns and
//! teardown.
//!
//! Locking: one guard over the session/instance/participant tables, one
//! over the cooldown table, one over lifetime stats. Capacity check and
//! creation happen atomically under the table guard. The tick computes
//! completion and teardown decisions against state held under the guard,
//! then releases it before teardown runs, so ending a session can never
//! re-enter a held lock.

pub mod selection;
pub mod types;

pub use types::{
    ParticipantRecord, PendingPhaseCheck, PlayerStats, RunContext, Session, SessionState,
    SpawnPointSlot, SpawnedEntity,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::catalog::{CatalogStore, EntityCatalog, ItemQuality};
use crate::config::{ConfigStore, EngineConfig};
use crate::persistence::{ChallengeResultRow, PersistenceHandle};
use crate::scaling;
use crate::world::{ActorId, EntityRank, Location, WorldOps};
use crate::{ChallengeError, MAX_PARTY_SIZE, MAX_PLAYER_LEVEL};

/// Seconds a dead boss waits for a follow-up form before the kill counts.
pub const PHASE_CHECK_GRACE_SECS: u64 = 5;

/// Distance within which a follow-up form is treated as a phase of the
/// same encounter.
pub const PHASE_CHECK_RADIUS: f32 = 40.0;

/// Seconds after start before an empty instance counts as abandoned.
pub const ABANDON_GRACE_SECS: u64 = 15;

/// Seconds a failed session lingers before teardown.
pub const FAILED_SETTLE_SECS: u64 = 2;

/// Terminal outcomes of roguelike-owned sessions, surfaced to the run
/// manager instead of being torn down locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Completed { session_id: u32, run_id: u32 },
    Wiped { session_id: u32, run_id: u32 },
}

#[derive(Default)]
struct SessionTables {
    sessions: HashMap<u32, Session>,
    instance_to_session: HashMap<u32, u32>,
    actor_to_session: HashMap<ActorId, u32>,
    next_id: u32,
}

/// Central owner of all session state.
pub struct SessionManager {
    config: Arc<ConfigStore>,
    catalog: Arc<CatalogStore>,
    world: Arc<dyn WorldOps>,
    persistence: Option<PersistenceHandle>,
    tables: Mutex<SessionTables>,
    cooldowns: Mutex<HashMap<ActorId, u64>>,
    stats: Mutex<HashMap<ActorId, PlayerStats>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ConfigStore>,
        catalog: Arc<CatalogStore>,
        world: Arc<dyn WorldOps>,
        persistence: Option<PersistenceHandle>,
    ) -> Self {
        Self {
            config,
            catalog,
            world,
            persistence,
            tables: Mutex::new(SessionTables { next_id: 1, ..Default::default() }),
            cooldowns: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    // =======================================================================
    // Session lifecycle
    // =======================================================================

    /// Create a session for a leader's party.
    ///
    /// Pass `RunContext::default()` for standalone challenges; the run
    /// manager supplies a tier/affix context for roguelike floors.
    /// Capacity check and insertion are atomic under the table guard.
    pub fn create_session(
        &self,
        leader: ActorId,
        difficulty_id: u32,
        theme_id: u32,
        map_id: u32,
        scale_to_party: bool,
        run: RunContext,
        now: u64,
    ) -> Result<u32, ChallengeError> {
        let cfg = self.config.current();
        let tier = cfg
            .difficulty(difficulty_id)
            .ok_or(ChallengeError::UnknownDifficulty(difficulty_id))?;
        cfg.theme(theme_id).ok_or(ChallengeError::UnknownTheme(theme_id))?;
        cfg.dungeon(map_id).ok_or(ChallengeError::UnknownDungeon(map_id))?;

        if !self.world.actor_online(leader) {
            return Err(ChallengeError::ActorUnavailable(leader));
        }
        let remaining = self.remaining_cooldown(leader, now);
        if remaining > 0 {
            return Err(ChallengeError::OnCooldown(remaining));
        }

        let mut members = self.world.party_members(leader);
        if !members.contains(&leader) {
            members.insert(0, leader);
        }
        members.truncate(MAX_PARTY_SIZE);

        let mut participants = Vec::new();
        let mut levels = Vec::new();
        for member in &members {
            match (self.world.actor_location(*member), self.world.actor_level(*member)) {
                (Some(loc), Some(level)) => {
                    participants.push(ParticipantRecord::new(*member, loc));
                    levels.push(level);
                }
                _ => debug!("Party member {} not present, skipping", member),
            }
        }
        if participants.is_empty() {
            return Err(ChallengeError::ActorUnavailable(leader));
        }

        let (effective_level, band_min, band_max) = if scale_to_party {
            let effective = scaling::effective_level(&levels);
            let (lo, hi) = scaling::level_band(effective, cfg.scaling.level_band, tier);
            (effective, lo, hi)
        } else {
            let (anchor, (lo, hi)) = scaling::tier_anchor(tier);
            (anchor, lo, hi)
        };

        let time_limit = if cfg.timers.time_limit_enabled {
            cfg.timers.time_limit_minutes as u64 * 60
        } else {
            0
        };

        let mut tables = self.tables.lock();
        if tables.sessions.len() >= cfg.timers.max_concurrent_runs as usize {
            return Err(ChallengeError::AtCapacity);
        }
        for p in &participants {
            if tables.actor_to_session.contains_key(&p.actor) {
                return Err(ChallengeError::AlreadyInSession(p.actor));
            }
        }

        let id = tables.next_id;
        tables.next_id += 1;

        let session = Session {
            id,
            leader,
            state: SessionState::Preparing,
            difficulty_id,
            theme_id,
            map_id,
            instance_id: 0,
            scale_to_party,
            effective_level,
            band_min,
            band_max,
            start_time: now,
            end_time: 0,
            time_limit,
            participants,
            spawned: Vec::new(),
            spawn_points: Vec::new(),
            phase_checks: Vec::new(),
            total_mobs: 0,
            mobs_killed: 0,
            total_bosses: 0,
            bosses_killed: 0,
            wipes: 0,
            entrance: Default::default(),
            run,
            handed_off: false,
        };

        for p in &session.participants {
            tables.actor_to_session.insert(p.actor, id);
        }
        info!(
            "Session {} — leader {}, party {}, diff {}, level band {}-{}, scale={}",
            id,
            leader,
            session.participants.len(),
            tier.name,
            band_min,
            band_max,
            if scale_to_party { "party" } else { "tier" }
        );
        tables.sessions.insert(id, session);

        Ok(id)
    }

    /// Resolve the dungeon entrance; refuses when the map has none.
    pub fn start_dungeon(&self, session_id: u32) -> Result<(), ChallengeError> {
        let cfg = self.config.current();
        let mut tables = self.tables.lock();
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or(ChallengeError::SessionNotFound(session_id))?;
        let dungeon = cfg
            .dungeon(session.map_id)
            .ok_or(ChallengeError::UnknownDungeon(session.map_id))?;
        match dungeon.entrance {
            Some(entrance) => {
                session.entrance = entrance;
                Ok(())
            }
            None => {
                error!("No entrance coordinates for map {}", session.map_id);
                Err(ChallengeError::NoEntrance(session.map_id))
            }
        }
    }

    /// Relocate the party into a fresh instance of the session's map.
    ///
    /// Transitions to InProgress once at least one relocation succeeds;
    /// individual failures skip that participant only.
    pub fn teleport_party_in(&self, session_id: u32) -> Result<u32, ChallengeError> {
        let cfg = self.config.current();
        let (map_id, entrance, actors) = {
            let tables = self.tables.lock();
            let session = tables
                .sessions
                .get(&session_id)
                .ok_or(ChallengeError::SessionNotFound(session_id))?;
            (
                session.map_id,
                session.entrance,
                session.participants.iter().map(|p| p.actor).collect::<Vec<_>>(),
            )
        };
        let dungeon_name =
            cfg.dungeon(map_id).map(|d| d.name.clone()).unwrap_or_else(|| "Unknown".into());

        let instance_id = self.world.create_instance(map_id);
        let destination = Location { map_id, instance_id, position: entrance };

        let mut moved = 0u32;
        let mut captured_returns = Vec::new();
        for actor in actors {
            // Capture the return position before the move.
            let return_location = self.world.actor_location(actor);
            if self.world.relocate_actor(actor, &destination) {
                moved += 1;
                if let Some(loc) = return_location {
                    captured_returns.push((actor, loc));
                }
                self.world.send_message(
                    actor,
                    &format!(
                        "[Challenge] Welcome to {}! Defeat all enemies and the boss to claim your reward.",
                        dungeon_name
                    ),
                );
            } else {
                warn!("Relocation of {} into map {} failed", actor, map_id);
                self.world
                    .send_message(actor, "[Challenge] Relocation failed! You may lack access to this dungeon.");
            }
        }
        if moved == 0 {
            return Err(ChallengeError::TeleportFailed);
        }

        let mut tables = self.tables.lock();
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or(ChallengeError::SessionNotFound(session_id))?;
        session.instance_id = instance_id;
        for (actor, loc) in captured_returns {
            if let Some(p) = session.participant_mut(actor) {
                p.return_location = loc;
            }
        }
        session.state = SessionState::InProgress;
        tables.instance_to_session.insert(instance_id, session_id);
        Ok(moved)
    }

    // =======================================================================
    // Tick
    // =======================================================================

    /// Advance every session by one tick.
    ///
    /// Returns terminal events of roguelike-owned sessions; standalone
    /// sessions are torn down here directly.
    pub fn update(&self, now: u64) -> Vec<SessionEvent> {
        let cfg = self.config.current();
        let catalog = self.catalog.current();
        let mut events = Vec::new();
        let mut to_end: Vec<(u32, bool)> = Vec::new();

        {
            let mut tables = self.tables.lock();
            let ids: Vec<u32> = tables.sessions.keys().copied().collect();
            for sid in ids {
                let SessionTables { sessions, instance_to_session, .. } = &mut *tables;
                let Some(session) = sessions.get_mut(&sid) else { continue };

                if session.is_active() {
                    self.adopt_instance(session, instance_to_session);
                    if session.instance_id != 0 && !session.is_populated() {
                        if self.anyone_inside(session) {
                            self.populate_dungeon(session, &cfg, &catalog);
                        }
                    }
                    self.poll_entity_deaths(session, now, &cfg, &catalog);
                    self.resolve_phase_checks(session, now, &cfg, &catalog);
                    // Wipe detection must precede auto-resurrection, or a
                    // fully dead party would be revived instead of failed.
                    self.poll_participant_deaths(session, now, &mut events);
                    self.auto_resurrect(session);
                }

                // Time limit.
                if session.state == SessionState::InProgress
                    && session.time_limit > 0
                    && now.saturating_sub(session.start_time) >= session.time_limit
                {
                    session.state = SessionState::Failed;
                    session.end_time = now;
                    self.announce(session, "[Challenge] Time's up! Challenge failed.");
                    if session.is_roguelike() && !session.handed_off {
                        session.handed_off = true;
                        events.push(SessionEvent::Wiped {
                            session_id: sid,
                            run_id: session.run.run_id,
                        });
                    }
                }

                // Abandoned: nobody inside after the grace window.
                if session.is_active()
                    && now.saturating_sub(session.start_time) >= ABANDON_GRACE_SECS
                    && !self.anyone_inside(session)
                {
                    session.state = SessionState::Abandoned;
                    session.end_time = now;
                    info!("Session {} abandoned — nobody left inside", sid);
                    if session.is_roguelike() {
                        if !session.handed_off {
                            session.handed_off = true;
                            events.push(SessionEvent::Wiped {
                                session_id: sid,
                                run_id: session.run.run_id,
                            });
                        }
                    } else {
                        to_end.push((sid, false));
                    }
                }

                // Completed settle.
                if session.state == SessionState::Completed
                    && now.saturating_sub(session.end_time)
                        >= cfg.timers.completion_teleport_delay
                {
                    if session.is_roguelike() {
                        if !session.handed_off {
                            session.handed_off = true;
                            events.push(SessionEvent::Completed {
                                session_id: sid,
                                run_id: session.run.run_id,
                            });
                        }
                    } else {
                        to_end.push((sid, true));
                    }
                }

                // Failed settle (standalone only; roguelike failures were
                // handed off the moment they happened).
                if session.state == SessionState::Failed
                    && !session.is_roguelike()
                    && now.saturating_sub(session.end_time) >= FAILED_SETTLE_SECS
                {
                    to_end.push((sid, false));
                }
            }
        } // table guard released before teardown

        for (sid, success) in to_end {
            self.end_session(sid, success, now);
        }

        // Expire cooldowns.
        self.cooldowns.lock().retain(|_, expiry| *expiry > now);

        events
    }

    fn adopt_instance(&self, session: &mut Session, instance_index: &mut HashMap<u32, u32>) {
        if session.instance_id == 0 {
            for p in &session.participants {
                if let Some(loc) = self.world.actor_location(p.actor) {
                    if loc.map_id == session.map_id && loc.instance_id != 0 {
                        session.instance_id = loc.instance_id;
                        break;
                    }
                }
            }
        }
        if session.instance_id != 0 {
            instance_index.entry(session.instance_id).or_insert(session.id);
        }
    }

    fn anyone_inside(&self, session: &Session) -> bool {
        session.participants.iter().any(|p| {
            self.world
                .actor_location(p.actor)
                .map(|loc| {
                    loc.map_id == session.map_id
                        && (session.instance_id == 0 || loc.instance_id == session.instance_id)
                })
                .unwrap_or(false)
        })
    }

    // =======================================================================
    // Population
    // =======================================================================

    /// Clear the instance and fill it with themed, force-scaled creatures.
    fn populate_dungeon(
        &self,
        session: &mut Session,
        cfg: &EngineConfig,
        catalog: &EntityCatalog,
    ) {
        let Some(tier) = cfg.difficulty(session.difficulty_id) else {
            warn!("Session {} difficulty {} vanished from config", session.id, session.difficulty_id);
            return;
        };
        let Some(theme) = cfg.theme(session.theme_id) else {
            warn!("Session {} theme {} vanished from config", session.id, session.theme_id);
            return;
        };

        let removed = self.world.reset_instance(session.map_id, session.instance_id);
        debug!("Cleared {} pre-existing entities from instance {}", removed, session.instance_id);

        let points = catalog.spawn_points(session.map_id);
        if points.is_empty() {
            error!("No spawn points for map {}", session.map_id);
            return;
        }

        let mut slots: Vec<SpawnPointSlot> = points
            .iter()
            .map(|p| SpawnPointSlot {
                position: *p,
                distance_from_entrance: session.entrance.distance_to(p),
                boss_position: false,
                used: false,
            })
            .collect();
        // Near to far; bosses take the far end.
        slots.sort_by(|a, b| {
            a.distance_from_entrance
                .partial_cmp(&b.distance_from_entrance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let boss_slots = (cfg.population.boss_count as usize).min(slots.len());
        let total = slots.len();
        for i in 0..boss_slots {
            slots[total - 1 - i].boss_position = true;
        }

        let party_size = session.participants.len();
        let hp_mult = scaling::health_multiplier(tier, party_size, &cfg.scaling)
            * session.run.tier_health_mult;
        let dmg_mult = scaling::damage_multiplier(tier, party_size, &cfg.scaling)
            * session.run.tier_damage_mult;
        let boss_dmg_mult = scaling::boss_damage_multiplier(party_size, &cfg.scaling)
            * session.run.tier_damage_mult;
        let armor_mult = session.run.tier_armor_mult;
        let target_level = session.effective_level;

        info!(
            "Populating session {} — theme '{}', band {}-{}, target lvl {}, HP x{:.2}, DMG x{:.2}",
            session.id, theme.name, session.band_min, session.band_max, target_level, hp_mult, dmg_mult
        );

        let elite_chance = ((cfg.population.elite_chance as f32)
            * session.run.elite_chance_mult)
            .round()
            .min(100.0) as u32;

        let mut rng = rand::thread_rng();

        // ---- Trash ----
        let trash_indices: Vec<usize> =
            (0..slots.len()).filter(|&i| !slots[i].boss_position).collect();
        let want = if trash_indices.is_empty() {
            0
        } else {
            (((trash_indices.len() as f32) * tier.mob_count_mult).round() as usize)
                .clamp(1, trash_indices.len())
        };

        let mut spawned_mobs = 0u32;
        for &idx in trash_indices.iter().take(want) {
            let Some(entry) = selection::select_creature(catalog, theme, false, &mut rng) else {
                continue;
            };
            let is_elite = elite_chance > 0 && rng.gen_ratio(elite_chance.min(100), 100);
            let rank = if is_elite { EntityRank::Elite } else { EntityRank::Normal };
            let Some(entity_id) = self.world.summon_entity(
                session.map_id,
                session.instance_id,
                entry,
                slots[idx].position,
                rank,
            ) else {
                warn!("Summon of template {} failed, skipping spawn point", entry);
                continue;
            };

            let role_hp = if is_elite { cfg.scaling.elite_health_mult } else { 1.0 }
                * session.run.trash_health_mult;
            let role_dmg = if is_elite { cfg.scaling.elite_damage_mult } else { 1.0 }
                * session.run.trash_damage_mult;
            self.force_scale(catalog, entry, entity_id, target_level, hp_mult * role_hp, dmg_mult * role_dmg, armor_mult, false);

            slots[idx].used = true;
            session.spawned.push(SpawnedEntity {
                id: entity_id,
                template: entry,
                elite: is_elite,
                boss: false,
                dead: false,
            });
            spawned_mobs += 1;
        }
        session.total_mobs = spawned_mobs;

        // ---- Bosses ----
        let mut bosses_spawned = 0u32;
        for idx in 0..slots.len() {
            if !slots[idx].boss_position || bosses_spawned >= cfg.population.boss_count {
                continue;
            }
            let Some(entry) = selection::select_creature(catalog, theme, true, &mut rng) else {
                warn!("No boss candidate for theme '{}'", theme.name);
                continue;
            };
            let Some(entity_id) = self.world.summon_entity(
                session.map_id,
                session.instance_id,
                entry,
                slots[idx].position,
                EntityRank::Boss,
            ) else {
                warn!("Summon of boss template {} failed", entry);
                continue;
            };

            let role_hp = cfg.scaling.boss_health_mult * session.run.boss_health_mult;
            let role_dmg = session.run.boss_damage_mult;
            self.force_scale(
                catalog,
                entry,
                entity_id,
                target_level,
                hp_mult * role_hp,
                boss_dmg_mult * role_dmg,
                armor_mult,
                true,
            );

            slots[idx].used = true;
            session.spawned.push(SpawnedEntity {
                id: entity_id,
                template: entry,
                elite: true,
                boss: true,
                dead: false,
            });
            bosses_spawned += 1;
        }
        session.total_bosses = bosses_spawned;
        session.spawn_points = slots;

        info!(
            "Session {} — {} mobs, {} bosses spawned",
            session.id, session.total_mobs, session.total_bosses
        );
        self.announce(
            session,
            &format!(
                "[Challenge] {} enemies and {} boss(es) spawned. Creature levels: {}-{}. Good luck!",
                session.total_mobs, session.total_bosses, session.band_min, session.band_max
            ),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn force_scale(
        &self,
        catalog: &EntityCatalog,
        entry: u32,
        entity_id: u64,
        target_level: u8,
        hp_mult: f32,
        dmg_mult: f32,
        armor_mult: f32,
        is_boss: bool,
    ) {
        let (unit_class, attack_time_ms) = catalog
            .creature(entry)
            .map(|t| (t.unit_class, t.attack_time_ms))
            .unwrap_or((1, 2000));
        match catalog.base_stats(unit_class, target_level) {
            Some(base) => {
                let stats = scaling::forced_stats(
                    &base,
                    target_level,
                    attack_time_ms,
                    hp_mult,
                    dmg_mult,
                    armor_mult,
                    is_boss,
                );
                if !self.world.apply_forced_stats(entity_id, &stats) {
                    warn!("Applying forced stats to entity {} failed", entity_id);
                }
            }
            None => {
                // Degrade: the creature keeps its template stats.
                warn!(
                    "No base stats for class {} level {}, entity {} keeps template stats",
                    unit_class, target_level, entity_id
                );
            }
        }
    }

    // =======================================================================
    // Death handling
    // =======================================================================

    fn poll_entity_deaths(
        &self,
        session: &mut Session,
        now: u64,
        cfg: &EngineConfig,
        catalog: &EntityCatalog,
    ) {
        for i in 0..session.spawned.len() {
            let (entity_id, boss, elite, dead) = {
                let sc = &session.spawned[i];
                (sc.id, sc.boss, sc.elite, sc.dead)
            };
            if dead || self.world.entity_alive(entity_id) {
                continue;
            }
            session.spawned[i].dead = true;

            if boss {
                // Boss kills are only confirmed through phase resolution.
                let position =
                    self.world.entity_position(entity_id).unwrap_or(session.entrance);
                let template = session.spawned[i].template;
                debug!(
                    "Session {} boss entity {} down, opening phase check at ({:.1},{:.1},{:.1})",
                    session.id, entity_id, position.x, position.y, position.z
                );
                session.phase_checks.push(PendingPhaseCheck {
                    position,
                    died_at: now,
                    template,
                    resolved: false,
                });
            } else {
                session.mobs_killed += 1;
                for p in &mut session.participants {
                    p.mobs_killed += 1;
                }
                self.give_kill_xp(session, false, elite, cfg);
                self.grant_kill_loot(session, false, elite, catalog);
            }
        }
    }

    /// Resolve phase checks whose grace window has elapsed.
    ///
    /// A boss-ranked entity that appeared near the death position and is
    /// not yet tracked gets promoted into the tracked set; otherwise the
    /// kill is confirmed. The resolved flag guards re-entry so a check can
    /// never confirm twice.
    fn resolve_phase_checks(
        &self,
        session: &mut Session,
        now: u64,
        cfg: &EngineConfig,
        catalog: &EntityCatalog,
    ) {
        if session.phase_checks.is_empty() {
            return;
        }
        let map_id = session.map_id;
        let instance_id = session.instance_id;

        for i in 0..session.phase_checks.len() {
            let (position, died_at, resolved) = {
                let c = &session.phase_checks[i];
                (c.position, c.died_at, c.resolved)
            };
            if resolved || now < died_at + PHASE_CHECK_GRACE_SECS {
                continue;
            }
            session.phase_checks[i].resolved = true;

            let tracked: HashSet<u64> = session.spawned.iter().map(|sc| sc.id).collect();
            let follow_up = self
                .world
                .boss_entities_near(map_id, instance_id, &position, PHASE_CHECK_RADIUS)
                .into_iter()
                .find(|e| e.alive && !tracked.contains(&e.id));

            match follow_up {
                Some(next_form) => {
                    info!(
                        "Session {} — phase transition: entity {} (template {}) promoted to tracked boss",
                        session.id, next_form.id, next_form.template
                    );
                    session.spawned.push(SpawnedEntity {
                        id: next_form.id,
                        template: next_form.template,
                        elite: true,
                        boss: true,
                        dead: false,
                    });
                    self.announce(session, "[Challenge] The encounter is not over yet!");
                }
                None => {
                    session.bosses_killed += 1;
                    for p in &mut session.participants {
                        p.bosses_killed += 1;
                    }
                    self.give_kill_xp(session, true, true, cfg);
                    self.grant_kill_loot(session, true, true, catalog);

                    if session.total_bosses > session.bosses_killed {
                        self.announce(
                            session,
                            &format!(
                                "[Challenge] Boss defeated! {} remaining.",
                                session.total_bosses - session.bosses_killed
                            ),
                        );
                    }
                    if session.is_active()
                        && session.total_bosses > 0
                        && session.bosses_killed >= session.total_bosses
                    {
                        session.state = SessionState::Completed;
                        session.end_time = now;
                        self.announce(
                            session,
                            &format!(
                                "[Challenge] Dungeon complete! Rewards in {} seconds...",
                                cfg.timers.completion_teleport_delay
                            ),
                        );
                    }
                }
            }
        }
        session.phase_checks.retain(|c| !c.resolved);
    }

    fn auto_resurrect(&self, session: &mut Session) {
        if !session.is_active() {
            return;
        }
        let in_combat = session.participants.iter().any(|p| {
            self.world.actor_alive(p.actor) && self.world.actor_in_combat(p.actor)
        });
        if in_combat {
            return;
        }
        let destination = Location {
            map_id: session.map_id,
            instance_id: session.instance_id,
            position: session.entrance,
        };
        for p in &mut session.participants {
            if self.world.actor_alive(p.actor) || !self.world.actor_online(p.actor) {
                continue;
            }
            let inside = self
                .world
                .actor_location(p.actor)
                .map(|loc| loc.map_id == session.map_id)
                .unwrap_or(false);
            if !inside {
                continue;
            }
            self.world.resurrect_actor(p.actor);
            self.world.relocate_actor(p.actor, &destination);
            p.death_counted = false;
            self.world
                .send_message(p.actor, "[Challenge] Revived at the entrance. Get back in there!");
        }
    }

    fn poll_participant_deaths(
        &self,
        session: &mut Session,
        now: u64,
        events: &mut Vec<SessionEvent>,
    ) {
        let mut any_alive = false;
        for p in &mut session.participants {
            let alive = self.world.actor_alive(p.actor);
            if alive {
                any_alive = true;
                p.death_counted = false;
            } else if !p.death_counted {
                p.death_counted = true;
                p.deaths += 1;
                self.world.send_message(
                    p.actor,
                    "[Challenge] You have fallen! You will be revived when your group leaves combat.",
                );
            }
        }

        // Wipe: all participants simultaneously non-alive.
        if !any_alive && session.is_active() && !session.participants.is_empty() {
            session.wipes += 1;
            session.state = SessionState::Failed;
            session.end_time = now;
            self.announce(session, "[Challenge] Total party wipe! Challenge failed.");
            if session.is_roguelike() && !session.handed_off {
                session.handed_off = true;
                events.push(SessionEvent::Wiped {
                    session_id: session.id,
                    run_id: session.run.run_id,
                });
            }
        }
    }

    // =======================================================================
    // Rewards
    // =======================================================================

    fn give_kill_xp(&self, session: &Session, boss: bool, elite: bool, cfg: &EngineConfig) {
        let mult = if boss {
            10.0
        } else if elite {
            2.0
        } else {
            1.0
        };
        for p in &session.participants {
            if !self.world.actor_alive(p.actor) {
                continue;
            }
            let Some(level) = self.world.actor_level(p.actor) else { continue };
            if level >= MAX_PLAYER_LEVEL {
                continue;
            }
            // Per-player formula so mixed-level groups each get a fair cut.
            let base = (level as u32 * 5) + 45;
            let xp = (base as f32 * mult * cfg.rewards.xp_multiplier) as u32;
            self.world.give_experience(p.actor, xp);
        }
    }

    /// Direct-grant loot for one kill: gold split across the party, items
    /// to a randomly chosen living participant whose class filtered the
    /// selection.
    fn grant_kill_loot(
        &self,
        session: &Session,
        boss: bool,
        elite: bool,
        catalog: &EntityCatalog,
    ) {
        if session.participants.is_empty() {
            return;
        }
        let level = session.effective_level;
        let mut rng = rand::thread_rng();

        let living: Vec<ActorId> = session
            .participants
            .iter()
            .map(|p| p.actor)
            .filter(|a| self.world.actor_alive(*a))
            .collect();
        let receiver = if living.is_empty() {
            session.participants[0].actor
        } else {
            living[rng.gen_range(0..living.len())]
        };
        let receiver_class = self.world.actor_class(receiver).unwrap_or(0);

        // Gold always drops; floor keeps even trivial kills visible.
        let base_gold = if boss { level as u32 * 500 } else { level as u32 * 50 };
        let bonus = if base_gold >= 3 { rng.gen_range(0..=base_gold / 3) } else { 0 };
        let gold = (base_gold + bonus).max(100);
        let share = gold / session.participants.len() as u32;
        for p in &session.participants {
            self.world.give_money(p.actor, share);
        }

        let elite_roll = rng.gen_ratio(40, 100);
        let junk_roll = rng.gen_ratio(15, 100);
        let trash_equip_roll = rng.gen_ratio(3, 100);

        let mut try_drop = |min_q: ItemQuality, max_q: ItemQuality, equipment_only: bool| -> bool {
            let class = if equipment_only { Some(receiver_class) } else { None };
            match selection::select_loot_item(
                &catalog.loot_items,
                level,
                min_q,
                max_q,
                equipment_only,
                class,
                &mut rng,
            ) {
                Some(entry) => {
                    self.world.give_item(receiver, entry);
                    true
                }
                None => false,
            }
        };

        if boss {
            // Two guaranteed rare/epic pieces, degrading when the pool is
            // thin at this level.
            for _ in 0..2 {
                if !try_drop(ItemQuality::Rare, ItemQuality::Epic, true) {
                    try_drop(ItemQuality::Uncommon, ItemQuality::Rare, true);
                }
            }
        } else if elite {
            if elite_roll && !try_drop(ItemQuality::Uncommon, ItemQuality::Uncommon, true) {
                try_drop(ItemQuality::Uncommon, ItemQuality::Uncommon, false);
            }
        } else {
            if junk_roll {
                try_drop(ItemQuality::Poor, ItemQuality::Common, false);
            }
            if trash_equip_roll {
                try_drop(ItemQuality::Uncommon, ItemQuality::Uncommon, true);
            }
        }
    }

    /// Distribute completion rewards to every participant of a session.
    ///
    /// Public so the run manager can hand out per-floor rewards before it
    /// consumes the session.
    pub fn distribute_rewards(&self, session_id: u32) {
        let snapshot = {
            let tables = self.tables.lock();
            tables.sessions.get(&session_id).cloned()
        };
        if let Some(session) = snapshot {
            self.distribute_rewards_for(&session);
        }
    }

    fn distribute_rewards_for(&self, session: &Session) {
        let cfg = self.config.current();
        let catalog = self.catalog.current();
        let Some(tier) = cfg.difficulty(session.difficulty_id) else { return };

        let level = session.effective_level as u32;
        let base_gold = level * 500;
        let mob_gold = session.mobs_killed * (level * 10);
        let boss_gold = session.bosses_killed * (level * 500);
        let total = ((base_gold + mob_gold + boss_gold) as f32 * tier.reward_mult) as u32;
        let per_player = total / (session.participants.len().max(1) as u32);

        let reward_level = session.effective_level.min(MAX_PLAYER_LEVEL);
        info!(
            "Rewards for session {} — level {}, {} per player, {} participants",
            session.id,
            reward_level,
            per_player,
            session.participants.len()
        );

        let mut rng = rand::thread_rng();
        for p in &session.participants {
            if !self.world.actor_online(p.actor) {
                warn!("Participant {} not found for rewards", p.actor);
                continue;
            }
            self.world.give_money(p.actor, per_player);
            self.world
                .send_message(p.actor, &format!("[Challenge] You received {} coins.", per_player));

            // Quality roll: epic first, then rare, uncommon baseline.
            let quality = if cfg.rewards.epic_chance > 0
                && rng.gen_ratio(cfg.rewards.epic_chance.min(100), 100)
            {
                ItemQuality::Epic
            } else if cfg.rewards.rare_chance > 0
                && rng.gen_ratio(cfg.rewards.rare_chance.min(100), 100)
            {
                ItemQuality::Rare
            } else {
                ItemQuality::Uncommon
            };
            self.give_item_reward(p.actor, reward_level, quality, &catalog);
        }
    }

    /// Grant one reward item of roughly the requested quality, running the
    /// full selection fallback ladder. Degrades to a message when even the
    /// soft fallback finds nothing.
    pub fn give_item_reward(
        &self,
        actor: ActorId,
        level: u8,
        quality: ItemQuality,
        catalog: &EntityCatalog,
    ) {
        let class = self.world.actor_class(actor).unwrap_or(0);
        let mut rng = rand::thread_rng();
        match selection::select_reward_with_fallbacks(
            &catalog.reward_items,
            level,
            quality,
            class,
            &mut rng,
        ) {
            Some(entry) => {
                let name = catalog
                    .item(entry)
                    .map(|i| i.name.clone())
                    .unwrap_or_else(|| format!("item {}", entry));
                match self.world.give_item(actor, entry) {
                    crate::world::ItemDelivery::Inventory => {
                        self.world
                            .send_message(actor, &format!("[Challenge] You received: {}", name));
                    }
                    crate::world::ItemDelivery::Mailed => {
                        self.world.send_message(
                            actor,
                            "[Challenge] Bags full! Your reward was mailed to you.",
                        );
                    }
                    crate::world::ItemDelivery::Failed => {
                        error!("Failed to deliver reward item {} to {}", entry, actor);
                    }
                }
            }
            None => {
                error!(
                    "No reward item for actor {} (level {}, class {}, quality {:?})",
                    actor, level, class, quality
                );
                self.world.send_message(
                    actor,
                    "[Challenge] No suitable gear found for your class. Gold only.",
                );
            }
        }
    }

    // =======================================================================
    // Teardown
    // =======================================================================

    /// Tear a session down: rewards on success, stats and leaderboard
    /// persistence, participants returned to origin, cooldowns applied.
    pub fn end_session(&self, session_id: u32, success: bool, now: u64) {
        let session = {
            let mut tables = self.tables.lock();
            let Some(session) = tables.sessions.remove(&session_id) else { return };
            tables.instance_to_session.remove(&session.instance_id);
            for p in &session.participants {
                tables.actor_to_session.remove(&p.actor);
            }
            session
        };

        for p in &session.participants {
            self.world.send_message(
                p.actor,
                if success {
                    "[Challenge] Challenge complete! Distributing rewards..."
                } else {
                    "[Challenge] Challenge ended. No rewards given."
                },
            );
        }

        if success && session.state == SessionState::Completed {
            self.distribute_rewards_for(&session);
        }

        self.record_session_stats(&session, success, now);
        if success && session.state == SessionState::Completed {
            self.save_leaderboard_entry(&session, now);
        }

        // Summoned creatures are intentionally not despawned here; the
        // reset at the next population owns that cleanup.
        for p in &session.participants {
            if !self.world.actor_online(p.actor) {
                continue;
            }
            if !self.world.actor_alive(p.actor) {
                self.world.resurrect_actor(p.actor);
            }
            self.world.relocate_actor(p.actor, &p.return_location);
        }

        for p in &session.participants {
            self.set_cooldown(p.actor, now);
        }

        info!(
            "Session {} ended — success={}, mobs {}/{}, bosses {}/{}",
            session.id,
            success,
            session.mobs_killed,
            session.total_mobs,
            session.bosses_killed,
            session.total_bosses
        );
    }

    /// Detach a roguelike-owned session and hand its state to the caller.
    /// No teleports, no cooldowns — the run manager owns what happens next.
    pub fn take_session(&self, session_id: u32) -> Option<Session> {
        let mut tables = self.tables.lock();
        let session = tables.sessions.remove(&session_id)?;
        tables.instance_to_session.remove(&session.instance_id);
        for p in &session.participants {
            tables.actor_to_session.remove(&p.actor);
        }
        Some(session)
    }

    fn record_session_stats(&self, session: &Session, success: bool, now: u64) {
        let clear_time = if session.end_time > session.start_time {
            session.end_time - session.start_time
        } else {
            now.saturating_sub(session.start_time)
        } as u32;

        for p in &session.participants {
            let snapshot = {
                let mut stats = self.stats.lock();
                let entry = stats.entry(p.actor).or_default();
                entry.total_runs += 1;
                if success {
                    entry.completed_runs += 1;
                    if entry.fastest_clear == 0 || clear_time < entry.fastest_clear {
                        entry.fastest_clear = clear_time;
                    }
                } else {
                    entry.failed_runs += 1;
                }
                entry.total_mobs_killed += p.mobs_killed;
                entry.total_bosses_killed += p.bosses_killed;
                entry.total_deaths += p.deaths;
                *entry
            };
            if let Some(persistence) = &self.persistence {
                persistence.save_stats(p.actor, snapshot);
            }
        }
    }

    fn save_leaderboard_entry(&self, session: &Session, now: u64) {
        let clear_time = if session.end_time > session.start_time {
            session.end_time - session.start_time
        } else {
            now.saturating_sub(session.start_time)
        };
        if clear_time == 0 {
            return;
        }
        let Some(persistence) = &self.persistence else { return };
        let leader_name =
            self.world.actor_name(session.leader).unwrap_or_else(|| "Unknown".into());
        persistence.save_challenge_result(ChallengeResultRow {
            actor: session.leader as i64,
            leader_name,
            map_id: session.map_id as i32,
            difficulty_id: session.difficulty_id as i32,
            clear_time: clear_time as i64,
            party_size: session.participants.len() as i16,
            scaled: session.scale_to_party,
        });
    }

    // =======================================================================
    // Cooldowns
    // =======================================================================

    pub fn is_on_cooldown(&self, actor: ActorId, now: u64) -> bool {
        self.remaining_cooldown(actor, now) > 0
    }

    pub fn remaining_cooldown(&self, actor: ActorId, now: u64) -> u64 {
        self.cooldowns
            .lock()
            .get(&actor)
            .map(|expiry| expiry.saturating_sub(now))
            .unwrap_or(0)
    }

    pub fn set_cooldown(&self, actor: ActorId, now: u64) {
        let minutes = self.config.current().timers.cooldown_minutes as u64;
        self.cooldowns.lock().insert(actor, now + minutes * 60);
    }

    pub fn clear_cooldown(&self, actor: ActorId) {
        self.cooldowns.lock().remove(&actor);
    }

    // =======================================================================
    // Queries
    // =======================================================================

    pub fn active_session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    pub fn can_create_session(&self) -> bool {
        self.active_session_count()
            < self.config.current().timers.max_concurrent_runs as usize
    }

    pub fn session_for_actor(&self, actor: ActorId) -> Option<u32> {
        self.tables.lock().actor_to_session.get(&actor).copied()
    }

    pub fn session_for_instance(&self, instance_id: u32) -> Option<u32> {
        self.tables.lock().instance_to_session.get(&instance_id).copied()
    }

    pub fn session_snapshot(&self, session_id: u32) -> Option<Session> {
        self.tables.lock().sessions.get(&session_id).cloned()
    }

    pub fn status_line(&self, session_id: u32) -> Option<String> {
        self.tables.lock().sessions.get(&session_id).map(|s| s.status_line())
    }

    pub fn player_stats(&self, actor: ActorId) -> PlayerStats {
        self.stats.lock().get(&actor).copied().unwrap_or_default()
    }

    fn announce(&self, session: &Session, text: &str) {
        for p in &session.participants {
            self.world.send_message(p.actor, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityCatalog;
    use crate::world::{MemoryWorld, Position};

    const T0: u64 = 1_000_000;

    fn setup_with(cfg: EngineConfig) -> (Arc<MemoryWorld>, Arc<SessionManager>) {
        let world = Arc::new(MemoryWorld::new());
        let config = Arc::new(ConfigStore::new(cfg));
        let catalog = Arc::new(CatalogStore::new(EntityCatalog::with_defaults()));
        let manager =
            Arc::new(SessionManager::new(config, catalog, world.clone(), None));
        (world, manager)
    }

    fn setup() -> (Arc<MemoryWorld>, Arc<SessionManager>) {
        setup_with(EngineConfig::default())
    }

    fn add_party(world: &MemoryWorld) {
        world.add_actor(1, "Aeris", 15, 1, 0, Position::new(10.0, 0.0, 10.0));
        world.add_actor(2, "Borun", 14, 8, 0, Position::new(12.0, 0.0, 10.0));
        world.form_party(&[1, 2]);
    }

    /// Create, start, enter and populate a session for actor 1's party.
    fn launch(manager: &SessionManager) -> u32 {
        let sid = manager
            .create_session(1, 1, 1, 101, true, RunContext::default(), T0)
            .unwrap();
        manager.start_dungeon(sid).unwrap();
        manager.teleport_party_in(sid).unwrap();
        manager.update(T0);
        sid
    }

    fn boss_ids(manager: &SessionManager, sid: u32) -> Vec<u64> {
        manager
            .session_snapshot(sid)
            .unwrap()
            .spawned
            .iter()
            .filter(|s| s.boss)
            .map(|s| s.id)
            .collect()
    }

    #[test]
    fn test_create_refuses_bad_ids() {
        let (world, manager) = setup();
        add_party(&world);
        assert_eq!(
            manager.create_session(1, 99, 1, 101, true, RunContext::default(), T0),
            Err(ChallengeError::UnknownDifficulty(99))
        );
        assert_eq!(
            manager.create_session(1, 1, 99, 101, true, RunContext::default(), T0),
            Err(ChallengeError::UnknownTheme(99))
        );
        assert_eq!(
            manager.create_session(1, 1, 1, 999, true, RunContext::default(), T0),
            Err(ChallengeError::UnknownDungeon(999))
        );
        assert_eq!(manager.active_session_count(), 0);
    }

    #[test]
    fn test_capacity_check_and_duplicate_membership() {
        let mut cfg = EngineConfig::default();
        cfg.timers.max_concurrent_runs = 2;
        let (world, manager) = setup_with(cfg);
        world.add_actor(1, "A", 15, 1, 0, Position::default());
        world.add_actor(2, "B", 15, 1, 0, Position::default());
        world.add_actor(3, "C", 15, 1, 0, Position::default());

        manager.create_session(1, 1, 1, 101, true, RunContext::default(), T0).unwrap();
        manager.create_session(2, 1, 1, 101, true, RunContext::default(), T0).unwrap();
        assert_eq!(
            manager.create_session(3, 1, 1, 101, true, RunContext::default(), T0),
            Err(ChallengeError::AtCapacity)
        );

        // A participant maps to at most one session at a time.
        let mut cfg = EngineConfig::default();
        cfg.timers.max_concurrent_runs = 20;
        let (world, manager) = setup_with(cfg);
        world.add_actor(1, "A", 15, 1, 0, Position::default());
        manager.create_session(1, 1, 1, 101, true, RunContext::default(), T0).unwrap();
        assert_eq!(
            manager.create_session(1, 1, 1, 102, true, RunContext::default(), T0),
            Err(ChallengeError::AlreadyInSession(1))
        );
    }

    #[test]
    fn test_band_derivation_party_and_tier_modes() {
        let (world, manager) = setup();
        add_party(&world);

        let sid = manager
            .create_session(1, 1, 1, 101, true, RunContext::default(), T0)
            .unwrap();
        let s = manager.session_snapshot(sid).unwrap();
        // Mean of 15 and 14, truncated.
        assert_eq!(s.effective_level, 14);
        assert_eq!((s.band_min, s.band_max), (11, 17));
        manager.take_session(sid);

        let sid = manager
            .create_session(1, 2, 1, 104, false, RunContext::default(), T0)
            .unwrap();
        let s = manager.session_snapshot(sid).unwrap();
        // Tier 2 is 20-39: midpoint anchor, full tier range.
        assert_eq!(s.effective_level, 29);
        assert_eq!((s.band_min, s.band_max), (20, 39));
    }

    #[test]
    fn test_population_spawns_trash_and_boss() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.state, SessionState::InProgress);
        assert!(s.total_mobs > 0);
        assert_eq!(s.total_bosses, 1);
        assert_eq!(s.spawned.len() as u32, s.total_mobs + s.total_bosses);
        assert!(!world.living_entities_in(s.map_id, s.instance_id).is_empty());

        // Every summon was force-scaled to the effective level.
        for sc in &s.spawned {
            let stats = world.entity_stats(sc.id).expect("forced stats applied");
            assert_eq!(stats.level, s.effective_level);
            assert!(stats.health >= 1);
            assert!(stats.damage_max >= stats.damage_min);
        }
    }

    #[test]
    fn test_trash_kills_credit_immediately() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let s = manager.session_snapshot(sid).unwrap();
        let trash: Vec<u64> =
            s.spawned.iter().filter(|e| !e.boss).map(|e| e.id).collect();
        world.kill_entity(trash[0]);
        world.kill_entity(trash[1]);
        manager.update(T0 + 1);

        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.mobs_killed, 2);
        assert_eq!(s.bosses_killed, 0);
        for p in &s.participants {
            assert_eq!(p.mobs_killed, 2);
        }
        // Kill XP and the gold split reached the party.
        assert!(world.actor_experience(1) > 0);
        assert!(world.actor_money(1) > 0);
    }

    #[test]
    fn test_boss_kill_confirms_after_quiet_grace_window() {
        // Scenario: boss dies, nothing appears within 40 units in 5 s ->
        // exactly one confirmed kill, every participant credited.
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let boss = boss_ids(&manager, sid)[0];
        world.kill_entity(boss);
        manager.update(T0 + 1);

        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.bosses_killed, 0, "kill must not be confirmed immediately");
        assert_eq!(s.phase_checks.len(), 1);

        // Still inside the grace window.
        manager.update(T0 + 4);
        assert_eq!(manager.session_snapshot(sid).unwrap().bosses_killed, 0);

        manager.update(T0 + 6);
        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.bosses_killed, 1);
        assert!(s.phase_checks.is_empty());
        for p in &s.participants {
            assert_eq!(p.bosses_killed, 1);
        }
        assert_eq!(s.state, SessionState::Completed);
    }

    #[test]
    fn test_boss_phase_transition_promotes_follow_up_form() {
        // Scenario: a boss-ranked entity appears 10 units away within 2 s.
        // It is promoted into the tracked set; the confirmed counter stays
        // untouched until its own death is phase-resolved.
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let boss = boss_ids(&manager, sid)[0];
        let death_pos = world.entity_position(boss).unwrap();
        world.kill_entity(boss);
        manager.update(T0 + 1);

        let s = manager.session_snapshot(sid).unwrap();
        let tracked_before = s.spawned.len();

        // Scripted second form, 10 units from the corpse.
        let second_form = world
            .summon_entity(
                s.map_id,
                s.instance_id,
                9999,
                Position::new(death_pos.x + 10.0, death_pos.y, death_pos.z),
                EntityRank::Boss,
            )
            .unwrap();

        manager.update(T0 + 6);
        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.spawned.len(), tracked_before + 1);
        assert_eq!(s.bosses_killed, 0, "promotion must not confirm the kill");
        assert_eq!(s.state, SessionState::InProgress);

        // Killing the second form runs the whole protocol again.
        world.kill_entity(second_form);
        manager.update(T0 + 7);
        assert_eq!(manager.session_snapshot(sid).unwrap().bosses_killed, 0);
        manager.update(T0 + 13);
        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.bosses_killed, 1);
        assert_eq!(s.state, SessionState::Completed);
    }

    #[test]
    fn test_phase_resolution_is_idempotent() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let boss = boss_ids(&manager, sid)[0];
        world.kill_entity(boss);
        manager.update(T0 + 1);
        manager.update(T0 + 6);
        assert_eq!(manager.session_snapshot(sid).unwrap().bosses_killed, 1);

        // Further ticks never double-increment the confirmed counter.
        manager.update(T0 + 7);
        manager.update(T0 + 8);
        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.bosses_killed, 1);
        for p in &s.participants {
            assert_eq!(p.bosses_killed, 1);
        }
    }

    #[test]
    fn test_distant_boss_spawn_is_not_a_phase() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        let boss = boss_ids(&manager, sid)[0];
        let death_pos = world.entity_position(boss).unwrap();
        world.kill_entity(boss);
        manager.update(T0 + 1);

        let s = manager.session_snapshot(sid).unwrap();
        // 100 units away: outside the scan radius, so the kill confirms.
        world
            .summon_entity(
                s.map_id,
                s.instance_id,
                9998,
                Position::new(death_pos.x + 100.0, death_pos.y, death_pos.z),
                EntityRank::Boss,
            )
            .unwrap();
        manager.update(T0 + 6);
        assert_eq!(manager.session_snapshot(sid).unwrap().bosses_killed, 1);
    }

    #[test]
    fn test_completion_settles_into_teardown() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        world.kill_entity(boss_ids(&manager, sid)[0]);
        manager.update(T0 + 1);
        manager.update(T0 + 6);
        assert_eq!(manager.session_snapshot(sid).unwrap().state, SessionState::Completed);

        // Still settling.
        manager.update(T0 + 20);
        assert!(manager.session_snapshot(sid).is_some());

        // Default completion delay is 30 s past the kill confirmation.
        manager.update(T0 + 40);
        assert!(manager.session_snapshot(sid).is_none());
        assert_eq!(manager.session_for_actor(1), None);

        // Participants are back at their origin with a cooldown and a
        // completion reward.
        let loc = world.actor_location(1).unwrap();
        assert_eq!(loc.map_id, 0);
        assert!(manager.is_on_cooldown(1, T0 + 41));
        assert!(!world.actor_items(1).is_empty());
        assert_eq!(manager.player_stats(1).completed_runs, 1);
    }

    #[test]
    fn test_wipe_fails_and_returns_party() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        world.kill_actor(1);
        world.kill_actor(2);
        manager.update(T0 + 1);

        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.state, SessionState::Failed);
        assert_eq!(s.wipes, 1);

        // Failed sessions settle for 2 s, then tear down.
        manager.update(T0 + 4);
        assert!(manager.session_snapshot(sid).is_none());
        assert!(world.actor_alive(1), "participants are resurrected on teardown");
        assert_eq!(world.actor_location(1).unwrap().map_id, 0);
        assert_eq!(manager.player_stats(1).failed_runs, 1);
        assert_eq!(manager.player_stats(1).total_deaths, 1);
    }

    #[test]
    fn test_partial_death_auto_resurrects_out_of_combat() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        world.kill_actor(2);
        manager.update(T0 + 1);
        // One member alive: no wipe, and the dead member is revived at the
        // entrance once the group is out of combat.
        let s = manager.session_snapshot(sid).unwrap();
        assert_eq!(s.state, SessionState::InProgress);
        assert!(world.actor_alive(2));
        let loc = world.actor_location(2).unwrap();
        assert_eq!(loc.map_id, s.map_id);
        assert_eq!(manager.session_snapshot(sid).unwrap().participants[1].deaths, 1);

        // While the group fights on, the dead stay dead.
        world.kill_actor(2);
        world.set_actor_combat(1, true);
        manager.update(T0 + 2);
        assert!(!world.actor_alive(2));
    }

    #[test]
    fn test_abandoned_after_grace_when_instance_empty() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);
        let s = manager.session_snapshot(sid).unwrap();

        // Party walks out of the instance.
        let outside = Location { map_id: 0, instance_id: 0, position: Position::default() };
        world.relocate_actor(1, &outside);
        world.relocate_actor(2, &outside);

        // Inside the grace window nothing happens.
        manager.update(T0 + 5);
        assert_eq!(manager.session_snapshot(sid).unwrap().state, SessionState::InProgress);

        manager.update(T0 + ABANDON_GRACE_SECS);
        assert!(manager.session_snapshot(sid).is_none(), "abandoned sessions tear down");
        let _ = s;
    }

    #[test]
    fn test_time_limit_fails_session() {
        let mut cfg = EngineConfig::default();
        cfg.timers.time_limit_enabled = true;
        cfg.timers.time_limit_minutes = 1;
        let (world, manager) = setup_with(cfg);
        add_party(&world);
        let sid = launch(&manager);

        manager.update(T0 + 59);
        assert_eq!(manager.session_snapshot(sid).unwrap().state, SessionState::InProgress);
        manager.update(T0 + 60);
        assert_eq!(manager.session_snapshot(sid).unwrap().state, SessionState::Failed);
        manager.update(T0 + 63);
        assert!(manager.session_snapshot(sid).is_none());
    }

    #[test]
    fn test_cooldown_blocks_recreation() {
        let (world, manager) = setup();
        add_party(&world);
        let sid = launch(&manager);

        world.kill_actor(1);
        world.kill_actor(2);
        manager.update(T0 + 1);
        manager.update(T0 + 4); // teardown applies cooldowns

        let err = manager.create_session(1, 1, 1, 101, true, RunContext::default(), T0 + 5);
        assert!(matches!(err, Err(ChallengeError::OnCooldown(_))));

        manager.clear_cooldown(1);
        assert!(manager
            .create_session(1, 1, 1, 101, true, RunContext::default(), T0 + 5)
            .is_ok());
    }

    #[test]
    fn test_roguelike_terminal_states_emit_events_once() {
        let (world, manager) = setup();
        add_party(&world);
        let ctx = RunContext { run_id: 42, ..RunContext::default() };
        let sid = manager.create_session(1, 1, 1, 101, true, ctx, T0).unwrap();
        manager.start_dungeon(sid).unwrap();
        manager.teleport_party_in(sid).unwrap();
        manager.update(T0);

        world.kill_actor(1);
        world.kill_actor(2);
        let events = manager.update(T0 + 1);
        assert_eq!(events, vec![SessionEvent::Wiped { session_id: sid, run_id: 42 }]);

        // The session is left for the run manager; no second event, no
        // standalone teardown.
        assert!(manager.update(T0 + 10).is_empty());
        assert!(manager.session_snapshot(sid).is_some());
        let taken = manager.take_session(sid).unwrap();
        assert_eq!(taken.run.run_id, 42);
        assert_eq!(manager.session_for_actor(1), None);
    }

    #[test]
    fn test_roguelike_completion_event_after_settle() {
        let (world, manager) = setup();
        add_party(&world);
        let ctx = RunContext { run_id: 7, ..RunContext::default() };
        let sid = manager.create_session(1, 1, 1, 101, true, ctx, T0).unwrap();
        manager.start_dungeon(sid).unwrap();
        manager.teleport_party_in(sid).unwrap();
        manager.update(T0);

        world.kill_entity(boss_ids(&manager, sid)[0]);
        manager.update(T0 + 1);
        assert!(manager.update(T0 + 6).is_empty(), "completion settles first");

        let events = manager.update(T0 + 40);
        assert_eq!(events, vec![SessionEvent::Completed { session_id: sid, run_id: 7 }]);
        assert!(manager.update(T0 + 41).is_empty());
    }

    #[test]
    fn test_roguelike_context_scales_population() {
        let (world, manager) = setup();
        add_party(&world);
        let catalog = EntityCatalog::with_defaults();
        let party_scale = 1.0f32 + 0.25; // two members, default per-player health

        // Baseline boss: tier health x party scale x boss role multiplier.
        let sid = launch(&manager);
        let s = manager.session_snapshot(sid).unwrap();
        let boss = s.spawned.iter().find(|e| e.boss).unwrap().clone();
        let stats = world.entity_stats(boss.id).unwrap();
        let class = catalog.creature(boss.template).unwrap().unit_class;
        let base = catalog.base_stats(class, s.effective_level).unwrap();
        let hp_mult = 1.0f32 * party_scale;
        let expected = ((base.base_hp as f32) * (hp_mult * 8.0)).max(1.0) as u32;
        assert_eq!(stats.health, expected);
        manager.take_session(sid);

        // A run context compounds tier and affix multipliers on top.
        let ctx = RunContext {
            run_id: 9,
            tier_health_mult: 2.0,
            boss_health_mult: 1.4,
            ..RunContext::default()
        };
        let sid = manager.create_session(1, 1, 1, 101, true, ctx, T0).unwrap();
        manager.start_dungeon(sid).unwrap();
        manager.teleport_party_in(sid).unwrap();
        manager.update(T0);
        let s = manager.session_snapshot(sid).unwrap();
        let boss = s.spawned.iter().find(|e| e.boss).unwrap().clone();
        let stats = world.entity_stats(boss.id).unwrap();
        let class = catalog.creature(boss.template).unwrap().unit_class;
        let base = catalog.base_stats(class, s.effective_level).unwrap();
        let hp_mult = (1.0f32 * party_scale) * 2.0;
        let role_hp = 8.0f32 * 1.4;
        let expected = ((base.base_hp as f32) * (hp_mult * role_hp)).max(1.0) as u32;
        assert_eq!(stats.health, expected);
    }
}
