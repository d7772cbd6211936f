//! Roguelike run manager.
//!
//! A higher-order state machine over the session manager: each run owns at
//! most one live session, advances a tier counter per cleared floor,
//! re-draws affixes, stacks a party-wide buff, and chains freshly chosen
//! dungeons until total party death or voluntary exit.
//!
//! Coupling to the session manager is event-driven: the host feeds the
//! [`SessionEvent`]s returned by `SessionManager::update` into
//! [`RunManager::handle_session_event`], then ticks
//! [`RunManager::update`]. The run manager guards its own run/session/
//! participant tables and releases the guard before every external call.

pub mod types;

pub use types::{Affix, AffixDef, RoguelikeRun, RunParticipant, RunState, BUFF_PERCENT_PER_STACK};

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::{CatalogStore, ItemQuality};
use crate::config::{ConfigStore, EngineConfig};
use crate::persistence::{PersistenceHandle, RunResultRow};
use crate::scaling;
use crate::session::{RunContext, SessionEvent, SessionManager};
use crate::world::{ActorId, WorldOps};
use crate::{ChallengeError, MAX_PLAYER_LEVEL};

#[derive(Default)]
struct RunTables {
    runs: HashMap<u32, RoguelikeRun>,
    session_to_run: HashMap<u32, u32>,
    actor_to_run: HashMap<ActorId, u32>,
    next_id: u32,
}

/// Owner of all roguelike runs.
pub struct RunManager {
    config: Arc<ConfigStore>,
    catalog: Arc<CatalogStore>,
    world: Arc<dyn WorldOps>,
    sessions: Arc<SessionManager>,
    persistence: Option<PersistenceHandle>,
    tables: Mutex<RunTables>,
    affixes: Vec<AffixDef>,
}

impl RunManager {
    pub fn new(
        config: Arc<ConfigStore>,
        catalog: Arc<CatalogStore>,
        world: Arc<dyn WorldOps>,
        sessions: Arc<SessionManager>,
        persistence: Option<PersistenceHandle>,
    ) -> Self {
        let affixes = build_affix_pool();
        info!("Run manager ready — {} affix definitions", affixes.len());
        Self {
            config,
            catalog,
            world,
            sessions,
            persistence,
            tables: Mutex::new(RunTables { next_id: 1, ..Default::default() }),
            affixes,
        }
    }

    // =======================================================================
    // Run lifecycle
    // =======================================================================

    /// Start a roguelike run for a leader's party.
    ///
    /// `theme_id` 0 draws a fresh random theme each floor.
    pub fn start_run(
        &self,
        leader: ActorId,
        difficulty_id: u32,
        theme_id: u32,
        scale_to_party: bool,
        now: u64,
    ) -> Result<u32, ChallengeError> {
        let cfg = self.config.current();
        if !cfg.roguelike.enabled {
            return Err(ChallengeError::RoguelikeDisabled);
        }
        if self.run_for_actor(leader).is_some() {
            return Err(ChallengeError::AlreadyInRun(leader));
        }
        if self.sessions.session_for_actor(leader).is_some() {
            return Err(ChallengeError::AlreadyInSession(leader));
        }
        let remaining = self.sessions.remaining_cooldown(leader, now);
        if remaining > 0 {
            return Err(ChallengeError::OnCooldown(remaining));
        }
        if !self.sessions.can_create_session() {
            return Err(ChallengeError::AtCapacity);
        }

        // Fall back to the first configured difficulty on a bad id.
        let base_difficulty_id = if cfg.difficulty(difficulty_id).is_some() {
            difficulty_id
        } else {
            cfg.difficulties.first().map(|d| d.id).unwrap_or(1)
        };

        let mut participants = Vec::new();
        for member in self.world.party_members(leader) {
            if member != leader {
                // Conflicted members are skipped, not fatal.
                if self.run_for_actor(member).is_some()
                    || self.sessions.session_for_actor(member).is_some()
                {
                    continue;
                }
            }
            if let Some(loc) = self.world.actor_location(member) {
                participants.push(RunParticipant { actor: member, original_location: loc });
            }
        }
        if participants.is_empty() || !participants.iter().any(|p| p.actor == leader) {
            return Err(ChallengeError::ActorUnavailable(leader));
        }

        let run_id = {
            let mut tables = self.tables.lock();
            let id = tables.next_id;
            tables.next_id += 1;

            let mut run = RoguelikeRun {
                id,
                leader,
                state: RunState::Active,
                theme_id,
                base_difficulty_id,
                scale_to_party,
                current_tier: 1,
                current_session_id: 0,
                floors_cleared: 0,
                previous_map_id: 0,
                // First stack is earned by clearing floor 1.
                buff_stacks: 0,
                active_affixes: Vec::new(),
                participants,
                started_at: now,
                transition_started_at: now,
                total_mobs_killed: 0,
                total_bosses_killed: 0,
                total_deaths: 0,
            };
            select_affixes_for_tier(&mut run, &cfg, &self.affixes);

            for p in &run.participants {
                tables.actor_to_run.insert(p.actor, id);
            }
            tables.runs.insert(id, run);
            id
        };

        if let Err(e) = self.open_floor(run_id, now) {
            warn!("Run {} failed to open its first floor: {}", run_id, e);
            let mut tables = self.tables.lock();
            if let Some(run) = tables.runs.remove(&run_id) {
                for p in &run.participants {
                    tables.actor_to_run.remove(&p.actor);
                }
            }
            return Err(e);
        }

        let (actors, theme_name, affix_names) = {
            let tables = self.tables.lock();
            let run = &tables.runs[&run_id];
            (
                run.participants.iter().map(|p| p.actor).collect::<Vec<_>>(),
                cfg.theme(theme_id).map(|t| t.name.clone()).unwrap_or_else(|| "Random".into()),
                affix_names(&run.active_affixes, &self.affixes),
            )
        };
        let leader_name = self.world.actor_name(leader).unwrap_or_else(|| "Someone".into());
        self.announce(
            &actors,
            &format!(
                "[Roguelike] {} started a roguelike run! Theme: {} — how far can you go?",
                leader_name, theme_name
            ),
        );
        if !affix_names.is_empty() {
            self.announce(&actors, &format!("[Roguelike] Active affixes: {}", affix_names));
        }

        info!(
            "Run {} started — leader {}, party {}, theme {}",
            run_id,
            leader,
            actors.len(),
            theme_name
        );
        Ok(run_id)
    }

    /// React to a terminal event of a session this manager owns.
    pub fn handle_session_event(&self, event: SessionEvent, now: u64) {
        match event {
            SessionEvent::Completed { session_id, run_id } => {
                self.on_floor_cleared(run_id, session_id, now)
            }
            SessionEvent::Wiped { session_id, run_id } => {
                self.on_party_wipe(run_id, session_id, now)
            }
        }
    }

    /// A floor was cleared: bank stats, advance the tier, re-draw affixes,
    /// add a buff stack and chain into the next dungeon.
    fn on_floor_cleared(&self, run_id: u32, session_id: u32, now: u64) {
        {
            let tables = self.tables.lock();
            let Some(run) = tables.runs.get(&run_id) else {
                warn!("Floor-clear event for unknown run {}", run_id);
                return;
            };
            if run.current_session_id != session_id {
                warn!(
                    "Floor-clear event for session {} but run {} owns {}",
                    session_id, run_id, run.current_session_id
                );
                return;
            }
        }

        // Per-floor rewards go out while the session still exists; then the
        // session is consumed without teleports or cooldowns.
        self.sessions.distribute_rewards(session_id);
        let snapshot = self.sessions.take_session(session_id);

        let (actors, stacks, tier, floors, names) = {
            let mut tables = self.tables.lock();
            tables.session_to_run.remove(&session_id);
            let Some(run) = tables.runs.get_mut(&run_id) else { return };
            run.current_session_id = 0;

            if let Some(s) = &snapshot {
                run.total_mobs_killed += s.mobs_killed;
                run.total_bosses_killed += s.bosses_killed;
                run.total_deaths += s.participants.iter().map(|p| p.deaths).sum::<u32>();
                run.previous_map_id = s.map_id;
            }
            run.floors_cleared += 1;
            run.current_tier += 1;

            let cfg = self.config.current();
            select_affixes_for_tier(run, &cfg, &self.affixes);
            run.buff_stacks += 1;
            run.transition_started_at = now;

            (
                run.participants.iter().map(|p| p.actor).collect::<Vec<_>>(),
                run.buff_stacks,
                run.current_tier,
                run.floors_cleared,
                affix_names(&run.active_affixes, &self.affixes),
            )
        };

        // Replace-then-apply keeps the displayed stack count equal to the
        // run's counter.
        for actor in &actors {
            if self.world.actor_online(*actor) && self.world.actor_alive(*actor) {
                self.world.set_stat_buff(*actor, stacks);
            }
        }
        self.announce(
            &actors,
            &format!(
                "[Roguelike] +{:.0}% All Stats (Stack {})",
                BUFF_PERCENT_PER_STACK * stacks as f32,
                stacks
            ),
        );
        let mut progress =
            format!("[Roguelike] Floor {} cleared! Advancing to Tier {}...", floors, tier);
        if !names.is_empty() {
            progress.push_str(&format!(" Affixes: {}", names));
        }
        self.announce(&actors, &progress);

        if let Err(e) = self.open_floor(run_id, now) {
            info!("Run {} cannot continue: {}", run_id, e);
            self.announce(
                &actors,
                &format!(
                    "[Roguelike] No more dungeons available! Run ended at Tier {} after {} floors.",
                    tier, floors
                ),
            );
            self.end_run(run_id, true, now);
        }
    }

    /// Total party wipe inside the owned session: the run ends immediately.
    fn on_party_wipe(&self, run_id: u32, session_id: u32, now: u64) {
        let snapshot = self.sessions.take_session(session_id);

        let run = {
            let mut tables = self.tables.lock();
            tables.session_to_run.remove(&session_id);
            let Some(mut run) = tables.runs.remove(&run_id) else { return };
            for p in &run.participants {
                tables.actor_to_run.remove(&p.actor);
            }
            run.state = RunState::Ended;
            if let Some(s) = &snapshot {
                run.total_mobs_killed += s.mobs_killed;
                run.total_bosses_killed += s.bosses_killed;
                run.total_deaths += s.participants.iter().map(|p| p.deaths).sum::<u32>();
            }
            run
        };

        let duration = now.saturating_sub(run.started_at);
        let actors: Vec<ActorId> = run.participants.iter().map(|p| p.actor).collect();
        self.announce(
            &actors,
            &format!(
                "[Roguelike] TOTAL PARTY WIPE! Your run has ended.\n\
                 [Roguelike] Final results: Tier {}, {} floors, {} mobs, {} bosses, {} deaths, {}m {:02}s.",
                run.current_tier,
                run.floors_cleared,
                run.total_mobs_killed,
                run.total_bosses_killed,
                run.total_deaths,
                duration / 60,
                duration % 60
            ),
        );

        self.save_run_leaderboard(&run, duration);
        self.teardown_participants(&run, now);

        info!(
            "Run {} ended (wipe) — tier {}, {} floors cleared",
            run.id, run.current_tier, run.floors_cleared
        );
    }

    /// End a run gracefully: voluntary exit or no eligible next dungeon.
    pub fn end_run(&self, run_id: u32, announce_results: bool, now: u64) {
        let run = {
            let mut tables = self.tables.lock();
            let Some(mut run) = tables.runs.remove(&run_id) else { return };
            tables.session_to_run.remove(&run.current_session_id);
            for p in &run.participants {
                tables.actor_to_run.remove(&p.actor);
            }
            run.state = RunState::Ended;
            run
        };

        // Consume the live session, banking its stats, without the session
        // manager teleporting anyone.
        let mut run = run;
        if run.current_session_id != 0 {
            if let Some(s) = self.sessions.take_session(run.current_session_id) {
                run.total_mobs_killed += s.mobs_killed;
                run.total_bosses_killed += s.bosses_killed;
                run.total_deaths += s.participants.iter().map(|p| p.deaths).sum::<u32>();
            }
            run.current_session_id = 0;
        }

        let duration = now.saturating_sub(run.started_at);
        let actors: Vec<ActorId> = run.participants.iter().map(|p| p.actor).collect();
        if announce_results {
            self.announce(
                &actors,
                &format!(
                    "[Roguelike] Run complete! Tier {}, {} floors, {} mobs, {} bosses, {}m {:02}s.",
                    run.current_tier,
                    run.floors_cleared,
                    run.total_mobs_killed,
                    run.total_bosses_killed,
                    duration / 60,
                    duration % 60
                ),
            );
            self.save_run_leaderboard(&run, duration);
        }

        if run.floors_cleared > 0 {
            self.distribute_run_rewards(&run);
        }

        self.teardown_participants(&run, now);

        info!(
            "Run {} ended (graceful) — tier {}, {} floors",
            run.id, run.current_tier, run.floors_cleared
        );
    }

    /// Voluntary exit by any run member ends the whole run.
    pub fn quit_run(&self, actor: ActorId, now: u64) {
        if let Some(run_id) = self.run_for_actor(actor) {
            self.end_run(run_id, true, now);
        }
    }

    /// Strip buffs, resurrect, return everyone to their pre-run positions
    /// and apply cooldowns.
    fn teardown_participants(&self, run: &RoguelikeRun, now: u64) {
        for p in &run.participants {
            if !self.world.actor_online(p.actor) {
                continue;
            }
            self.world.clear_stat_buff(p.actor);
            if !self.world.actor_alive(p.actor) {
                self.world.resurrect_actor(p.actor);
            }
            self.world.relocate_actor(p.actor, &p.original_location);
        }
        for p in &run.participants {
            self.sessions.set_cooldown(p.actor, now);
        }
    }

    // =======================================================================
    // Floor transitions
    // =======================================================================

    /// Create, start and enter the next session of a run.
    fn open_floor(&self, run_id: u32, now: u64) -> Result<u32, ChallengeError> {
        let cfg = self.config.current();
        let (mut leader, theme_id, difficulty_id, scale_to_party, previous_map, actors, context) = {
            let tables = self.tables.lock();
            let run = tables.runs.get(&run_id).ok_or(ChallengeError::RunNotFound(run_id))?;
            (
                run.leader,
                run.theme_id,
                run.base_difficulty_id,
                run.scale_to_party,
                run.previous_map_id,
                run.participants.iter().map(|p| p.actor).collect::<Vec<_>>(),
                self.run_context(run, &cfg),
            )
        };

        // The leader may have gone offline mid-run; any online member can
        // carry the run forward.
        if !self.world.actor_online(leader) {
            leader = actors
                .iter()
                .copied()
                .find(|a| self.world.actor_online(*a))
                .ok_or(ChallengeError::ActorUnavailable(leader))?;
            if let Some(run) = self.tables.lock().runs.get_mut(&run_id) {
                run.leader = leader;
            }
        }

        let map_id = select_random_dungeon(&cfg, difficulty_id, previous_map)
            .ok_or(ChallengeError::NoDungeonAvailable)?;

        // Run-locked theme, or a fresh random one per floor.
        let theme_id = if theme_id != 0 {
            theme_id
        } else {
            let mut rng = rand::thread_rng();
            cfg.themes.choose(&mut rng).map(|t| t.id).unwrap_or(1)
        };

        // Teardown of the previous floor may have set cooldowns.
        for actor in &actors {
            self.sessions.clear_cooldown(*actor);
        }

        let session_id = self.sessions.create_session(
            leader,
            difficulty_id,
            theme_id,
            map_id,
            scale_to_party,
            context,
            now,
        )?;
        if let Err(e) = self.sessions.start_dungeon(session_id) {
            self.sessions.take_session(session_id);
            return Err(e);
        }
        if let Err(e) = self.sessions.teleport_party_in(session_id) {
            self.sessions.take_session(session_id);
            return Err(e);
        }

        let tier = {
            let mut tables = self.tables.lock();
            let RunTables { runs, session_to_run, .. } = &mut *tables;
            let Some(run) = runs.get_mut(&run_id) else {
                return Err(ChallengeError::RunNotFound(run_id));
            };
            run.current_session_id = session_id;
            run.transition_started_at = now;
            session_to_run.insert(session_id, run_id);
            run.current_tier
        };

        let dungeon_name =
            cfg.dungeon(map_id).map(|d| d.name.clone()).unwrap_or_else(|| "Unknown".into());
        self.announce(
            &actors,
            &format!("[Roguelike] Entering {} — Tier {}", dungeon_name, tier),
        );
        info!("Run {} transitioned to tier {} — map {} ({})", run_id, tier, map_id, dungeon_name);
        Ok(session_id)
    }

    /// Build the scaling context a session inherits from its run.
    fn run_context(&self, run: &RoguelikeRun, cfg: &EngineConfig) -> RunContext {
        let rl = &cfg.roguelike;
        let mut ctx = RunContext {
            run_id: run.id,
            tier_health_mult: scaling::tier_multiplier(
                run.current_tier,
                rl.hp_scaling_per_tier,
                rl.exponential_threshold,
                rl.exponential_factor,
            ),
            tier_damage_mult: scaling::tier_multiplier(
                run.current_tier,
                rl.dmg_scaling_per_tier,
                rl.exponential_threshold,
                rl.exponential_factor,
            ),
            tier_armor_mult: scaling::tier_armor_multiplier(
                run.current_tier,
                rl.armor_scaling_per_tier,
            ),
            ..RunContext::default()
        };
        for affix in &run.active_affixes {
            if let Some(def) = self.affixes.iter().find(|d| d.id == *affix) {
                ctx.trash_health_mult *= def.trash_health_mult;
                ctx.trash_damage_mult *= def.trash_damage_mult;
                ctx.boss_health_mult *= def.boss_health_mult;
                ctx.boss_damage_mult *= def.boss_damage_mult;
                ctx.elite_chance_mult *= def.elite_chance_mult;
            }
        }
        ctx
    }

    // =======================================================================
    // Completion rewards
    // =======================================================================

    /// Tier-scaled rewards when a run ends gracefully.
    ///
    /// Guaranteed epic count follows the affix tier thresholds; the bonus
    /// roll keeps two distinct branches — merging them would change drop
    /// odds at the tier boundaries.
    fn distribute_run_rewards(&self, run: &RoguelikeRun) {
        let cfg = self.config.current();
        let catalog = self.catalog.current();
        let guaranteed_epics = if run.current_tier >= cfg.roguelike.third_affix_tier {
            2
        } else if run.current_tier >= cfg.roguelike.second_affix_tier {
            1
        } else {
            0
        };

        let mut rng = rand::thread_rng();
        for p in &run.participants {
            if !self.world.actor_online(p.actor) {
                continue;
            }
            let level = self.world.actor_level(p.actor).unwrap_or(1);
            let reward_level = level.min(MAX_PLAYER_LEVEL);

            let gold = level as u32 * 300 * run.floors_cleared
                + level as u32 * 100 * run.current_tier;
            self.world.give_money(p.actor, gold);
            self.world
                .send_message(p.actor, &format!("[Roguelike] You received {} coins.", gold));

            for _ in 0..guaranteed_epics {
                self.sessions.give_item_reward(p.actor, reward_level, ItemQuality::Epic, &catalog);
            }

            if guaranteed_epics == 0 {
                // Below the guaranteed-epic tiers: one roll, epic first,
                // then rare.
                if cfg.rewards.epic_chance > 0
                    && rng.gen_ratio(cfg.rewards.epic_chance.min(100), 100)
                {
                    self.sessions.give_item_reward(
                        p.actor,
                        reward_level,
                        ItemQuality::Epic,
                        &catalog,
                    );
                } else if cfg.rewards.rare_chance > 0
                    && rng.gen_ratio(cfg.rewards.rare_chance.min(100), 100)
                {
                    self.sessions.give_item_reward(
                        p.actor,
                        reward_level,
                        ItemQuality::Rare,
                        &catalog,
                    );
                }
            } else if cfg.rewards.rare_chance > 0
                && rng.gen_ratio(cfg.rewards.rare_chance.min(100), 100)
            {
                // Guaranteed epics present: a single shot at one extra.
                self.sessions.give_item_reward(p.actor, reward_level, ItemQuality::Epic, &catalog);
            }
        }
    }

    // =======================================================================
    // Tick
    // =======================================================================

    /// Advance every run by one tick: expire transition grace windows,
    /// abandon all-offline runs, re-apply missing buff auras.
    pub fn update(&self, now: u64) {
        let cfg = self.config.current();
        let mut to_abandon = Vec::new();
        let mut reapply: Vec<(ActorId, u32)> = Vec::new();

        {
            let mut tables = self.tables.lock();
            for (rid, run) in tables.runs.iter_mut() {
                if run.transition_started_at > 0 {
                    let elapsed = now.saturating_sub(run.transition_started_at);
                    if elapsed < cfg.roguelike.transition_grace_secs {
                        continue;
                    }
                    run.transition_started_at = 0;
                }

                let any_online =
                    run.participants.iter().any(|p| self.world.actor_online(p.actor));
                if !any_online {
                    to_abandon.push(*rid);
                    continue;
                }

                // A death strips auras on many hosts; restore the stack.
                if run.is_active() && run.buff_stacks > 0 {
                    for p in &run.participants {
                        if self.world.actor_online(p.actor)
                            && self.world.actor_alive(p.actor)
                            && self.world.stat_buff_stacks(p.actor) != run.buff_stacks
                        {
                            reapply.push((p.actor, run.buff_stacks));
                        }
                    }
                }
            }
        }

        for (actor, stacks) in reapply {
            self.world.set_stat_buff(actor, stacks);
        }
        for rid in to_abandon {
            info!("Run {} — all participants offline, abandoning", rid);
            self.end_run(rid, false, now);
        }
    }

    // =======================================================================
    // Queries
    // =======================================================================

    pub fn run_for_actor(&self, actor: ActorId) -> Option<u32> {
        self.tables.lock().actor_to_run.get(&actor).copied()
    }

    pub fn run_for_session(&self, session_id: u32) -> Option<u32> {
        self.tables.lock().session_to_run.get(&session_id).copied()
    }

    pub fn run_snapshot(&self, run_id: u32) -> Option<RoguelikeRun> {
        self.tables.lock().runs.get(&run_id).cloned()
    }

    pub fn active_run_count(&self) -> usize {
        self.tables.lock().runs.len()
    }

    pub fn affix_defs(&self) -> &[AffixDef] {
        &self.affixes
    }

    fn save_run_leaderboard(&self, run: &RoguelikeRun, duration: u64) {
        let Some(persistence) = &self.persistence else { return };
        let leader_name =
            self.world.actor_name(run.leader).unwrap_or_else(|| "Unknown".into());
        persistence.save_run_result(RunResultRow {
            actor: run.leader as i64,
            leader_name,
            tier_reached: run.current_tier as i32,
            floors_cleared: run.floors_cleared as i32,
            total_kills: (run.total_mobs_killed + run.total_bosses_killed) as i64,
            duration: duration as i64,
            party_size: run.participants.len() as i16,
        });
    }

    fn announce(&self, actors: &[ActorId], text: &str) {
        for actor in actors {
            self.world.send_message(*actor, text);
        }
    }
}

/// The static affix table.
fn build_affix_pool() -> Vec<AffixDef> {
    vec![
        AffixDef {
            id: Affix::Fortified,
            name: "Fortified",
            trash_health_mult: 1.30,
            trash_damage_mult: 1.15,
            boss_health_mult: 1.0,
            boss_damage_mult: 1.0,
            elite_chance_mult: 1.0,
        },
        AffixDef {
            id: Affix::Tyrannical,
            name: "Tyrannical",
            trash_health_mult: 1.0,
            trash_damage_mult: 1.0,
            boss_health_mult: 1.40,
            boss_damage_mult: 1.20,
            elite_chance_mult: 1.0,
        },
        AffixDef {
            id: Affix::Raging,
            name: "Raging",
            trash_health_mult: 1.0,
            trash_damage_mult: 1.25,
            boss_health_mult: 1.0,
            boss_damage_mult: 1.25,
            elite_chance_mult: 1.0,
        },
        AffixDef {
            id: Affix::Bolstering,
            name: "Bolstering",
            trash_health_mult: 1.20,
            trash_damage_mult: 1.0,
            boss_health_mult: 1.20,
            boss_damage_mult: 1.0,
            elite_chance_mult: 1.0,
        },
        AffixDef {
            id: Affix::Savage,
            name: "Savage",
            trash_health_mult: 1.0,
            trash_damage_mult: 1.10,
            boss_health_mult: 1.0,
            boss_damage_mult: 1.0,
            elite_chance_mult: 2.0,
        },
    ]
}

/// Affixes for the run's current tier: none below the start tier, then
/// one, two, three as the thresholds are reached. Drawn without
/// replacement from a shuffled pool.
fn select_affixes_for_tier(run: &mut RoguelikeRun, cfg: &EngineConfig, defs: &[AffixDef]) {
    run.active_affixes.clear();

    let rl = &cfg.roguelike;
    if run.current_tier < rl.affix_start_tier || defs.is_empty() {
        return;
    }

    let count = if run.current_tier >= rl.third_affix_tier {
        3
    } else if run.current_tier >= rl.second_affix_tier {
        2
    } else {
        1
    };

    let mut pool: Vec<Affix> = defs.iter().map(|d| d.id).collect();
    let mut rng = rand::thread_rng();
    pool.shuffle(&mut rng);
    run.active_affixes.extend(pool.into_iter().take(count));
}

/// Random dungeon within the base difficulty's level range, avoiding the
/// previous map where possible.
fn select_random_dungeon(cfg: &EngineConfig, difficulty_id: u32, previous_map: u32) -> Option<u32> {
    let (min_level, max_level) = match cfg.difficulty(difficulty_id) {
        Some(d) => (d.min_level, d.max_level),
        None => (1, MAX_PLAYER_LEVEL),
    };
    let candidates = cfg.dungeons_for_level(min_level, max_level);
    if candidates.is_empty() {
        return None;
    }

    let mut rng = rand::thread_rng();
    if candidates.len() > 1 && previous_map != 0 {
        let filtered: Vec<_> =
            candidates.iter().filter(|d| d.map_id != previous_map).collect();
        if let Some(pick) = filtered.choose(&mut rng) {
            return Some(pick.map_id);
        }
    }
    candidates.choose(&mut rng).map(|d| d.map_id)
}

fn affix_names(active: &[Affix], defs: &[AffixDef]) -> String {
    let names: Vec<&str> = active
        .iter()
        .filter_map(|a| defs.iter().find(|d| d.id == *a).map(|d| d.name))
        .collect();
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::world::{Location, Position};

    fn run_at_tier(tier: u32) -> RoguelikeRun {
        RoguelikeRun {
            id: 1,
            leader: 1,
            state: RunState::Active,
            theme_id: 0,
            base_difficulty_id: 1,
            scale_to_party: true,
            current_tier: tier,
            current_session_id: 0,
            floors_cleared: tier.saturating_sub(1),
            previous_map_id: 0,
            buff_stacks: 0,
            active_affixes: Vec::new(),
            participants: vec![RunParticipant {
                actor: 1,
                original_location: Location {
                    map_id: 0,
                    instance_id: 0,
                    position: Position::default(),
                },
            }],
            started_at: 0,
            transition_started_at: 0,
            total_mobs_killed: 0,
            total_bosses_killed: 0,
            total_deaths: 0,
        }
    }

    #[test]
    fn test_affix_count_follows_tier_thresholds() {
        // Defaults: start 3, second 7, third 10.
        let cfg = EngineConfig::default();
        let defs = build_affix_pool();

        for (tier, expected) in [(1, 0usize), (2, 0), (3, 1), (6, 1), (7, 2), (9, 2), (10, 3), (15, 3)]
        {
            let mut run = run_at_tier(tier);
            select_affixes_for_tier(&mut run, &cfg, &defs);
            assert_eq!(run.active_affixes.len(), expected, "tier {}", tier);
        }
    }

    #[test]
    fn test_affixes_drawn_without_replacement() {
        let cfg = EngineConfig::default();
        let defs = build_affix_pool();
        for _ in 0..50 {
            let mut run = run_at_tier(12);
            select_affixes_for_tier(&mut run, &cfg, &defs);
            let mut seen = std::collections::HashSet::new();
            for a in &run.active_affixes {
                assert!(seen.insert(*a), "duplicate affix {:?}", a);
            }
        }
    }

    #[test]
    fn test_dungeon_choice_avoids_previous_map() {
        let cfg = EngineConfig::default();
        // Difficulty 1 (levels 1-19) intersects maps 101, 102, 103.
        for _ in 0..50 {
            let pick = select_random_dungeon(&cfg, 1, 101).unwrap();
            assert_ne!(pick, 101);
        }
        // With only one candidate the previous map is allowed again.
        let mut narrow = EngineConfig::default();
        narrow.dungeons.retain(|d| d.map_id == 101);
        assert_eq!(select_random_dungeon(&narrow, 1, 101), Some(101));
    }

    #[test]
    fn test_run_context_multiplies_affixes_on_tier_curve() {
        let world = std::sync::Arc::new(crate::world::MemoryWorld::new());
        let config = std::sync::Arc::new(crate::config::ConfigStore::new(EngineConfig::default()));
        let catalog = std::sync::Arc::new(crate::catalog::CatalogStore::new(
            crate::catalog::EntityCatalog::with_defaults(),
        ));
        let sessions = std::sync::Arc::new(crate::session::SessionManager::new(
            config.clone(),
            catalog.clone(),
            world.clone(),
            None,
        ));
        let manager = RunManager::new(config.clone(), catalog, world, sessions, None);

        let cfg = config.current();
        let mut run = run_at_tier(4);
        run.active_affixes = vec![Affix::Fortified, Affix::Tyrannical];
        let ctx = manager.run_context(&run, &cfg);

        let expected_tier_hp = scaling::tier_multiplier(4, 0.10, 5, 1.15);
        assert!((ctx.tier_health_mult - expected_tier_hp).abs() < 1e-5);
        assert!((ctx.trash_health_mult - 1.30).abs() < 1e-5);
        assert!((ctx.trash_damage_mult - 1.15).abs() < 1e-5);
        assert!((ctx.boss_health_mult - 1.40).abs() < 1e-5);
        assert!((ctx.boss_damage_mult - 1.20).abs() < 1e-5);
        assert!((ctx.elite_chance_mult - 1.0).abs() < 1e-5);
        assert!((ctx.tier_armor_mult - scaling::tier_armor_multiplier(4, 0.05)).abs() < 1e-5);
    }

    use crate::catalog::EntityCatalog;
    use crate::world::MemoryWorld;

    const T0: u64 = 1_000_000;

    fn full_stack_with(
        cfg: EngineConfig,
    ) -> (Arc<MemoryWorld>, Arc<SessionManager>, RunManager) {
        let world = Arc::new(MemoryWorld::new());
        let config = Arc::new(ConfigStore::new(cfg));
        let catalog = Arc::new(CatalogStore::new(EntityCatalog::with_defaults()));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            catalog.clone(),
            world.clone(),
            None,
        ));
        let runs = RunManager::new(config, catalog, world.clone(), sessions.clone(), None);
        (world, sessions, runs)
    }

    fn full_stack() -> (Arc<MemoryWorld>, Arc<SessionManager>, RunManager) {
        full_stack_with(EngineConfig::default())
    }

    fn seed_party(world: &MemoryWorld) {
        world.add_actor(1, "Aeris", 15, 1, 0, Position::new(1.0, 2.0, 3.0));
        world.add_actor(2, "Borun", 14, 8, 0, Position::new(4.0, 5.0, 6.0));
        world.form_party(&[1, 2]);
    }

    fn tick(sessions: &SessionManager, runs: &RunManager, now: u64) {
        for event in sessions.update(now) {
            runs.handle_session_event(event, now);
        }
        runs.update(now);
    }

    /// Kill everything alive in the run's current instance, then step time
    /// through phase confirmation and the completion settle.
    fn clear_current_floor(
        world: &MemoryWorld,
        sessions: &SessionManager,
        runs: &RunManager,
        from: u64,
    ) -> u64 {
        let sid = sessions.session_for_actor(1).unwrap();
        let s = sessions.session_snapshot(sid).unwrap();
        for entity in world.living_entities_in(s.map_id, s.instance_id) {
            world.kill_entity(entity);
        }
        tick(sessions, runs, from + 1); // deaths polled, phase check opened
        tick(sessions, runs, from + 7); // boss confirmed, session Completed
        tick(sessions, runs, from + 40); // settle elapsed, floor advances
        from + 40
    }

    #[test]
    fn test_run_advances_tier_on_floor_clear() {
        let (world, sessions, runs) = full_stack();
        seed_party(&world);

        let run_id = runs.start_run(1, 1, 1, true, T0).unwrap();
        let sid = sessions.session_for_actor(1).unwrap();
        assert_eq!(runs.run_for_session(sid), Some(run_id));

        tick(&sessions, &runs, T0); // populate floor 1
        let s = sessions.session_snapshot(sid).unwrap();
        let first_map = s.map_id;
        assert_eq!(s.total_bosses, 1);
        assert_eq!(s.run.run_id, run_id);

        clear_current_floor(&world, &sessions, &runs, T0);

        let run = runs.run_snapshot(run_id).unwrap();
        assert_eq!(run.current_tier, 2);
        assert_eq!(run.floors_cleared, 1);
        assert_eq!(run.previous_map_id, first_map);
        assert_eq!(run.total_bosses_killed, 1);
        assert!(run.total_mobs_killed > 0);

        // One buff stack, applied to every living participant.
        assert_eq!(run.buff_stacks, 1);
        assert_eq!(world.stat_buff_stacks(1), 1);
        assert_eq!(world.stat_buff_stacks(2), 1);

        // A fresh session on a different map, party already inside.
        let next_sid = sessions.session_for_actor(1).unwrap();
        assert_ne!(next_sid, sid);
        let next = sessions.session_snapshot(next_sid).unwrap();
        assert_ne!(next.map_id, first_map);
        assert_eq!(world.actor_location(1).unwrap().map_id, next.map_id);

        // The new floor carries the advanced tier's scaling context.
        let cfg = EngineConfig::default();
        let expected = scaling::tier_multiplier(
            2,
            cfg.roguelike.hp_scaling_per_tier,
            cfg.roguelike.exponential_threshold,
            cfg.roguelike.exponential_factor,
        );
        assert!((next.run.tier_health_mult - expected).abs() < 1e-5);
    }

    #[test]
    fn test_wipe_round_trip_restores_pre_run_positions() {
        let (world, sessions, runs) = full_stack();
        seed_party(&world);
        let origin = world.actor_location(1).unwrap();

        let run_id = runs.start_run(1, 1, 1, true, T0).unwrap();
        tick(&sessions, &runs, T0);
        let after_clear = clear_current_floor(&world, &sessions, &runs, T0);
        assert_eq!(world.stat_buff_stacks(1), 1);
        tick(&sessions, &runs, after_clear + 1); // populate floor 2

        world.kill_actor(1);
        world.kill_actor(2);
        tick(&sessions, &runs, after_clear + 2);

        // The run is gone and exactly the applied stacks were stripped.
        assert_eq!(runs.run_for_actor(1), None);
        assert!(runs.run_snapshot(run_id).is_none());
        assert_eq!(world.stat_buff_stacks(1), 0);
        assert_eq!(world.stat_buff_stacks(2), 0);

        // Participants are alive again at their pre-run origin, not the
        // previous floor's entrance.
        assert!(world.actor_alive(1));
        let loc = world.actor_location(1).unwrap();
        assert_eq!(loc.map_id, origin.map_id);
        assert_eq!(loc.position, origin.position);

        assert_eq!(sessions.session_for_actor(1), None);
        assert!(sessions.is_on_cooldown(1, after_clear + 3));
    }

    #[test]
    fn test_graceful_exit_grants_run_rewards() {
        let (world, sessions, runs) = full_stack();
        world.add_actor(1, "Aeris", 15, 1, 0, Position::new(1.0, 2.0, 3.0));

        let run_id = runs.start_run(1, 1, 1, true, T0).unwrap();
        tick(&sessions, &runs, T0);
        let after_clear = clear_current_floor(&world, &sessions, &runs, T0);

        let money_before = world.actor_money(1);
        runs.quit_run(1, after_clear + 5);

        assert!(runs.run_snapshot(run_id).is_none());
        assert!(world.actor_money(1) > money_before, "run-end gold was granted");
        assert_eq!(world.stat_buff_stacks(1), 0);
        assert_eq!(world.actor_location(1).unwrap().map_id, 0);
        assert!(sessions.is_on_cooldown(1, after_clear + 6));
    }

    #[test]
    fn test_start_run_refusals() {
        let mut cfg = EngineConfig::default();
        cfg.roguelike.enabled = false;
        let (world, _sessions, runs) = full_stack_with(cfg);
        world.add_actor(1, "Aeris", 15, 1, 0, Position::default());
        assert_eq!(runs.start_run(1, 1, 1, true, T0), Err(ChallengeError::RoguelikeDisabled));

        let (world, sessions, runs) = full_stack();
        world.add_actor(1, "Aeris", 15, 1, 0, Position::default());
        world.add_actor(2, "Borun", 15, 1, 0, Position::default());

        runs.start_run(1, 1, 1, true, T0).unwrap();
        assert_eq!(runs.start_run(1, 1, 1, true, T0), Err(ChallengeError::AlreadyInRun(1)));

        sessions.set_cooldown(2, T0);
        assert!(matches!(runs.start_run(2, 1, 1, true, T0 + 1), Err(ChallengeError::OnCooldown(_))));
    }

    #[test]
    fn test_unknown_difficulty_falls_back_to_first() {
        let (world, _sessions, runs) = full_stack();
        world.add_actor(1, "Aeris", 15, 1, 0, Position::default());
        let run_id = runs.start_run(1, 99, 1, true, T0).unwrap();
        assert_eq!(runs.run_snapshot(run_id).unwrap().base_difficulty_id, 1);
    }
}
