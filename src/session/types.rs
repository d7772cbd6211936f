//! Session state objects.
//!
//! One [`Session`] per active challenge run, owned exclusively by the
//! session manager and mutated only while its table guard is held.

use crate::world::{ActorId, EntityId, Location, Position};

/// Lifecycle of a single dungeon run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    /// Instance is being set up.
    Preparing,
    /// Players are inside, fighting trash.
    InProgress,
    /// Reserved: the phase-resolution protocol tracks boss progress
    /// without a dedicated state in practice.
    BossPhase,
    /// Boss dead, awaiting teleport-out.
    Completed,
    /// Time expired or total party wipe.
    Failed,
    /// All players left the instance.
    Abandoned,
}

/// Per-participant bookkeeping within a session.
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub actor: ActorId,
    /// Where to return the participant when the session ends.
    pub return_location: Location,
    pub mobs_killed: u32,
    pub bosses_killed: u32,
    pub deaths: u32,
    /// Edge detector for the death poll; reset on resurrection.
    pub death_counted: bool,
}

impl ParticipantRecord {
    pub fn new(actor: ActorId, return_location: Location) -> Self {
        Self {
            actor,
            return_location,
            mobs_killed: 0,
            bosses_killed: 0,
            deaths: 0,
            death_counted: false,
        }
    }
}

/// A summoned creature the session tracks.
#[derive(Debug, Clone)]
pub struct SpawnedEntity {
    pub id: EntityId,
    pub template: u32,
    pub elite: bool,
    pub boss: bool,
    pub dead: bool,
}

/// One candidate placement inside the dungeon.
#[derive(Debug, Clone)]
pub struct SpawnPointSlot {
    pub position: Position,
    pub distance_from_entrance: f32,
    pub boss_position: bool,
    pub used: bool,
}

/// Deferred confirmation window opened when a boss-tagged entity dies.
///
/// Scripted multi-stage encounters may spawn a follow-up form after the
/// first model dies; the grace window lets that transition happen before
/// the kill is declared.
#[derive(Debug, Clone)]
pub struct PendingPhaseCheck {
    pub position: Position,
    pub died_at: u64,
    pub template: u32,
    pub resolved: bool,
}

/// Roguelike scaling context a run attaches to the sessions it owns.
///
/// `run_id` 0 means the session is standalone and every multiplier is
/// neutral.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_id: u32,
    pub tier_health_mult: f32,
    pub tier_damage_mult: f32,
    pub tier_armor_mult: f32,
    pub trash_health_mult: f32,
    pub trash_damage_mult: f32,
    pub boss_health_mult: f32,
    pub boss_damage_mult: f32,
    pub elite_chance_mult: f32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            run_id: 0,
            tier_health_mult: 1.0,
            tier_damage_mult: 1.0,
            tier_armor_mult: 1.0,
            trash_health_mult: 1.0,
            trash_damage_mult: 1.0,
            boss_health_mult: 1.0,
            boss_damage_mult: 1.0,
            elite_chance_mult: 1.0,
        }
    }
}

/// The master state object for one dungeon run.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u32,
    pub leader: ActorId,
    pub state: SessionState,

    // --- Configuration chosen at creation ---
    pub difficulty_id: u32,
    pub theme_id: u32,
    pub map_id: u32,
    pub instance_id: u32,
    pub scale_to_party: bool,

    // --- Effective level band, derived once ---
    pub effective_level: u8,
    pub band_min: u8,
    pub band_max: u8,

    // --- Timing (epoch seconds) ---
    pub start_time: u64,
    pub end_time: u64,
    /// 0 = unlimited.
    pub time_limit: u64,

    // --- Tracking ---
    pub participants: Vec<ParticipantRecord>,
    pub spawned: Vec<SpawnedEntity>,
    pub spawn_points: Vec<SpawnPointSlot>,
    pub phase_checks: Vec<PendingPhaseCheck>,

    // --- Progress ---
    pub total_mobs: u32,
    pub mobs_killed: u32,
    pub total_bosses: u32,
    pub bosses_killed: u32,
    pub wipes: u32,

    pub entrance: Position,
    pub run: RunContext,
    /// Set once a terminal event for a roguelike-owned session has been
    /// handed to the run manager, so it is never emitted twice.
    pub handed_off: bool,
}

impl Session {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Preparing | SessionState::InProgress | SessionState::BossPhase
        )
    }

    pub fn is_roguelike(&self) -> bool {
        self.run.run_id != 0
    }

    pub fn has_participant(&self, actor: ActorId) -> bool {
        self.participants.iter().any(|p| p.actor == actor)
    }

    pub fn participant_mut(&mut self, actor: ActorId) -> Option<&mut ParticipantRecord> {
        self.participants.iter_mut().find(|p| p.actor == actor)
    }

    pub fn is_populated(&self) -> bool {
        self.total_mobs > 0 || self.total_bosses > 0
    }

    /// One-line progress summary for status queries.
    pub fn status_line(&self) -> String {
        format!(
            "Session {} — {:?}, Mobs {}/{}, Bosses {}/{}, Band {}-{}",
            self.id,
            self.state,
            self.mobs_killed,
            self.total_mobs,
            self.bosses_killed,
            self.total_bosses,
            self.band_min,
            self.band_max
        )
    }
}

/// Lifetime statistics for one player.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerStats {
    pub total_runs: u32,
    pub completed_runs: u32,
    pub failed_runs: u32,
    pub total_mobs_killed: u32,
    pub total_bosses_killed: u32,
    pub total_deaths: u32,
    /// Seconds; 0 = no completed run yet.
    pub fastest_clear: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_default_is_neutral() {
        let ctx = RunContext::default();
        assert_eq!(ctx.run_id, 0);
        assert!((ctx.tier_health_mult - 1.0).abs() < f32::EPSILON);
        assert!((ctx.elite_chance_mult - 1.0).abs() < f32::EPSILON);
    }
}
