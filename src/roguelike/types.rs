//! Roguelike run state objects.

use crate::world::{ActorId, Location};

/// Percent of all stats each buff stack grants.
pub const BUFF_PERCENT_PER_STACK: f32 = 10.0;

/// Lifecycle of a roguelike run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Active,
    Ended,
}

/// Per-tier modifier bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affix {
    /// Trash: +30% HP, +15% damage.
    Fortified,
    /// Bosses: +40% HP, +20% damage.
    Tyrannical,
    /// Everything hits harder: +25% damage.
    Raging,
    /// Everything has more health: +20% HP.
    Bolstering,
    /// More elites, elites hit a little harder.
    Savage,
}

/// Static multipliers of one affix. Built once at startup.
#[derive(Debug, Clone)]
pub struct AffixDef {
    pub id: Affix,
    pub name: &'static str,
    pub trash_health_mult: f32,
    pub trash_damage_mult: f32,
    pub boss_health_mult: f32,
    pub boss_damage_mult: f32,
    pub elite_chance_mult: f32,
}

/// A run participant, with the position to restore when the run ends.
#[derive(Debug, Clone)]
pub struct RunParticipant {
    pub actor: ActorId,
    /// Pre-run position, not pre-floor: wipes return here.
    pub original_location: Location,
}

/// A chained sequence of sessions with meta-progression.
#[derive(Debug, Clone)]
pub struct RoguelikeRun {
    pub id: u32,
    pub leader: ActorId,
    pub state: RunState,

    /// 0 = a fresh random theme each floor.
    pub theme_id: u32,
    pub base_difficulty_id: u32,
    pub scale_to_party: bool,

    pub current_tier: u32,
    /// 0 = no session currently owned.
    pub current_session_id: u32,
    pub floors_cleared: u32,
    /// Avoided when choosing the next floor, where possible.
    pub previous_map_id: u32,

    pub buff_stacks: u32,
    pub active_affixes: Vec<Affix>,
    pub participants: Vec<RunParticipant>,

    pub started_at: u64,
    /// Abandonment checks are suppressed while this window is open
    /// (teleports resolve asynchronously on real hosts). 0 = closed.
    pub transition_started_at: u64,

    pub total_mobs_killed: u32,
    pub total_bosses_killed: u32,
    pub total_deaths: u32,
}

impl RoguelikeRun {
    pub fn is_active(&self) -> bool {
        self.state == RunState::Active
    }

    pub fn has_participant(&self, actor: ActorId) -> bool {
        self.participants.iter().any(|p| p.actor == actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Position;

    #[test]
    fn test_run_participant_lookup() {
        let run = RoguelikeRun {
            id: 1,
            leader: 7,
            state: RunState::Active,
            theme_id: 0,
            base_difficulty_id: 1,
            scale_to_party: true,
            current_tier: 1,
            current_session_id: 0,
            floors_cleared: 0,
            previous_map_id: 0,
            buff_stacks: 0,
            active_affixes: Vec::new(),
            participants: vec![RunParticipant {
                actor: 7,
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
        };
        assert!(run.has_participant(7));
        assert!(!run.has_participant(8));
        assert!(run.is_active());
    }
}
