//! Challenge-run orchestration engine.
//!
//! Instantiates, scales and progresses short-lived cooperative challenge
//! runs inside a shared world: a party enters a cleared instance populated
//! with re-themed, re-leveled enemies, fights to a boss kill, and receives
//! rewards. Roguelike mode chains runs together with escalating tiers,
//! stacking buffs and per-tier affixes.
//!
//! The engine is an in-process orchestration layer. It talks to the hosting
//! game server through the [`world::WorldOps`] surface and never holds
//! long-lived references to world objects, only opaque ids resolved per
//! access. All state transitions happen synchronously inside a periodic
//! tick driven by the host's main loop.

pub mod catalog;
pub mod config;
pub mod persistence;
pub mod roguelike;
pub mod scaling;
pub mod session;
pub mod world;

use world::ActorId;

/// Highest level a creature can be forced to.
pub const MAX_CREATURE_LEVEL: u8 = 83;

/// Level cap for players; max-level players receive no kill XP.
pub const MAX_PLAYER_LEVEL: u8 = 80;

/// Largest party a session will record.
pub const MAX_PARTY_SIZE: usize = 5;

/// Fixed tick interval for the host main loop, in milliseconds.
pub const TICK_INTERVAL_MS: u64 = 1000;

/// Precondition and lookup failures surfaced to callers.
///
/// Everything here is a synchronous refusal: no session or run state is
/// created when one of these is returned. Runtime degradation (empty
/// candidate pools, failed relocations of single participants) is logged
/// and absorbed instead, per the failure taxonomy this engine follows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("no challenge slots available")]
    AtCapacity,
    #[error("unknown difficulty {0}")]
    UnknownDifficulty(u32),
    #[error("unknown theme {0}")]
    UnknownTheme(u32),
    #[error("unknown dungeon {0}")]
    UnknownDungeon(u32),
    #[error("participant {0} is already in a challenge")]
    AlreadyInSession(ActorId),
    #[error("participant {0} is already in a roguelike run")]
    AlreadyInRun(ActorId),
    #[error("on cooldown for {0} more seconds")]
    OnCooldown(u64),
    #[error("dungeon {0} has no entrance coordinate")]
    NoEntrance(u32),
    #[error("no participant could be relocated into the instance")]
    TeleportFailed,
    #[error("session {0} not found")]
    SessionNotFound(u32),
    #[error("run {0} not found")]
    RunNotFound(u32),
    #[error("roguelike mode is disabled")]
    RoguelikeDisabled,
    #[error("no eligible dungeon for the selected difficulty")]
    NoDungeonAvailable,
    #[error("actor {0} is not present in the world")]
    ActorUnavailable(ActorId),
}
