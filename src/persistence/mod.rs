//! Persistence layer.
//!
//! All database writes are fire-and-forget from the engine's perspective:
//! the managers push commands into an mpsc channel and a background task
//! drains it, writing through to Postgres. Errors are logged, never
//! propagated back into run control flow. The tick thread never blocks on
//! I/O.

mod database;

pub use database::Database;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::session::PlayerStats;
use crate::world::ActorId;

/// One finished standalone challenge, for the challenge leaderboard.
#[derive(Debug, Clone)]
pub struct ChallengeResultRow {
    pub actor: i64,
    pub leader_name: String,
    pub map_id: i32,
    pub difficulty_id: i32,
    pub clear_time: i64,
    pub party_size: i16,
    pub scaled: bool,
}

/// One finished roguelike run, for the run leaderboard.
#[derive(Debug, Clone)]
pub struct RunResultRow {
    pub actor: i64,
    pub leader_name: String,
    pub tier_reached: i32,
    pub floors_cleared: i32,
    pub total_kills: i64,
    pub duration: i64,
    pub party_size: i16,
}

/// Commands sent to the persistence background task.
#[derive(Debug)]
pub enum PersistenceCommand {
    /// Upsert a player's lifetime statistics.
    SaveStats { actor: ActorId, stats: PlayerStats },
    /// Load a player's lifetime statistics (response via oneshot).
    LoadStats {
        actor: ActorId,
        response: tokio::sync::oneshot::Sender<Option<PlayerStats>>,
    },
    /// Append a challenge leaderboard row.
    SaveChallengeResult(ChallengeResultRow),
    /// Append a roguelike leaderboard row.
    SaveRunResult(RunResultRow),
    /// Shut the persistence task down.
    Shutdown,
}

/// Handle for sending commands to the persistence task.
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceHandle {
    /// Save stats (fire and forget — non-blocking).
    pub fn save_stats(&self, actor: ActorId, stats: PlayerStats) {
        let _ = self.sender.try_send(PersistenceCommand::SaveStats { actor, stats });
    }

    /// Load stats (async — use sparingly, e.g. for a stats query command).
    pub async fn load_stats(&self, actor: ActorId) -> Option<PlayerStats> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .sender
            .send(PersistenceCommand::LoadStats { actor, response: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub fn save_challenge_result(&self, row: ChallengeResultRow) {
        let _ = self.sender.try_send(PersistenceCommand::SaveChallengeResult(row));
    }

    pub fn save_run_result(&self, row: RunResultRow) {
        let _ = self.sender.try_send(PersistenceCommand::SaveRunResult(row));
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(PersistenceCommand::Shutdown).await;
    }
}

/// Connect to the database, ensure the schema exists, and spawn the
/// background task. Returns a handle for sending commands.
pub async fn init(
    database_url: &str,
) -> Result<PersistenceHandle, Box<dyn std::error::Error + Send + Sync>> {
    let db = Database::connect(database_url).await?;
    info!("Connected to PostgreSQL");

    db.ensure_schema().await?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(persistence_task(db, rx));
    info!("Persistence background task started");

    Ok(PersistenceHandle { sender: tx })
}

/// Background task that handles all persistence operations.
async fn persistence_task(db: Database, mut rx: mpsc::Receiver<PersistenceCommand>) {
    info!("Persistence task running");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PersistenceCommand::SaveStats { actor, stats } => {
                if let Err(e) = db.save_player_stats(actor as i64, &stats).await {
                    error!("Failed to save stats for {}: {}", actor, e);
                }
            }

            PersistenceCommand::LoadStats { actor, response } => {
                let result = match db.load_player_stats(actor as i64).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!("Failed to load stats for {}: {}", actor, e);
                        None
                    }
                };
                let _ = response.send(result);
            }

            PersistenceCommand::SaveChallengeResult(row) => {
                if let Err(e) = db.insert_challenge_result(&row).await {
                    error!("Failed to save challenge leaderboard row: {}", e);
                }
            }

            PersistenceCommand::SaveRunResult(row) => {
                if let Err(e) = db.insert_run_result(&row).await {
                    error!("Failed to save run leaderboard row: {}", e);
                }
            }

            PersistenceCommand::Shutdown => {
                info!("Persistence task shutting down");
                break;
            }
        }
    }

    info!("Persistence task stopped");
}
