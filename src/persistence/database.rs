//! PostgreSQL statements for stats and leaderboards.

use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::{ChallengeResultRow, RunResultRow};
use crate::session::PlayerStats;

/// Database connection wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self { pool })
    }

    /// Create the tables when they don't exist yet.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS challenge_player_stats (
                actor BIGINT PRIMARY KEY,
                total_runs INT NOT NULL DEFAULT 0,
                completed_runs INT NOT NULL DEFAULT 0,
                failed_runs INT NOT NULL DEFAULT 0,
                total_mobs_killed INT NOT NULL DEFAULT 0,
                total_bosses_killed INT NOT NULL DEFAULT 0,
                total_deaths INT NOT NULL DEFAULT 0,
                fastest_clear INT NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS challenge_leaderboard (
                id BIGSERIAL PRIMARY KEY,
                actor BIGINT NOT NULL,
                leader_name TEXT NOT NULL,
                map_id INT NOT NULL,
                difficulty_id INT NOT NULL,
                clear_time BIGINT NOT NULL,
                party_size SMALLINT NOT NULL,
                scaled BOOLEAN NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS roguelike_leaderboard (
                id BIGSERIAL PRIMARY KEY,
                actor BIGINT NOT NULL,
                leader_name TEXT NOT NULL,
                tier_reached INT NOT NULL,
                floors_cleared INT NOT NULL,
                total_kills BIGINT NOT NULL,
                duration BIGINT NOT NULL,
                party_size SMALLINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_player_stats(
        &self,
        actor: i64,
        stats: &PlayerStats,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO challenge_player_stats
                (actor, total_runs, completed_runs, failed_runs,
                 total_mobs_killed, total_bosses_killed, total_deaths, fastest_clear)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (actor) DO UPDATE SET
                total_runs = EXCLUDED.total_runs,
                completed_runs = EXCLUDED.completed_runs,
                failed_runs = EXCLUDED.failed_runs,
                total_mobs_killed = EXCLUDED.total_mobs_killed,
                total_bosses_killed = EXCLUDED.total_bosses_killed,
                total_deaths = EXCLUDED.total_deaths,
                fastest_clear = EXCLUDED.fastest_clear",
        )
        .bind(actor)
        .bind(stats.total_runs as i32)
        .bind(stats.completed_runs as i32)
        .bind(stats.failed_runs as i32)
        .bind(stats.total_mobs_killed as i32)
        .bind(stats.total_bosses_killed as i32)
        .bind(stats.total_deaths as i32)
        .bind(stats.fastest_clear as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_player_stats(&self, actor: i64) -> Result<Option<PlayerStats>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT total_runs, completed_runs, failed_runs,
                    total_mobs_killed, total_bosses_killed, total_deaths, fastest_clear
             FROM challenge_player_stats WHERE actor = $1",
        )
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PlayerStats {
            total_runs: r.get::<i32, _>("total_runs") as u32,
            completed_runs: r.get::<i32, _>("completed_runs") as u32,
            failed_runs: r.get::<i32, _>("failed_runs") as u32,
            total_mobs_killed: r.get::<i32, _>("total_mobs_killed") as u32,
            total_bosses_killed: r.get::<i32, _>("total_bosses_killed") as u32,
            total_deaths: r.get::<i32, _>("total_deaths") as u32,
            fastest_clear: r.get::<i32, _>("fastest_clear") as u32,
        }))
    }

    pub async fn insert_challenge_result(
        &self,
        row: &ChallengeResultRow,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO challenge_leaderboard
                (actor, leader_name, map_id, difficulty_id, clear_time, party_size, scaled)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.actor)
        .bind(&row.leader_name)
        .bind(row.map_id)
        .bind(row.difficulty_id)
        .bind(row.clear_time)
        .bind(row.party_size)
        .bind(row.scaled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_run_result(&self, row: &RunResultRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO roguelike_leaderboard
                (actor, leader_name, tier_reached, floors_cleared, total_kills, duration, party_size)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.actor)
        .bind(&row.leader_name)
        .bind(row.tier_reached)
        .bind(row.floors_cleared)
        .bind(row.total_kills)
        .bind(row.duration)
        .bind(row.party_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fastest clears of one map and difficulty.
    pub async fn challenge_leaderboard(
        &self,
        map_id: i32,
        difficulty_id: i32,
        limit: i64,
    ) -> Result<Vec<ChallengeResultRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT actor, leader_name, map_id, difficulty_id, clear_time, party_size, scaled
             FROM challenge_leaderboard
             WHERE map_id = $1 AND difficulty_id = $2
             ORDER BY clear_time ASC LIMIT $3",
        )
        .bind(map_id)
        .bind(difficulty_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(challenge_row).collect())
    }

    /// Fastest clears across all maps.
    pub async fn overall_challenge_leaderboard(
        &self,
        limit: i64,
    ) -> Result<Vec<ChallengeResultRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT actor, leader_name, map_id, difficulty_id, clear_time, party_size, scaled
             FROM challenge_leaderboard
             ORDER BY clear_time ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(challenge_row).collect())
    }

    /// Deepest roguelike runs: highest tier first, floors and speed as
    /// tie-breakers.
    pub async fn run_leaderboard(&self, limit: i64) -> Result<Vec<RunResultRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT actor, leader_name, tier_reached, floors_cleared, total_kills, duration, party_size
             FROM roguelike_leaderboard
             ORDER BY tier_reached DESC, floors_cleared DESC, duration ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RunResultRow {
                actor: r.get("actor"),
                leader_name: r.get("leader_name"),
                tier_reached: r.get("tier_reached"),
                floors_cleared: r.get("floors_cleared"),
                total_kills: r.get("total_kills"),
                duration: r.get("duration"),
                party_size: r.get("party_size"),
            })
            .collect())
    }
}

fn challenge_row(r: sqlx::postgres::PgRow) -> ChallengeResultRow {
    ChallengeResultRow {
        actor: r.get("actor"),
        leader_name: r.get("leader_name"),
        map_id: r.get("map_id"),
        difficulty_id: r.get("difficulty_id"),
        clear_time: r.get("clear_time"),
        party_size: r.get("party_size"),
        scaled: r.get("scaled"),
    }
}
