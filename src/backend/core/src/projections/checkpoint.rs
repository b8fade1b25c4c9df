//! Per-projection progress through the event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::Result;

/// Stored progress of one projection.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub name: String,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// Persists the last fully processed global position of each projection.
///
/// `save` never moves a checkpoint backwards; only `reset` does.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<u64>>;

    async fn save(&self, name: &str, position: u64) -> Result<()>;

    async fn reset(&self, name: &str) -> Result<()>;

    /// All checkpoints, ordered by name.
    async fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// Checkpoints held in process memory.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: DashMap<String, (u64, DateTime<Utc>)>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.positions.get(name).map(|entry| entry.0))
    }

    async fn save(&self, name: &str, position: u64) -> Result<()> {
        let now = Utc::now();
        self.positions
            .entry(name.to_string())
            .and_modify(|entry| {
                if position > entry.0 {
                    *entry = (position, now);
                }
            })
            .or_insert((position, now));
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<()> {
        self.positions.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .positions
            .iter()
            .map(|entry| Checkpoint {
                name: entry.key().clone(),
                position: entry.value().0 as i64,
                updated_at: entry.value().1,
            })
            .collect();
        checkpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(checkpoints)
    }
}

/// Checkpoints stored in `projection_checkpoints`.
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<u64>> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM projection_checkpoints WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(position.map(|p| p as u64))
    }

    async fn save(&self, name: &str, position: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (name, position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
            SET position = GREATEST(projection_checkpoints.position, EXCLUDED.position),
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(position as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, Checkpoint>(
            "SELECT name, position, updated_at FROM projection_checkpoints ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
