//! Read model persistence.
//!
//! Every read model row carries its own `last_processed_position`, which
//! projectors compare against incoming events to stay idempotent under
//! redelivery.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::instrument;

use crate::error::Result;
use crate::telemetry::LedgerMetrics;

use super::retry::RetryPolicy;

/// A denormalized, query-optimized row derived from the event log.
pub trait ReadModel: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table holding this model in PostgreSQL.
    const TABLE: &'static str;

    fn id(&self) -> &str;

    /// Version of the source aggregate reflected in the row.
    fn version(&self) -> u64;

    /// Highest global position whose effect is in the row.
    fn last_processed_position(&self) -> u64;
}

/// Durable upsert store for one read model type.
#[async_trait]
pub trait ReadModelRepository<M: ReadModel>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<M>>;

    /// Every row, ordered by id.
    async fn find_all(&self) -> Result<Vec<M>>;

    /// Insert or replace the row keyed by `model.id()`.
    async fn save(&self, model: &M) -> Result<()>;

    /// Remove a row; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove every row; used when a projection is rebuilt.
    async fn clear(&self) -> Result<u64>;
}

// =============================================================================
// In-memory
// =============================================================================

/// Repository backed by a concurrent hash map.
pub struct InMemoryReadModelRepository<M: ReadModel> {
    rows: DashMap<String, M>,
}

impl<M: ReadModel> InMemoryReadModelRepository<M> {
    pub fn new() -> Self {
        Self { rows: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows matching a predicate, ordered by id.
    pub fn filter(&self, predicate: impl Fn(&M) -> bool) -> Vec<M> {
        let mut rows: Vec<M> = self
            .rows
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.id().cmp(b.id()));
        rows
    }
}

impl<M: ReadModel> Default for InMemoryReadModelRepository<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: ReadModel> ReadModelRepository<M> for InMemoryReadModelRepository<M> {
    async fn find_by_id(&self, id: &str) -> Result<Option<M>> {
        Ok(self.rows.get(id).map(|row| row.value().clone()))
    }

    async fn find_all(&self) -> Result<Vec<M>> {
        Ok(self.filter(|_| true))
    }

    async fn save(&self, model: &M) -> Result<()> {
        self.rows
            .entry(model.id().to_string())
            .and_modify(|row| {
                if row.last_processed_position() <= model.last_processed_position() {
                    *row = model.clone();
                }
            })
            .or_insert_with(|| model.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.rows.remove(id).is_some())
    }

    async fn clear(&self) -> Result<u64> {
        let count = self.rows.len() as u64;
        self.rows.clear();
        Ok(count)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Repository storing each model as JSONB in its own table.
pub struct PgReadModelRepository<M: ReadModel> {
    pool: PgPool,
    _model: PhantomData<fn() -> M>,
}

impl<M: ReadModel> PgReadModelRepository<M> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _model: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn decode_rows(rows: Vec<serde_json::Value>) -> Result<Vec<M>> {
        rows.into_iter()
            .map(|data| serde_json::from_value(data).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl<M: ReadModel> ReadModelRepository<M> for PgReadModelRepository<M> {
    #[instrument(skip(self), fields(table = M::TABLE))]
    async fn find_by_id(&self, id: &str) -> Result<Option<M>> {
        let data: Option<serde_json::Value> =
            sqlx::query_scalar(&format!("SELECT data FROM {} WHERE id = $1", M::TABLE))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        data.map(|d| serde_json::from_value(d).map_err(Into::into))
            .transpose()
    }

    #[instrument(skip(self), fields(table = M::TABLE))]
    async fn find_all(&self) -> Result<Vec<M>> {
        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar(&format!("SELECT data FROM {} ORDER BY id", M::TABLE))
                .fetch_all(&self.pool)
                .await?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self, model), fields(table = M::TABLE, id = model.id()))]
    async fn save(&self, model: &M) -> Result<()> {
        // The WHERE clause keeps last_processed_position non-decreasing per row.
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, version, last_processed_position, data, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE
            SET version = EXCLUDED.version,
                last_processed_position = EXCLUDED.last_processed_position,
                data = EXCLUDED.data,
                updated_at = NOW()
            WHERE {table}.last_processed_position <= EXCLUDED.last_processed_position
            "#,
            table = M::TABLE
        ))
        .bind(model.id())
        .bind(model.version() as i64)
        .bind(model.last_processed_position() as i64)
        .bind(serde_json::to_value(model)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(table = M::TABLE))]
    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", M::TABLE))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", M::TABLE))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Retrying decorator
// =============================================================================

/// Wraps a repository so `save` absorbs transient failures with a bounded retry.
///
/// Reads and deletes pass straight through.
pub struct RetryingRepository<M: ReadModel> {
    inner: Arc<dyn ReadModelRepository<M>>,
    policy: RetryPolicy,
}

impl<M: ReadModel> RetryingRepository<M> {
    pub fn new(inner: Arc<dyn ReadModelRepository<M>>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<M: ReadModel> ReadModelRepository<M> for RetryingRepository<M> {
    async fn find_by_id(&self, id: &str) -> Result<Option<M>> {
        self.inner.find_by_id(id).await
    }

    async fn find_all(&self) -> Result<Vec<M>> {
        self.inner.find_all().await
    }

    async fn save(&self, model: &M) -> Result<()> {
        let inner = &self.inner;
        let mut first = true;
        self.policy
            .run(M::TABLE, move || {
                if !std::mem::take(&mut first) {
                    LedgerMetrics::save_retry(M::TABLE);
                }
                inner.save(model)
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn clear(&self) -> Result<u64> {
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        position: u64,
        value: String,
    }

    impl ReadModel for Row {
        const TABLE: &'static str = "rows";

        fn id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> u64 {
            1
        }

        fn last_processed_position(&self) -> u64 {
            self.position
        }
    }

    fn row(id: &str, position: u64, value: &str) -> Row {
        Row {
            id: id.into(),
            position,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let repo = InMemoryReadModelRepository::<Row>::new();
        repo.save(&row("a", 1, "one")).await.unwrap();
        repo.save(&row("a", 2, "two")).await.unwrap();

        assert_eq!(repo.len(), 1);
        assert_eq!(repo.find_by_id("a").await.unwrap().unwrap().value, "two");
    }

    #[tokio::test]
    async fn test_save_never_moves_position_backwards() {
        let repo = InMemoryReadModelRepository::<Row>::new();
        repo.save(&row("a", 5, "new")).await.unwrap();
        repo.save(&row("a", 3, "old")).await.unwrap();

        assert_eq!(repo.find_by_id("a").await.unwrap().unwrap().value, "new");
    }

    #[tokio::test]
    async fn test_find_all_sorted_and_delete() {
        let repo = InMemoryReadModelRepository::<Row>::new();
        repo.save(&row("b", 1, "")).await.unwrap();
        repo.save(&row("a", 1, "")).await.unwrap();

        let ids: Vec<String> = repo.find_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert_eq!(repo.clear().await.unwrap(), 1);
        assert!(repo.is_empty());
    }
}
