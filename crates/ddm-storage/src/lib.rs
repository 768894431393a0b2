//! Storage contracts for postings, canonical demands and config, with an
//! index-aware in-memory store and a Postgres store over sqlx.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddm_core::{CanonicalDemand, DemandType, RawPosting, SimilarityConfig, SimilarityRule};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ddm-storage";

/// Bound on any single list/range fetch.
pub const MAX_FETCH_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("order by {0:?} is not supported by this store")]
    UnsupportedOrder(RecencyField),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Recency fields a canonical-demand fetch may be ordered by, in the fixed
/// fallback priority candidate retrieval walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecencyField {
    LastUpdatedTs,
    MessageTimeTs,
    CreatedTimeTs,
    LocalId,
}

impl RecencyField {
    pub const PRIORITY: [RecencyField; 4] = [
        RecencyField::LastUpdatedTs,
        RecencyField::MessageTimeTs,
        RecencyField::CreatedTimeTs,
        RecencyField::LocalId,
    ];

    pub fn column(self) -> &'static str {
        match self {
            RecencyField::LastUpdatedTs => "last_updated_time_ts",
            RecencyField::MessageTimeTs => "message_time_ts",
            RecencyField::CreatedTimeTs => "created_time_ts",
            RecencyField::LocalId => "local_id",
        }
    }

    /// Parse the wire spelling used by the range/count endpoints.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "last_updated_time_ts" => Some(Self::LastUpdatedTs),
            "message_time_ts" => Some(Self::MessageTimeTs),
            "created_time_ts" => Some(Self::CreatedTimeTs),
            "local_id" => Some(Self::LocalId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[async_trait]
pub trait RawPostingStore: Send + Sync {
    async fn create(&self, posting: &RawPosting) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<RawPosting>, StoreError>;
    /// Set or clear the canonical link. `actor` is recorded as override
    /// metadata when present; automated assignment passes `None`.
    async fn set_link(
        &self,
        id: Uuid,
        canonical_id: Option<&str>,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CanonicalDemandStore: Send + Sync {
    async fn create(&self, demand: &CanonicalDemand) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<CanonicalDemand>, StoreError>;
    /// Most recently touched demands by `field`, descending. May return
    /// `UnsupportedOrder` when the field has no queryable index.
    async fn list_recent(
        &self,
        field: RecencyField,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError>;
    /// Last-resort bounded fetch with no ordering guarantee.
    async fn list_unordered(&self, limit: usize) -> Result<Vec<CanonicalDemand>, StoreError>;
    /// Refresh recency metadata after a match.
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    /// First-writer-wins representative assignment; returns whether the
    /// write happened.
    async fn set_canonical_raw_if_unset(
        &self,
        id: &str,
        raw_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Administrator-forced representative assignment.
    async fn force_canonical_raw(
        &self,
        id: &str,
        raw_id: Uuid,
        set_by: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn count_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
    ) -> Result<u64, StoreError>;
    async fn list_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_similarity_config(&self) -> Result<Option<SimilarityConfig>, StoreError>;
    async fn put_similarity_config(&self, config: &SimilarityConfig) -> Result<(), StoreError>;
}

/// Opaque admin gate for override operations.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_admin(&self, actor: &str) -> Result<bool, StoreError>;
}

/// Fixed allow-list authorizer, typically fed from the environment.
#[derive(Debug, Default, Clone)]
pub struct StaticAdminList {
    admins: HashSet<String>,
}

impl StaticAdminList {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated uid list, e.g. from `DDM_ADMIN_UIDS`.
    pub fn from_env_value(value: &str) -> Self {
        Self::new(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }
}

#[async_trait]
impl Authorizer for StaticAdminList {
    async fn is_admin(&self, actor: &str) -> Result<bool, StoreError> {
        Ok(self.admins.contains(actor))
    }
}

/// Candidate retrieval: walk the recency fields in priority order and take
/// the first the store accepts; degrade to an unordered fetch, then to an
/// empty pool. Never errors — an empty pool just means no match.
pub async fn fetch_candidates(
    store: &dyn CanonicalDemandStore,
    limit: usize,
) -> Vec<CanonicalDemand> {
    for field in RecencyField::PRIORITY {
        match store.list_recent(field, limit).await {
            Ok(pool) => return pool,
            Err(StoreError::UnsupportedOrder(_)) => continue,
            Err(err) => {
                warn!(field = field.column(), %err, "recency-ordered fetch failed");
                continue;
            }
        }
    }
    match store.list_unordered(limit).await {
        Ok(pool) => pool,
        Err(err) => {
            warn!(%err, "unordered candidate fetch failed; matching against empty pool");
            Vec::new()
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    raws: HashMap<Uuid, RawPosting>,
    /// Insertion order doubles as `local_id`.
    canonicals: Vec<CanonicalDemand>,
    config: Option<SimilarityConfig>,
}

/// In-memory store used by tests and ephemeral runs. Which recency fields
/// are "indexed" is configurable so retrieval fallback can be exercised.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    indexed: HashSet<RecencyField>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_indexed_fields(RecencyField::PRIORITY)
    }

    pub fn with_indexed_fields(fields: impl IntoIterator<Item = RecencyField>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(MemoryInner::default()),
            indexed: fields.into_iter().collect(),
        })
    }
}

fn field_key(demand: &CanonicalDemand, field: RecencyField, local_id: usize) -> i64 {
    match field {
        RecencyField::LastUpdatedTs => demand.last_updated_time_ts,
        RecencyField::MessageTimeTs => demand.message_time_ts,
        RecencyField::CreatedTimeTs => demand.created_time_ts,
        RecencyField::LocalId => local_id as i64,
    }
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_FETCH_LIMIT)
}

#[async_trait]
impl RawPostingStore for MemoryStore {
    async fn create(&self, posting: &RawPosting) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.raws.insert(posting.id, posting.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawPosting>, StoreError> {
        Ok(self.inner.read().await.raws.get(&id).cloned())
    }

    async fn set_link(
        &self,
        id: Uuid,
        canonical_id: Option<&str>,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let posting = inner
            .raws
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        posting.unique_demand_id = canonical_id.map(str::to_string);
        posting.updated_at = at;
        if let Some(actor) = actor {
            posting.override_by = Some(actor.to_string());
            posting.override_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalDemandStore for MemoryStore {
    async fn create(&self, demand: &CanonicalDemand) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.canonicals.push(demand.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalDemand>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .canonicals
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn list_recent(
        &self,
        field: RecencyField,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError> {
        if !self.indexed.contains(&field) {
            return Err(StoreError::UnsupportedOrder(field));
        }
        let inner = self.inner.read().await;
        let mut rows: Vec<(i64, usize)> = inner
            .canonicals
            .iter()
            .enumerate()
            .map(|(i, d)| (field_key(d, field, i), i))
            .collect();
        rows.sort_by(|a, b| b.cmp(a));
        Ok(rows
            .into_iter()
            .take(clamp_limit(limit))
            .map(|(_, i)| inner.canonicals[i].clone())
            .collect())
    }

    async fn list_unordered(&self, limit: usize) -> Result<Vec<CanonicalDemand>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .canonicals
            .iter()
            .take(clamp_limit(limit))
            .cloned()
            .collect())
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let demand = inner
            .canonicals
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        demand.touch(now);
        Ok(())
    }

    async fn set_canonical_raw_if_unset(
        &self,
        id: &str,
        raw_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let demand = inner
            .canonicals
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if demand.canonical_raw_id.is_some() {
            return Ok(false);
        }
        demand.canonical_raw_id = Some(raw_id);
        demand.canonical_raw_set_at = Some(at);
        Ok(true)
    }

    async fn force_canonical_raw(
        &self,
        id: &str,
        raw_id: Uuid,
        set_by: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let demand = inner
            .canonicals
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        demand.canonical_raw_id = Some(raw_id);
        demand.canonical_raw_set_by = Some(set_by.to_string());
        demand.canonical_raw_set_at = Some(at);
        Ok(())
    }

    async fn count_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .canonicals
            .iter()
            .enumerate()
            .filter(|(i, d)| {
                let ts = field_key(d, field, *i);
                ts >= start_ts
                    && ts <= end_ts
                    && (!only_valid || d.demand_type == DemandType::Valid)
            })
            .count() as u64)
    }

    async fn list_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<(i64, usize)> = inner
            .canonicals
            .iter()
            .enumerate()
            .filter(|(i, d)| {
                let ts = field_key(d, field, *i);
                ts >= start_ts
                    && ts <= end_ts
                    && (!only_valid || d.demand_type == DemandType::Valid)
            })
            .map(|(i, d)| (field_key(d, field, i), i))
            .collect();
        match order {
            SortOrder::Asc => rows.sort(),
            SortOrder::Desc => rows.sort_by(|a, b| b.cmp(a)),
        }
        Ok(rows
            .into_iter()
            .take(clamp_limit(limit))
            .map(|(_, i)| inner.canonicals[i].clone())
            .collect())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_similarity_config(&self) -> Result<Option<SimilarityConfig>, StoreError> {
        Ok(self.inner.read().await.config.clone())
    }

    async fn put_similarity_config(&self, config: &SimilarityConfig) -> Result<(), StoreError> {
        self.inner.write().await.config = Some(config.clone());
        Ok(())
    }
}

/// Postgres-backed store. Queries are runtime-built; order columns come
/// from the `RecencyField` whitelist, never from caller input.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_postings (
                id UUID PRIMARY KEY,
                raw_text TEXT NOT NULL,
                hints JSONB NOT NULL DEFAULT '{}'::jsonb,
                submitter_id TEXT,
                source TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                unique_demand_id TEXT,
                override_by TEXT,
                override_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unique_demands (
                id TEXT PRIMARY KEY,
                local_id BIGSERIAL,
                raw_text TEXT NOT NULL,
                attributes_json JSONB NOT NULL DEFAULT '{}'::jsonb,
                canonical_raw_id UUID,
                canonical_raw_set_by TEXT,
                canonical_raw_set_at TIMESTAMPTZ,
                richness_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                demand_type TEXT NOT NULL DEFAULT 'valid',
                created_time TIMESTAMPTZ NOT NULL,
                message_time TIMESTAMPTZ NOT NULL,
                last_updated_time TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                created_time_ts BIGINT NOT NULL,
                message_time_ts BIGINT NOT NULL,
                last_updated_time_ts BIGINT NOT NULL,
                updated_at_ts BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_unique_demands_last_updated \
             ON unique_demands (last_updated_time_ts DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admin_config (
                config_key TEXT PRIMARY KEY,
                similarity_enabled BOOLEAN NOT NULL,
                similarity_rule TEXT NOT NULL,
                similarity_threshold DOUBLE PRECISION NOT NULL,
                updated_by TEXT,
                updated_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn demand_from_row(row: &sqlx::postgres::PgRow) -> Result<CanonicalDemand, StoreError> {
    let demand_type: String = row.try_get("demand_type")?;
    Ok(CanonicalDemand {
        id: row.try_get("id")?,
        raw_text: row.try_get("raw_text")?,
        attributes_json: row.try_get::<JsonValue, _>("attributes_json")?,
        canonical_raw_id: row.try_get("canonical_raw_id")?,
        canonical_raw_set_by: row.try_get("canonical_raw_set_by")?,
        canonical_raw_set_at: row.try_get("canonical_raw_set_at")?,
        richness_score: row.try_get("richness_score")?,
        demand_type: if demand_type == "filtered" {
            DemandType::Filtered
        } else {
            DemandType::Valid
        },
        created_time: row.try_get("created_time")?,
        message_time: row.try_get("message_time")?,
        last_updated_time: row.try_get("last_updated_time")?,
        updated_at: row.try_get("updated_at")?,
        created_time_ts: row.try_get("created_time_ts")?,
        message_time_ts: row.try_get("message_time_ts")?,
        last_updated_time_ts: row.try_get("last_updated_time_ts")?,
        updated_at_ts: row.try_get("updated_at_ts")?,
    })
}

fn posting_from_row(row: &sqlx::postgres::PgRow) -> Result<RawPosting, StoreError> {
    let hints: JsonValue = row.try_get("hints")?;
    Ok(RawPosting {
        id: row.try_get("id")?,
        raw_text: row.try_get("raw_text")?,
        hints: serde_json::from_value(hints).unwrap_or_default(),
        submitter_id: row.try_get("submitter_id")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        unique_demand_id: row.try_get("unique_demand_id")?,
        override_by: row.try_get("override_by")?,
        override_at: row.try_get("override_at")?,
    })
}

#[async_trait]
impl RawPostingStore for PgStore {
    async fn create(&self, posting: &RawPosting) -> Result<(), StoreError> {
        let hints = serde_json::to_value(&posting.hints)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO raw_postings
                (id, raw_text, hints, submitter_id, source, created_at, updated_at,
                 unique_demand_id, override_by, override_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(posting.id)
        .bind(&posting.raw_text)
        .bind(hints)
        .bind(&posting.submitter_id)
        .bind(&posting.source)
        .bind(posting.created_at)
        .bind(posting.updated_at)
        .bind(&posting.unique_demand_id)
        .bind(&posting.override_by)
        .bind(posting.override_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawPosting>, StoreError> {
        let row = sqlx::query("SELECT * FROM raw_postings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn set_link(
        &self,
        id: Uuid,
        canonical_id: Option<&str>,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = if let Some(actor) = actor {
            sqlx::query(
                r#"
                UPDATE raw_postings
                   SET unique_demand_id = $2, updated_at = $3,
                       override_by = $4, override_at = $3
                 WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(canonical_id)
            .bind(at)
            .bind(actor)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE raw_postings SET unique_demand_id = $2, updated_at = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(canonical_id)
            .bind(at)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalDemandStore for PgStore {
    async fn create(&self, demand: &CanonicalDemand) -> Result<(), StoreError> {
        let demand_type = match demand.demand_type {
            DemandType::Valid => "valid",
            DemandType::Filtered => "filtered",
        };
        sqlx::query(
            r#"
            INSERT INTO unique_demands
                (id, raw_text, attributes_json, canonical_raw_id,
                 canonical_raw_set_by, canonical_raw_set_at, richness_score,
                 demand_type, created_time, message_time, last_updated_time,
                 updated_at, created_time_ts, message_time_ts,
                 last_updated_time_ts, updated_at_ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&demand.id)
        .bind(&demand.raw_text)
        .bind(&demand.attributes_json)
        .bind(demand.canonical_raw_id)
        .bind(&demand.canonical_raw_set_by)
        .bind(demand.canonical_raw_set_at)
        .bind(demand.richness_score)
        .bind(demand_type)
        .bind(demand.created_time)
        .bind(demand.message_time)
        .bind(demand.last_updated_time)
        .bind(demand.updated_at)
        .bind(demand.created_time_ts)
        .bind(demand.message_time_ts)
        .bind(demand.last_updated_time_ts)
        .bind(demand.updated_at_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalDemand>, StoreError> {
        let row = sqlx::query("SELECT * FROM unique_demands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(demand_from_row).transpose()
    }

    async fn list_recent(
        &self,
        field: RecencyField,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError> {
        let sql = format!(
            "SELECT * FROM unique_demands ORDER BY {} DESC LIMIT $1",
            field.column()
        );
        let rows = sqlx::query(&sql)
            .bind(clamp_limit(limit) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(demand_from_row).collect()
    }

    async fn list_unordered(&self, limit: usize) -> Result<Vec<CanonicalDemand>, StoreError> {
        let rows = sqlx::query("SELECT * FROM unique_demands LIMIT $1")
            .bind(clamp_limit(limit) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(demand_from_row).collect()
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE unique_demands
               SET last_updated_time = GREATEST(last_updated_time, $2),
                   last_updated_time_ts = GREATEST(last_updated_time_ts, $3),
                   updated_at = GREATEST(updated_at, $2),
                   updated_at_ts = GREATEST(updated_at_ts, $3)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_canonical_raw_if_unset(
        &self,
        id: &str,
        raw_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE unique_demands
               SET canonical_raw_id = $2, canonical_raw_set_at = $3
             WHERE id = $1 AND canonical_raw_id IS NULL
            "#,
        )
        .bind(id)
        .bind(raw_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_canonical_raw(
        &self,
        id: &str,
        raw_id: Uuid,
        set_by: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE unique_demands
               SET canonical_raw_id = $2, canonical_raw_set_by = $3,
                   canonical_raw_set_at = $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(raw_id)
        .bind(set_by)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn count_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM unique_demands \
             WHERE {col} >= $1 AND {col} <= $2 AND ($3 = false OR demand_type = 'valid')",
            col = field.column()
        );
        let row = sqlx::query(&sql)
            .bind(start_ts)
            .bind(end_ts)
            .bind(only_valid)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn list_range(
        &self,
        field: RecencyField,
        start_ts: i64,
        end_ts: i64,
        only_valid: bool,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<CanonicalDemand>, StoreError> {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT * FROM unique_demands \
             WHERE {col} >= $1 AND {col} <= $2 AND ($3 = false OR demand_type = 'valid') \
             ORDER BY {col} {direction} LIMIT $4",
            col = field.column()
        );
        let rows = sqlx::query(&sql)
            .bind(start_ts)
            .bind(end_ts)
            .bind(only_valid)
            .bind(clamp_limit(limit) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(demand_from_row).collect()
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_similarity_config(&self) -> Result<Option<SimilarityConfig>, StoreError> {
        let row = sqlx::query("SELECT * FROM admin_config WHERE config_key = 'global'")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let rule: String = row.try_get("similarity_rule")?;
        Ok(Some(
            SimilarityConfig {
                enabled: row.try_get("similarity_enabled")?,
                rule: SimilarityRule::parse(&rule),
                threshold: row.try_get("similarity_threshold")?,
                updated_by: row.try_get("updated_by")?,
                updated_at: row.try_get("updated_at")?,
            }
            .normalized(),
        ))
    }

    async fn put_similarity_config(&self, config: &SimilarityConfig) -> Result<(), StoreError> {
        let rule = match config.rule {
            SimilarityRule::Text => "text",
            SimilarityRule::Category => "category",
            SimilarityRule::Hybrid => "hybrid",
        };
        sqlx::query(
            r#"
            INSERT INTO admin_config
                (config_key, similarity_enabled, similarity_rule,
                 similarity_threshold, updated_by, updated_at)
            VALUES ('global', $1, $2, $3, $4, $5)
            ON CONFLICT (config_key) DO UPDATE SET
                similarity_enabled = EXCLUDED.similarity_enabled,
                similarity_rule = EXCLUDED.similarity_rule,
                similarity_threshold = EXCLUDED.similarity_threshold,
                updated_by = EXCLUDED.updated_by,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.enabled)
        .bind(rule)
        .bind(config.threshold)
        .bind(&config.updated_by)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demand(id: &str, created_ts: i64) -> CanonicalDemand {
        let now = DateTime::from_timestamp_millis(created_ts).expect("valid ts");
        CanonicalDemand::new(id, format!("text-{id}"), json!({}), 0.0, None, now)
    }

    #[tokio::test]
    async fn list_recent_orders_by_last_updated_descending() {
        let store = MemoryStore::new();
        CanonicalDemandStore::create(store.as_ref(), &demand("a", 1_000)).await.unwrap();
        CanonicalDemandStore::create(store.as_ref(), &demand("b", 3_000)).await.unwrap();
        CanonicalDemandStore::create(store.as_ref(), &demand("c", 2_000)).await.unwrap();

        let pool = store
            .list_recent(RecencyField::LastUpdatedTs, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = pool.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn fetch_candidates_falls_through_to_first_indexed_field() {
        let store = MemoryStore::with_indexed_fields([RecencyField::CreatedTimeTs]);
        CanonicalDemandStore::create(store.as_ref(), &demand("old", 1_000)).await.unwrap();
        CanonicalDemandStore::create(store.as_ref(), &demand("new", 2_000)).await.unwrap();

        assert!(matches!(
            store.list_recent(RecencyField::LastUpdatedTs, 10).await,
            Err(StoreError::UnsupportedOrder(_))
        ));

        let pool = fetch_candidates(store.as_ref(), 10).await;
        let ids: Vec<&str> = pool.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn fetch_candidates_degrades_to_unordered_then_never_errors() {
        let store = MemoryStore::with_indexed_fields([]);
        CanonicalDemandStore::create(store.as_ref(), &demand("only", 1_000)).await.unwrap();
        let pool = fetch_candidates(store.as_ref(), 10).await;
        assert_eq!(pool.len(), 1);

        let empty = MemoryStore::with_indexed_fields([]);
        assert!(fetch_candidates(empty.as_ref(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn canonical_raw_first_writer_wins_and_admin_forces() {
        let store = MemoryStore::new();
        CanonicalDemandStore::create(store.as_ref(), &demand("d", 1_000)).await.unwrap();
        let now = Utc::now();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(store.set_canonical_raw_if_unset("d", first, now).await.unwrap());
        assert!(!store.set_canonical_raw_if_unset("d", second, now).await.unwrap());

        let got = CanonicalDemandStore::get(store.as_ref(), "d").await.unwrap().unwrap();
        assert_eq!(got.canonical_raw_id, Some(first));

        store.force_canonical_raw("d", second, "admin-1", now).await.unwrap();
        let got = CanonicalDemandStore::get(store.as_ref(), "d").await.unwrap().unwrap();
        assert_eq!(got.canonical_raw_id, Some(second));
        assert_eq!(got.canonical_raw_set_by.as_deref(), Some("admin-1"));
    }

    #[tokio::test]
    async fn range_queries_respect_bounds_and_validity() {
        let store = MemoryStore::new();
        CanonicalDemandStore::create(store.as_ref(), &demand("a", 1_000)).await.unwrap();
        let mut filtered = demand("b", 2_000);
        filtered.demand_type = DemandType::Filtered;
        CanonicalDemandStore::create(store.as_ref(), &filtered).await.unwrap();
        CanonicalDemandStore::create(store.as_ref(), &demand("c", 3_000)).await.unwrap();

        let all = store
            .count_range(RecencyField::CreatedTimeTs, 0, 10_000, false)
            .await
            .unwrap();
        assert_eq!(all, 3);
        let valid = store
            .count_range(RecencyField::CreatedTimeTs, 0, 10_000, true)
            .await
            .unwrap();
        assert_eq!(valid, 2);

        let rows = store
            .list_range(RecencyField::CreatedTimeTs, 1_500, 10_000, true, SortOrder::Asc, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn static_admin_list_gates_by_uid() {
        let authz = StaticAdminList::from_env_value("admin-1, admin-2,");
        assert!(authz.is_admin("admin-1").await.unwrap());
        assert!(authz.is_admin("admin-2").await.unwrap());
        assert!(!authz.is_admin("user-9").await.unwrap());
    }
}
