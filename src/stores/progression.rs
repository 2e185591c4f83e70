//! PostgreSQL-backed gamification store
//!
//! Implements [`ProgressionStore`] over a `sqlx` connection pool. The schema
//! is created at connect time; all statements use runtime binds. The
//! conversion batch is the one multi-row mutation and runs inside a single
//! transaction so experience, level, and the unprocessed balance move
//! together.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use crate::stores::{
    IdentityFields, IdentityRecord, ProgressionState, ProgressionStore, RankUpdate, TokenTracking,
};
use crate::types::{Result, TurnstileError};

/// PostgreSQL connection configuration
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection URL
    pub url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// How long to wait for a connection before failing
    pub acquire_timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/turnstile".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS token_tracking (
        user_id TEXT PRIMARY KEY,
        weekly_tokens BIGINT NOT NULL DEFAULT 0,
        unprocessed_tokens BIGINT NOT NULL DEFAULT 0 CHECK (unprocessed_tokens >= 0),
        last_synced_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS progression (
        user_id TEXT PRIMARY KEY,
        experience BIGINT NOT NULL DEFAULT 0 CHECK (experience >= 0),
        level INT NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS identities (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        external_id TEXT NOT NULL UNIQUE,
        doc_key TEXT NOT NULL,
        email TEXT NOT NULL,
        name TEXT NOT NULL,
        rank TEXT,
        credential_hash TEXT,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_identities_doc_key ON identities(doc_key)",
    "CREATE TABLE IF NOT EXISTS rank_updates (
        id BIGSERIAL PRIMARY KEY,
        external_id TEXT NOT NULL,
        old_rank TEXT NOT NULL,
        new_rank TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rank_updates_external_id ON rank_updates(external_id)",
];

/// Gamification store backed by PostgreSQL
#[derive(Clone)]
pub struct PgProgressionStore {
    pool: PgPool,
}

impl PgProgressionStore {
    /// Connect and make sure the schema exists
    pub async fn connect(config: &PgConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| TurnstileError::Progression(format!("Failed to connect to PostgreSQL: {}", e)))?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!("Connected to PostgreSQL, schema ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| TurnstileError::Progression(format!("Schema setup failed: {}", e)))?;
        }
        Ok(())
    }

    /// Access the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct TrackingRow {
    user_id: String,
    weekly_tokens: i64,
    unprocessed_tokens: i64,
    last_synced_at: DateTime<Utc>,
}

impl From<TrackingRow> for TokenTracking {
    fn from(row: TrackingRow) -> Self {
        Self {
            user_id: row.user_id,
            weekly_tokens: row.weekly_tokens,
            unprocessed_tokens: row.unprocessed_tokens,
            last_synced_at: row.last_synced_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: uuid::Uuid,
    external_id: String,
    email: String,
    name: String,
    rank: Option<String>,
    credential_hash: Option<String>,
    active: bool,
}

impl From<IdentityRow> for IdentityRecord {
    fn from(row: IdentityRow) -> Self {
        Self {
            id: row.id.to_string(),
            fields: IdentityFields {
                external_id: row.external_id,
                email: row.email,
                name: row.name,
                rank: row.rank,
                credential_hash: row.credential_hash,
            },
            active: row.active,
        }
    }
}

fn pg_err(e: sqlx::Error) -> TurnstileError {
    TurnstileError::Progression(e.to_string())
}

#[async_trait::async_trait]
impl ProgressionStore for PgProgressionStore {
    async fn tracking(&self, user_id: &str) -> Result<Option<TokenTracking>> {
        let row = sqlx::query_as::<_, TrackingRow>(
            "SELECT user_id, weekly_tokens, unprocessed_tokens, last_synced_at
             FROM token_tracking WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(TokenTracking::from))
    }

    async fn add_consumption(&self, user_id: &str, amount: i64) -> Result<TokenTracking> {
        let row = sqlx::query_as::<_, TrackingRow>(
            "INSERT INTO token_tracking (user_id, weekly_tokens, unprocessed_tokens, last_synced_at)
             VALUES ($1, $2, $2, now())
             ON CONFLICT (user_id) DO UPDATE SET
                 weekly_tokens = token_tracking.weekly_tokens + EXCLUDED.weekly_tokens,
                 unprocessed_tokens = token_tracking.unprocessed_tokens + EXCLUDED.unprocessed_tokens,
                 last_synced_at = now()
             RETURNING user_id, weekly_tokens, unprocessed_tokens, last_synced_at",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.into())
    }

    async fn set_weekly_tokens(&self, user_id: &str, weekly_tokens: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_tracking (user_id, weekly_tokens, unprocessed_tokens, last_synced_at)
             VALUES ($1, $2, 0, now())
             ON CONFLICT (user_id) DO UPDATE SET
                 weekly_tokens = EXCLUDED.weekly_tokens,
                 last_synced_at = now()",
        )
        .bind(user_id)
        .bind(weekly_tokens)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    async fn apply_conversion(
        &self,
        user_id: &str,
        exp_gain: i64,
        new_level: i32,
        remainder: i64,
    ) -> Result<ProgressionState> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        sqlx::query(
            "UPDATE token_tracking SET unprocessed_tokens = $2, last_synced_at = now()
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(remainder)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        let row = sqlx::query(
            "INSERT INTO progression (user_id, experience, level)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE SET
                 experience = progression.experience + EXCLUDED.experience,
                 level = $3
             RETURNING experience, level",
        )
        .bind(user_id)
        .bind(exp_gain)
        .bind(new_level)
        .fetch_one(&mut *tx)
        .await
        .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;

        Ok(ProgressionState {
            experience: row.try_get("experience").map_err(pg_err)?,
            level: row.try_get("level").map_err(pg_err)?,
        })
    }

    async fn progression(&self, user_id: &str) -> Result<ProgressionState> {
        let row = sqlx::query("SELECT experience, level FROM progression WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        match row {
            Some(row) => Ok(ProgressionState {
                experience: row.try_get("experience").map_err(pg_err)?,
                level: row.try_get("level").map_err(pg_err)?,
            }),
            None => Ok(ProgressionState::default()),
        }
    }

    async fn upsert_identity(&self, doc_key: &str, fields: &IdentityFields) -> Result<String> {
        let row = sqlx::query(
            "INSERT INTO identities (external_id, doc_key, email, name, rank, credential_hash, active, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, now())
             ON CONFLICT (external_id) DO UPDATE SET
                 doc_key = EXCLUDED.doc_key,
                 email = EXCLUDED.email,
                 name = EXCLUDED.name,
                 rank = EXCLUDED.rank,
                 credential_hash = EXCLUDED.credential_hash,
                 active = TRUE,
                 updated_at = now()
             RETURNING id",
        )
        .bind(&fields.external_id)
        .bind(doc_key)
        .bind(&fields.email)
        .bind(&fields.name)
        .bind(&fields.rank)
        .bind(&fields.credential_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        let id: uuid::Uuid = row.try_get("id").map_err(pg_err)?;
        Ok(id.to_string())
    }

    async fn identity(&self, external_id: &str) -> Result<Option<IdentityRecord>> {
        let row = sqlx::query_as::<_, IdentityRow>(
            "SELECT id, external_id, doc_key, email, name, rank, credential_hash, active
             FROM identities WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(IdentityRecord::from))
    }

    async fn deactivate_identity(&self, doc_key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE identities SET active = FALSE, updated_at = now()
             WHERE doc_key = $1 OR external_id = $1",
        )
        .bind(doc_key)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    async fn record_rank_update(&self, external_id: &str, update: &RankUpdate) -> Result<()> {
        sqlx::query(
            "INSERT INTO rank_updates (external_id, old_rank, new_rank, updated_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(external_id)
        .bind(&update.old_rank)
        .bind(&update.new_rank)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    async fn linked_users(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT external_id FROM identities WHERE active = TRUE ORDER BY external_id")
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(pg_err))
            .collect()
    }
}
