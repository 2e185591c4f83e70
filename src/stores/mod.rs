//! Store contracts
//!
//! The metering store and the gamification store are external collaborators;
//! the core only depends on the traits defined here. Components take these
//! as constructor parameters so backends can be swapped (MongoDB/PostgreSQL
//! in production, in-memory in tests and dev mode).

pub mod memory;
pub mod metering;
pub mod progression;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};

use crate::types::Result;

pub use memory::{InMemoryMeteringStore, InMemoryProgressionStore};
pub use metering::MongoMeteringStore;
pub use progression::{PgConfig, PgProgressionStore};

// =============================================================================
// Value types
// =============================================================================

/// Authoritative weekly consumption for a user
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyUsage {
    /// Tokens consumed in the current window
    pub count: i64,
    /// Per-user weekly allowance
    pub base_limit: i64,
    /// Start of the window the count belongs to
    pub last_reset_date: DateTime<Utc>,
}

/// Per-user token tracking row in the gamification store.
///
/// `weekly_tokens` is a cached mirror of the metering store's weekly count;
/// `unprocessed_tokens` is the balance awaiting conversion and never goes
/// negative.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTracking {
    pub user_id: String,
    pub weekly_tokens: i64,
    pub unprocessed_tokens: i64,
    pub last_synced_at: DateTime<Utc>,
}

/// Derived gamification currency for a user
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressionState {
    /// Monotonically non-decreasing experience total
    pub experience: i64,
    /// Level derived from experience
    pub level: i32,
}

impl Default for ProgressionState {
    fn default() -> Self {
        Self { experience: 0, level: 1 }
    }
}

/// Identity fields carried from the metering store to the gamification store
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityFields {
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub rank: Option<String>,
    pub credential_hash: Option<String>,
}

/// An identity row as stored in the gamification store
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    /// Gamification-store row id (the `postgres_id` reported back to the
    /// metering store)
    pub id: String,
    pub fields: IdentityFields,
    pub active: bool,
}

/// Audit fact recorded when a propagated identity changes rank
#[derive(Debug, Clone, PartialEq)]
pub struct RankUpdate {
    pub old_rank: String,
    pub new_rank: String,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Contracts
// =============================================================================

/// Contract the core requires from the usage-metering store.
///
/// All increments are additive; the core never assumes it is the only writer.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Record a consumption event against the weekly and lifetime counters.
    /// Deduplicated per `event_id`: re-recording the same event returns the
    /// current counters without incrementing.
    async fn record_usage(&self, user_id: &str, amount: i64, event_id: &str) -> Result<WeeklyUsage>;

    /// Authoritative weekly usage for a user. Users without a record report
    /// an empty current window.
    async fn weekly_usage(&self, user_id: &str) -> Result<WeeklyUsage>;

    /// Lifetime tokens consumed by a user
    async fn total_consumed(&self, user_id: &str) -> Result<i64>;
}

/// Write-back of identity propagation state into the metering store
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Mark an identity as propagated, recording the resolved
    /// gamification-store id
    async fn mark_synced(&self, external_id: &str, foreign_id: &str) -> Result<()>;

    /// Mark an identity's last propagation attempt as failed
    async fn mark_failed(&self, external_id: &str) -> Result<()>;
}

/// Contract the core requires from the gamification store
#[async_trait]
pub trait ProgressionStore: Send + Sync {
    /// Token tracking row for a user, if any
    async fn tracking(&self, user_id: &str) -> Result<Option<TokenTracking>>;

    /// Apply a consumption to the tracking row: create it with
    /// `unprocessed_tokens = amount` or increment an existing one. Also bumps
    /// the cached weekly counter and stamps `last_synced_at`.
    async fn add_consumption(&self, user_id: &str, amount: i64) -> Result<TokenTracking>;

    /// Overwrite the cached weekly counter with the authoritative figure
    /// (reconciliation path; the only non-additive write in the core)
    async fn set_weekly_tokens(&self, user_id: &str, weekly_tokens: i64) -> Result<()>;

    /// Apply one conversion batch in a single transaction: increment
    /// experience by `exp_gain`, set `level`, and set the unprocessed balance
    /// to `remainder`. Returns the post-conversion progression.
    async fn apply_conversion(
        &self,
        user_id: &str,
        exp_gain: i64,
        new_level: i32,
        remainder: i64,
    ) -> Result<ProgressionState>;

    /// Progression for a user; users without a row report the default state
    async fn progression(&self, user_id: &str) -> Result<ProgressionState>;

    /// Insert or update an identity keyed by its external id, reactivating
    /// it if it was previously deactivated. `doc_key` is the change feed's
    /// document key, retained so delete events (which carry no document) can
    /// be resolved later. Returns the row id.
    async fn upsert_identity(&self, doc_key: &str, fields: &IdentityFields) -> Result<String>;

    /// Identity row by external id, if any
    async fn identity(&self, external_id: &str) -> Result<Option<IdentityRecord>>;

    /// Soft-deactivate an identity by document key or external id.
    /// Progression history is kept.
    async fn deactivate_identity(&self, doc_key: &str) -> Result<()>;

    /// Append a rank-transition audit fact
    async fn record_rank_update(&self, external_id: &str, update: &RankUpdate) -> Result<()>;

    /// External ids of all active identities (users with a linked metering
    /// identity), for the reconciliation sweep
    async fn linked_users(&self) -> Result<Vec<String>>;
}

// =============================================================================
// Reset window
// =============================================================================

/// Start of the weekly reset window containing `now` (ISO week, Monday
/// 00:00 UTC)
pub fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_into_week = i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() - Duration::days(days_into_week);
    monday.and_time(chrono::NaiveTime::MIN).and_utc()
}
