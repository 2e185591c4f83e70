//! In-memory store implementations
//!
//! Back the store contracts with maps for tests and dev mode. Both stores
//! support simple failure injection so isolation paths (sweep skip-and-log,
//! feed retry) can be exercised without a real backend.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::schemas::{SyncStatus, DEFAULT_BASE_LIMIT};
use crate::stores::{
    week_start, IdentityDirectory, IdentityFields, IdentityRecord, MeteringStore, ProgressionState,
    ProgressionStore, RankUpdate, TokenTracking, WeeklyUsage,
};
use crate::types::{Result, TurnstileError};

// =============================================================================
// Metering store
// =============================================================================

struct UsageEntry {
    weekly: WeeklyUsage,
    total: i64,
    event_ids: HashSet<String>,
}

impl UsageEntry {
    fn new() -> Self {
        Self {
            weekly: WeeklyUsage {
                count: 0,
                base_limit: DEFAULT_BASE_LIMIT,
                last_reset_date: week_start(Utc::now()),
            },
            total: 0,
            event_ids: HashSet::new(),
        }
    }

    fn roll_over_if_stale(&mut self) {
        let window_start = week_start(Utc::now());
        if self.weekly.last_reset_date < window_start {
            self.weekly.count = 0;
            self.weekly.last_reset_date = window_start;
        }
    }
}

struct IdentityEntry {
    status: SyncStatus,
    foreign_id: Option<String>,
}

/// In-memory metering store
#[derive(Default)]
pub struct InMemoryMeteringStore {
    usage: RwLock<HashMap<String, UsageEntry>>,
    identities: RwLock<HashMap<String, IdentityEntry>>,
    fail_users: RwLock<HashSet<String>>,
    stall_users: RwLock<HashSet<String>>,
}

impl InMemoryMeteringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a usage record directly (test setup)
    pub async fn seed_usage(&self, user_id: &str, weekly_count: i64, last_reset: chrono::DateTime<Utc>) {
        let mut usage = self.usage.write().await;
        let entry = usage.entry(user_id.to_string()).or_insert_with(UsageEntry::new);
        entry.weekly.count = weekly_count;
        entry.weekly.last_reset_date = last_reset;
        entry.total = entry.total.max(weekly_count);
    }

    /// Make `weekly_usage` fail for a user (sweep isolation tests)
    pub async fn fail_weekly_usage_for(&self, user_id: &str) {
        self.fail_users.write().await.insert(user_id.to_string());
    }

    /// Make `weekly_usage` hang for a user (sweep timeout tests)
    pub async fn stall_weekly_usage_for(&self, user_id: &str) {
        self.stall_users.write().await.insert(user_id.to_string());
    }

    /// Recorded propagation state for an identity, if any
    pub async fn sync_status(&self, external_id: &str) -> Option<(SyncStatus, Option<String>)> {
        self.identities
            .read()
            .await
            .get(external_id)
            .map(|e| (e.status, e.foreign_id.clone()))
    }
}

#[async_trait::async_trait]
impl MeteringStore for InMemoryMeteringStore {
    async fn record_usage(&self, user_id: &str, amount: i64, event_id: &str) -> Result<WeeklyUsage> {
        if amount <= 0 {
            return Err(TurnstileError::InvalidAmount(amount));
        }

        let mut usage = self.usage.write().await;
        let entry = usage.entry(user_id.to_string()).or_insert_with(UsageEntry::new);
        entry.roll_over_if_stale();

        if entry.event_ids.insert(event_id.to_string()) {
            entry.weekly.count += amount;
            entry.total += amount;
        }

        Ok(entry.weekly.clone())
    }

    async fn weekly_usage(&self, user_id: &str) -> Result<WeeklyUsage> {
        if self.stall_users.read().await.contains(user_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_users.read().await.contains(user_id) {
            return Err(TurnstileError::Database(format!("injected failure for {}", user_id)));
        }

        let mut usage = self.usage.write().await;
        match usage.get_mut(user_id) {
            Some(entry) => {
                entry.roll_over_if_stale();
                Ok(entry.weekly.clone())
            }
            None => Ok(UsageEntry::new().weekly),
        }
    }

    async fn total_consumed(&self, user_id: &str) -> Result<i64> {
        Ok(self.usage.read().await.get(user_id).map(|e| e.total).unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl IdentityDirectory for InMemoryMeteringStore {
    async fn mark_synced(&self, external_id: &str, foreign_id: &str) -> Result<()> {
        self.identities.write().await.insert(
            external_id.to_string(),
            IdentityEntry {
                status: SyncStatus::Synced,
                foreign_id: Some(foreign_id.to_string()),
            },
        );
        Ok(())
    }

    async fn mark_failed(&self, external_id: &str) -> Result<()> {
        let mut identities = self.identities.write().await;
        let entry = identities.entry(external_id.to_string()).or_insert(IdentityEntry {
            status: SyncStatus::Failed,
            foreign_id: None,
        });
        entry.status = SyncStatus::Failed;
        Ok(())
    }
}

// =============================================================================
// Progression store
// =============================================================================

struct StoredIdentity {
    id: String,
    doc_key: String,
    fields: IdentityFields,
    active: bool,
}

/// In-memory gamification store
#[derive(Default)]
pub struct InMemoryProgressionStore {
    tracking: RwLock<HashMap<String, TokenTracking>>,
    progression: RwLock<HashMap<String, ProgressionState>>,
    identities: RwLock<HashMap<String, StoredIdentity>>,
    rank_updates: RwLock<Vec<(String, RankUpdate)>>,
    fail_upserts: AtomicU32,
}

impl InMemoryProgressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` identity upserts fail (feed retry tests)
    pub fn fail_next_identity_upserts(&self, n: u32) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Recorded rank transitions for a user (test inspection)
    pub async fn rank_updates_for(&self, external_id: &str) -> Vec<RankUpdate> {
        self.rank_updates
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == external_id)
            .map(|(_, update)| update.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ProgressionStore for InMemoryProgressionStore {
    async fn tracking(&self, user_id: &str) -> Result<Option<TokenTracking>> {
        Ok(self.tracking.read().await.get(user_id).cloned())
    }

    async fn add_consumption(&self, user_id: &str, amount: i64) -> Result<TokenTracking> {
        let mut tracking = self.tracking.write().await;
        let entry = tracking.entry(user_id.to_string()).or_insert_with(|| TokenTracking {
            user_id: user_id.to_string(),
            weekly_tokens: 0,
            unprocessed_tokens: 0,
            last_synced_at: Utc::now(),
        });
        entry.weekly_tokens += amount;
        entry.unprocessed_tokens += amount;
        entry.last_synced_at = Utc::now();
        Ok(entry.clone())
    }

    async fn set_weekly_tokens(&self, user_id: &str, weekly_tokens: i64) -> Result<()> {
        let mut tracking = self.tracking.write().await;
        let entry = tracking.entry(user_id.to_string()).or_insert_with(|| TokenTracking {
            user_id: user_id.to_string(),
            weekly_tokens: 0,
            unprocessed_tokens: 0,
            last_synced_at: Utc::now(),
        });
        entry.weekly_tokens = weekly_tokens;
        entry.last_synced_at = Utc::now();
        Ok(())
    }

    async fn apply_conversion(
        &self,
        user_id: &str,
        exp_gain: i64,
        new_level: i32,
        remainder: i64,
    ) -> Result<ProgressionState> {
        if remainder < 0 {
            return Err(TurnstileError::Internal(format!(
                "negative remainder {} for {}",
                remainder, user_id
            )));
        }

        // Both maps are updated under their locks before returning, which is
        // as close to the SQL transaction as an in-memory double map gets.
        {
            let mut tracking = self.tracking.write().await;
            if let Some(entry) = tracking.get_mut(user_id) {
                entry.unprocessed_tokens = remainder;
                entry.last_synced_at = Utc::now();
            }
        }

        let mut progression = self.progression.write().await;
        let state = progression.entry(user_id.to_string()).or_default();
        state.experience += exp_gain;
        state.level = new_level;
        Ok(state.clone())
    }

    async fn progression(&self, user_id: &str) -> Result<ProgressionState> {
        Ok(self.progression.read().await.get(user_id).cloned().unwrap_or_default())
    }

    async fn upsert_identity(&self, doc_key: &str, fields: &IdentityFields) -> Result<String> {
        let remaining = self.fail_upserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_upserts.store(remaining - 1, Ordering::SeqCst);
            return Err(TurnstileError::Progression("injected upsert failure".to_string()));
        }

        let mut identities = self.identities.write().await;
        let entry = identities
            .entry(fields.external_id.clone())
            .or_insert_with(|| StoredIdentity {
                id: Uuid::new_v4().to_string(),
                doc_key: doc_key.to_string(),
                fields: fields.clone(),
                active: true,
            });
        entry.doc_key = doc_key.to_string();
        entry.fields = fields.clone();
        entry.active = true;
        Ok(entry.id.clone())
    }

    async fn identity(&self, external_id: &str) -> Result<Option<IdentityRecord>> {
        Ok(self.identities.read().await.get(external_id).map(|stored| IdentityRecord {
            id: stored.id.clone(),
            fields: stored.fields.clone(),
            active: stored.active,
        }))
    }

    async fn deactivate_identity(&self, doc_key: &str) -> Result<()> {
        let mut identities = self.identities.write().await;
        for stored in identities.values_mut() {
            if stored.doc_key == doc_key || stored.fields.external_id == doc_key {
                stored.active = false;
            }
        }
        Ok(())
    }

    async fn record_rank_update(&self, external_id: &str, update: &RankUpdate) -> Result<()> {
        self.rank_updates
            .write()
            .await
            .push((external_id.to_string(), update.clone()));
        Ok(())
    }

    async fn linked_users(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self
            .identities
            .read()
            .await
            .values()
            .filter(|stored| stored.active)
            .map(|stored| stored.fields.external_id.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn fields(external_id: &str, rank: Option<&str>) -> IdentityFields {
        IdentityFields {
            external_id: external_id.to_string(),
            email: format!("{}@example.org", external_id),
            name: external_id.to_string(),
            rank: rank.map(String::from),
            credential_hash: None,
        }
    }

    #[tokio::test]
    async fn test_record_usage_increments_both_counters() {
        let store = InMemoryMeteringStore::new();

        let weekly = store.record_usage("u1", 500, "evt-1").await.unwrap();
        assert_eq!(weekly.count, 500);
        assert_eq!(store.total_consumed("u1").await.unwrap(), 500);

        let weekly = store.record_usage("u1", 250, "evt-2").await.unwrap();
        assert_eq!(weekly.count, 750);
        assert_eq!(store.total_consumed("u1").await.unwrap(), 750);
    }

    #[tokio::test]
    async fn test_record_usage_deduplicates_event_ids() {
        let store = InMemoryMeteringStore::new();

        store.record_usage("u1", 500, "evt-1").await.unwrap();
        let weekly = store.record_usage("u1", 500, "evt-1").await.unwrap();

        assert_eq!(weekly.count, 500);
        assert_eq!(store.total_consumed("u1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_record_usage_rejects_non_positive_amount() {
        let store = InMemoryMeteringStore::new();
        assert!(matches!(
            store.record_usage("u1", 0, "evt-1").await,
            Err(TurnstileError::InvalidAmount(0))
        ));
    }

    #[tokio::test]
    async fn test_stale_window_rolls_over() {
        let store = InMemoryMeteringStore::new();
        let two_weeks_ago = week_start(Utc::now()) - ChronoDuration::weeks(2);
        store.seed_usage("u1", 40_000, two_weeks_ago).await;

        let weekly = store.weekly_usage("u1").await.unwrap();
        assert_eq!(weekly.count, 0);
        assert_eq!(weekly.last_reset_date, week_start(Utc::now()));

        // A write after rollover starts the new window from the amount
        let weekly = store.record_usage("u1", 100, "evt-1").await.unwrap();
        assert_eq!(weekly.count, 100);
    }

    #[tokio::test]
    async fn test_identity_upsert_and_deactivate() {
        let store = InMemoryProgressionStore::new();

        let id = store.upsert_identity("key-1", &fields("u1", Some("bronze"))).await.unwrap();
        let record = store.identity("u1").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert!(record.active);

        store.deactivate_identity("key-1").await.unwrap();
        let record = store.identity("u1").await.unwrap().unwrap();
        assert!(!record.active);
        assert!(store.linked_users().await.unwrap().is_empty());

        // An update re-activates the identity
        store.upsert_identity("key-1", &fields("u1", Some("silver"))).await.unwrap();
        assert_eq!(store.linked_users().await.unwrap(), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_identity_keeps_stable_id() {
        let store = InMemoryProgressionStore::new();

        let first = store.upsert_identity("key-1", &fields("u1", None)).await.unwrap();
        let second = store.upsert_identity("key-1", &fields("u1", Some("gold"))).await.unwrap();
        assert_eq!(first, second);
    }
}
