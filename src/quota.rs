//! Weekly quota checks
//!
//! Answers "can this user spend N tokens this week?" against the
//! gamification store's cached weekly counter. Pure read; the cache is kept
//! fresh by the consumption dual-write and healed by the reconciliation
//! sweep.

use std::sync::Arc;

use crate::stores::ProgressionStore;
use crate::types::Result;

/// Result of an availability check
#[derive(Debug, Clone, PartialEq)]
pub struct Availability {
    /// Whether the requested amount fits in the remaining quota
    pub is_available: bool,
    /// Tokens left in the current window before this request
    pub weekly_remaining: i64,
}

/// Quota guard over the cached weekly counter
pub struct QuotaGuard<P> {
    weekly_limit: i64,
    progression: Arc<P>,
}

impl<P: ProgressionStore> QuotaGuard<P> {
    pub fn new(weekly_limit: i64, progression: Arc<P>) -> Self {
        Self { weekly_limit, progression }
    }

    /// Check whether `requested` tokens fit in the user's remaining weekly
    /// quota. Users without a tracking record have spent nothing.
    pub async fn check_availability(&self, user_id: &str, requested: i64) -> Result<Availability> {
        let used = self
            .progression
            .tracking(user_id)
            .await?
            .map(|t| t.weekly_tokens)
            .unwrap_or(0);

        let weekly_remaining = self.weekly_limit - used;

        Ok(Availability {
            is_available: weekly_remaining >= requested,
            weekly_remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryProgressionStore;

    #[tokio::test]
    async fn test_unknown_user_has_full_quota() {
        let store = Arc::new(InMemoryProgressionStore::new());
        let guard = QuotaGuard::new(100_000, store);

        let availability = guard.check_availability("u1", 10_000).await.unwrap();
        assert!(availability.is_available);
        assert_eq!(availability.weekly_remaining, 100_000);
    }

    #[tokio::test]
    async fn test_spent_tokens_reduce_remaining() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 60_000).await.unwrap();

        let guard = QuotaGuard::new(100_000, store);
        let availability = guard.check_availability("u1", 50_000).await.unwrap();

        assert!(!availability.is_available);
        assert_eq!(availability.weekly_remaining, 40_000);
    }

    #[tokio::test]
    async fn test_exact_remaining_is_available() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 60_000).await.unwrap();

        let guard = QuotaGuard::new(100_000, store);
        let availability = guard.check_availability("u1", 40_000).await.unwrap();

        assert!(availability.is_available);
    }
}
