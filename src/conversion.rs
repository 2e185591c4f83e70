//! Token-to-experience conversion
//!
//! Converts a user's unprocessed-token balance into experience once it
//! crosses the batch threshold, carrying the sub-batch remainder forward.
//! The progression write and the balance reset happen in one store
//! transaction; conversion for a user is serialized through the shared
//! per-user lock registry.

use std::sync::Arc;
use tracing::info;

use crate::locks::UserLocks;
use crate::stores::{ProgressionState, ProgressionStore};
use crate::types::Result;

/// Conversion parameters
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Unprocessed balance required before a batch runs
    pub conversion_threshold: i64,
    /// Tokens per experience point
    pub tokens_per_experience: i64,
    /// Experience points per level
    pub experience_per_level: i64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            conversion_threshold: 300_000,
            tokens_per_experience: 10_000,
            experience_per_level: 500,
        }
    }
}

/// What a conversion attempt did
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    /// The user has no tracking record
    NoTracking,
    /// Balance below the batch threshold; nothing mutated
    BelowThreshold { unprocessed_tokens: i64 },
    /// One batch converted
    Converted {
        exp_gained: i64,
        remainder: i64,
        state: ProgressionState,
    },
}

/// Batched token-to-experience converter
pub struct ConversionEngine<P> {
    config: ConversionConfig,
    progression: Arc<P>,
    locks: Arc<UserLocks>,
}

impl<P: ProgressionStore> ConversionEngine<P> {
    pub fn new(config: ConversionConfig, progression: Arc<P>, locks: Arc<UserLocks>) -> Self {
        Self { config, progression, locks }
    }

    /// Convert the user's unprocessed balance if it has crossed the
    /// threshold. Takes the user's lock; see [`Self::convert_locked`] for
    /// callers already holding it.
    pub async fn convert(&self, user_id: &str) -> Result<ConversionOutcome> {
        let _guard = self.locks.acquire(user_id).await;
        self.convert_locked(user_id).await
    }

    /// Conversion body. The caller must hold the user's lock.
    pub(crate) async fn convert_locked(&self, user_id: &str) -> Result<ConversionOutcome> {
        let Some(tracking) = self.progression.tracking(user_id).await? else {
            return Ok(ConversionOutcome::NoTracking);
        };

        if tracking.unprocessed_tokens < self.config.conversion_threshold {
            return Ok(ConversionOutcome::BelowThreshold {
                unprocessed_tokens: tracking.unprocessed_tokens,
            });
        }

        let exp_gained = tracking.unprocessed_tokens / self.config.tokens_per_experience;
        let remainder = tracking.unprocessed_tokens % self.config.tokens_per_experience;

        let current = self.progression.progression(user_id).await?;
        let new_level = self.level_for(current.experience + exp_gained);

        let state = self
            .progression
            .apply_conversion(user_id, exp_gained, new_level, remainder)
            .await?;

        info!(
            user_id = %user_id,
            exp_gained = exp_gained,
            remainder = remainder,
            level = state.level,
            "Converted token batch"
        );

        Ok(ConversionOutcome::Converted { exp_gained, remainder, state })
    }

    /// Level as a function of cumulative experience
    fn level_for(&self, experience: i64) -> i32 {
        (experience / self.config.experience_per_level) as i32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryProgressionStore;

    fn engine(store: Arc<InMemoryProgressionStore>) -> ConversionEngine<InMemoryProgressionStore> {
        ConversionEngine::new(ConversionConfig::default(), store, Arc::new(UserLocks::new()))
    }

    #[tokio::test]
    async fn test_no_tracking_is_a_noop() {
        let store = Arc::new(InMemoryProgressionStore::new());
        let engine = engine(Arc::clone(&store));

        assert_eq!(engine.convert("u1").await.unwrap(), ConversionOutcome::NoTracking);
    }

    #[tokio::test]
    async fn test_one_below_threshold_holds_the_batch() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 299_999).await.unwrap();
        let engine = engine(Arc::clone(&store));

        let outcome = engine.convert("u1").await.unwrap();
        assert_eq!(outcome, ConversionOutcome::BelowThreshold { unprocessed_tokens: 299_999 });

        let tracking = store.tracking("u1").await.unwrap().unwrap();
        assert_eq!(tracking.unprocessed_tokens, 299_999);
        assert_eq!(store.progression("u1").await.unwrap().experience, 0);
    }

    #[tokio::test]
    async fn test_exact_threshold_converts_one_batch() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 300_000).await.unwrap();
        let engine = engine(Arc::clone(&store));

        let outcome = engine.convert("u1").await.unwrap();
        match outcome {
            ConversionOutcome::Converted { exp_gained, remainder, state } => {
                assert_eq!(exp_gained, 30);
                assert_eq!(remainder, 0);
                assert_eq!(state.experience, 30);
            }
            other => panic!("expected conversion, got {:?}", other),
        }

        assert_eq!(store.tracking("u1").await.unwrap().unwrap().unprocessed_tokens, 0);
    }

    #[tokio::test]
    async fn test_exact_multiple_leaves_zero_remainder() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 350_000).await.unwrap();
        let engine = engine(Arc::clone(&store));

        match engine.convert("u1").await.unwrap() {
            ConversionOutcome::Converted { exp_gained, remainder, .. } => {
                assert_eq!(exp_gained, 35);
                assert_eq!(remainder, 0);
            }
            other => panic!("expected conversion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remainder_carries_forward() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 305_500).await.unwrap();
        let engine = engine(Arc::clone(&store));

        match engine.convert("u1").await.unwrap() {
            ConversionOutcome::Converted { exp_gained, remainder, .. } => {
                assert_eq!(exp_gained, 30);
                assert_eq!(remainder, 5_500);
            }
            other => panic!("expected conversion, got {:?}", other),
        }

        let tracking = store.tracking("u1").await.unwrap().unwrap();
        assert_eq!(tracking.unprocessed_tokens, 5_500);
    }

    #[tokio::test]
    async fn test_convert_is_idempotent_on_unchanged_state() {
        let store = Arc::new(InMemoryProgressionStore::new());
        store.add_consumption("u1", 305_500).await.unwrap();
        let engine = engine(Arc::clone(&store));

        engine.convert("u1").await.unwrap();
        let tracking_after_first = store.tracking("u1").await.unwrap().unwrap();
        let progression_after_first = store.progression("u1").await.unwrap();

        // The remainder is below threshold, so a second run holds it
        let outcome = engine.convert("u1").await.unwrap();
        assert_eq!(outcome, ConversionOutcome::BelowThreshold { unprocessed_tokens: 5_500 });
        assert_eq!(store.tracking("u1").await.unwrap().unwrap().unprocessed_tokens, tracking_after_first.unprocessed_tokens);
        assert_eq!(store.progression("u1").await.unwrap(), progression_after_first);
    }

    #[tokio::test]
    async fn test_level_derived_from_total_experience() {
        let store = Arc::new(InMemoryProgressionStore::new());
        let engine = ConversionEngine::new(
            ConversionConfig {
                conversion_threshold: 10_000,
                tokens_per_experience: 100,
                experience_per_level: 500,
            },
            Arc::clone(&store),
            Arc::new(UserLocks::new()),
        );

        // First batch: 40_000 tokens -> 400 exp, still level 1
        store.add_consumption("u1", 40_000).await.unwrap();
        match engine.convert("u1").await.unwrap() {
            ConversionOutcome::Converted { state, .. } => {
                assert_eq!(state.experience, 400);
                assert_eq!(state.level, 1);
            }
            other => panic!("expected conversion, got {:?}", other),
        }

        // Second, smaller batch: +200 exp crosses 500 total -> level 2.
        // A level computed from the batch alone would fall back to 1 here.
        store.add_consumption("u1", 20_000).await.unwrap();
        match engine.convert("u1").await.unwrap() {
            ConversionOutcome::Converted { state, .. } => {
                assert_eq!(state.experience, 600);
                assert_eq!(state.level, 2);
            }
            other => panic!("expected conversion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unprocessed_balance_never_negative() {
        let store = Arc::new(InMemoryProgressionStore::new());
        let engine = engine(Arc::clone(&store));

        for amount in [150_000, 120_000, 90_000, 45_500] {
            store.add_consumption("u1", amount).await.unwrap();
            engine.convert("u1").await.unwrap();
            let tracking = store.tracking("u1").await.unwrap().unwrap();
            assert!(tracking.unprocessed_tokens >= 0);
        }
    }
}
