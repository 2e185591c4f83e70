//! Consumption orchestration
//!
//! The one synchronous entry point other subsystems call. Composes the quota
//! check, the authoritative metering write, the gamification-store dual-write
//! and the conversion attempt into a single logical operation per spend.

use std::sync::Arc;
use tracing::debug;

use crate::conversion::ConversionEngine;
use crate::locks::UserLocks;
use crate::quota::QuotaGuard;
use crate::recorder::{new_event_id, UsageRecorder};
use crate::stores::{MeteringStore, ProgressionStore};
use crate::types::{Result, TurnstileError};

/// Result of a successful consumption
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionReceipt {
    /// Estimated tokens left this week, computed from the pre-consumption
    /// snapshot. Not authoritative for a subsequent call.
    pub weekly_remaining: i64,
}

/// Orchestrates one consumption request end to end
pub struct ConsumptionOrchestrator<M, P> {
    quota: QuotaGuard<P>,
    recorder: UsageRecorder<M>,
    engine: ConversionEngine<P>,
    progression: Arc<P>,
    locks: Arc<UserLocks>,
}

impl<M, P> ConsumptionOrchestrator<M, P>
where
    M: MeteringStore,
    P: ProgressionStore,
{
    pub fn new(
        quota: QuotaGuard<P>,
        recorder: UsageRecorder<M>,
        engine: ConversionEngine<P>,
        progression: Arc<P>,
        locks: Arc<UserLocks>,
    ) -> Self {
        Self { quota, recorder, engine, progression, locks }
    }

    /// Spend `amount` tokens for a user.
    ///
    /// Fails with [`TurnstileError::InsufficientQuota`] when the request does
    /// not fit the remaining weekly quota. A retry after a transient store
    /// error is safe: each call gets its own event id, and drift in the
    /// cached counter is healed by the reconciliation sweep.
    pub async fn consume(&self, user_id: &str, amount: i64) -> Result<ConsumptionReceipt> {
        if amount <= 0 {
            return Err(TurnstileError::InvalidAmount(amount));
        }

        let availability = self.quota.check_availability(user_id, amount).await?;
        if !availability.is_available {
            return Err(TurnstileError::InsufficientQuota {
                requested: amount,
                remaining: availability.weekly_remaining.max(0),
            });
        }

        let event_id = new_event_id();
        self.recorder.record(user_id, amount, &event_id).await?;

        // Tracking increment and conversion form the per-user critical
        // section; without the lock two concurrent spends could both cross
        // the threshold and double-convert the batch.
        {
            let _guard = self.locks.acquire(user_id).await;
            self.progression.add_consumption(user_id, amount).await?;
            self.engine.convert_locked(user_id).await?;
        }

        debug!(user_id = %user_id, amount = amount, "Consumption applied");

        Ok(ConsumptionReceipt {
            weekly_remaining: availability.weekly_remaining - amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::ConversionConfig;
    use crate::stores::{InMemoryMeteringStore, InMemoryProgressionStore};

    fn orchestrator(
        weekly_limit: i64,
        metering: Arc<InMemoryMeteringStore>,
        progression: Arc<InMemoryProgressionStore>,
    ) -> ConsumptionOrchestrator<InMemoryMeteringStore, InMemoryProgressionStore> {
        let locks = Arc::new(UserLocks::new());
        ConsumptionOrchestrator::new(
            QuotaGuard::new(weekly_limit, Arc::clone(&progression)),
            UsageRecorder::new(metering),
            ConversionEngine::new(
                ConversionConfig::default(),
                Arc::clone(&progression),
                Arc::clone(&locks),
            ),
            progression,
            locks,
        )
    }

    #[tokio::test]
    async fn test_consume_dual_writes_both_stores() {
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let orchestrator = orchestrator(100_000, Arc::clone(&metering), Arc::clone(&progression));

        let receipt = orchestrator.consume("u1", 5_000).await.unwrap();
        assert_eq!(receipt.weekly_remaining, 95_000);

        // Authoritative counter
        assert_eq!(metering.weekly_usage("u1").await.unwrap().count, 5_000);
        assert_eq!(metering.total_consumed("u1").await.unwrap(), 5_000);

        // Cached mirror and unprocessed balance
        let tracking = progression.tracking("u1").await.unwrap().unwrap();
        assert_eq!(tracking.weekly_tokens, 5_000);
        assert_eq!(tracking.unprocessed_tokens, 5_000);
    }

    #[tokio::test]
    async fn test_consume_rejects_over_quota() {
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let orchestrator = orchestrator(10_000, Arc::clone(&metering), Arc::clone(&progression));

        orchestrator.consume("u1", 8_000).await.unwrap();
        let err = orchestrator.consume("u1", 5_000).await.unwrap_err();

        match err {
            TurnstileError::InsufficientQuota { requested, remaining } => {
                assert_eq!(requested, 5_000);
                assert_eq!(remaining, 2_000);
            }
            other => panic!("expected quota rejection, got {:?}", other),
        }

        // The rejected spend must not have touched either store
        assert_eq!(metering.weekly_usage("u1").await.unwrap().count, 8_000);
        assert_eq!(progression.tracking("u1").await.unwrap().unwrap().weekly_tokens, 8_000);
    }

    #[tokio::test]
    async fn test_consume_rejects_non_positive_amount() {
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let orchestrator = orchestrator(10_000, metering, progression);

        assert!(matches!(
            orchestrator.consume("u1", -5).await,
            Err(TurnstileError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn test_consume_triggers_conversion_at_threshold() {
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let orchestrator = orchestrator(1_000_000, Arc::clone(&metering), Arc::clone(&progression));

        orchestrator.consume("u1", 299_999).await.unwrap();
        assert_eq!(progression.progression("u1").await.unwrap().experience, 0);

        orchestrator.consume("u1", 1).await.unwrap();

        let tracking = progression.tracking("u1").await.unwrap().unwrap();
        assert_eq!(tracking.unprocessed_tokens, 0);
        assert_eq!(progression.progression("u1").await.unwrap().experience, 30);
        // Weekly mirror keeps the full spend, conversion only drains the
        // unprocessed balance
        assert_eq!(tracking.weekly_tokens, 300_000);
    }

    #[tokio::test]
    async fn test_weekly_remaining_is_pre_snapshot_estimate() {
        let metering = Arc::new(InMemoryMeteringStore::new());
        let progression = Arc::new(InMemoryProgressionStore::new());
        let orchestrator = orchestrator(100_000, metering, progression);

        let first = orchestrator.consume("u1", 10_000).await.unwrap();
        let second = orchestrator.consume("u1", 10_000).await.unwrap();

        assert_eq!(first.weekly_remaining, 90_000);
        assert_eq!(second.weekly_remaining, 80_000);
    }
}
