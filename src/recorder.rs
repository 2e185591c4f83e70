//! Usage recording
//!
//! Writes consumption events to the metering store's authoritative counters.
//! Every logical consumption gets a generated event id; the store drops
//! re-deliveries of an id it has already counted, so a retry after an
//! unconfirmed write cannot double count.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::stores::{MeteringStore, WeeklyUsage};
use crate::types::Result;

/// Generate an idempotency id for one consumption event
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Records consumption against the metering store
pub struct UsageRecorder<M> {
    metering: Arc<M>,
}

impl<M: MeteringStore> UsageRecorder<M> {
    pub fn new(metering: Arc<M>) -> Self {
        Self { metering }
    }

    /// Record `amount` tokens for a user under `event_id`
    pub async fn record(&self, user_id: &str, amount: i64, event_id: &str) -> Result<WeeklyUsage> {
        let weekly = self.metering.record_usage(user_id, amount, event_id).await?;
        debug!(
            user_id = %user_id,
            amount = amount,
            weekly_count = weekly.count,
            "Recorded consumption"
        );
        Ok(weekly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryMeteringStore;

    #[tokio::test]
    async fn test_record_accumulates() {
        let store = Arc::new(InMemoryMeteringStore::new());
        let recorder = UsageRecorder::new(Arc::clone(&store));

        recorder.record("u1", 1_000, &new_event_id()).await.unwrap();
        let weekly = recorder.record("u1", 2_000, &new_event_id()).await.unwrap();

        assert_eq!(weekly.count, 3_000);
        assert_eq!(store.total_consumed("u1").await.unwrap(), 3_000);
    }

    #[tokio::test]
    async fn test_retried_event_counts_once() {
        let store = Arc::new(InMemoryMeteringStore::new());
        let recorder = UsageRecorder::new(Arc::clone(&store));

        let event_id = new_event_id();
        recorder.record("u1", 1_000, &event_id).await.unwrap();
        recorder.record("u1", 1_000, &event_id).await.unwrap();

        assert_eq!(store.total_consumed("u1").await.unwrap(), 1_000);
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }
}
