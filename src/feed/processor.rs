//! Identity change processor
//!
//! Applies the identity change feed to the gamification store. Delivery is
//! at-least-once, so every handler is upsert-shaped and safe to apply twice.
//! A failed event is marked `FAILED` on the source record and queued for a
//! bounded number of retries without holding up later events; the stream
//! position is committed once the event is applied or its failure has been
//! recorded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::feed::{ChangeFeed, ChangeOperation, IdentityChangeEvent};
use crate::stores::{IdentityDirectory, ProgressionStore, RankUpdate};
use crate::types::{Result, TurnstileError};

/// Retry bounds for failed identity changes
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum application attempts per event (first try included)
    pub max_attempts: u32,
    /// Delay before a failed event is retried
    pub retry_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Counters accumulated over a processor run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessorStats {
    /// Events received from the feed
    pub processed: u64,
    /// Identities upserted and marked synced
    pub synced: u64,
    /// Identities soft-deactivated
    pub deactivated: u64,
    /// First-time application failures
    pub failed: u64,
    /// Events that eventually applied on a retry
    pub recovered: u64,
    /// Events dropped after exhausting their attempts
    pub abandoned: u64,
    /// Rank transitions recorded
    pub rank_updates: u64,
}

struct RetryEntry {
    event: IdentityChangeEvent,
    attempts: u32,
    due_at: Instant,
}

/// Consumes the identity change feed and propagates mutations
pub struct IdentityChangeProcessor<F, P, D> {
    feed: F,
    worker: Worker<P, D>,
}

impl<F, P, D> IdentityChangeProcessor<F, P, D>
where
    F: ChangeFeed,
    P: ProgressionStore,
    D: IdentityDirectory,
{
    pub fn new(config: ProcessorConfig, feed: F, progression: Arc<P>, directory: Arc<D>) -> Self {
        Self {
            feed,
            worker: Worker {
                config,
                progression,
                directory,
                retries: VecDeque::new(),
                stats: ProcessorStats::default(),
            },
        }
    }

    /// Run until the feed ends, then give queued retries their remaining
    /// attempts. Returns the accumulated counters.
    pub async fn run(self) -> Result<ProcessorStats> {
        let Self { mut feed, mut worker } = self;

        loop {
            let next_due = worker.next_retry_due();

            tokio::select! {
                entry = feed.next_entry() => {
                    match entry? {
                        Some(entry) => {
                            worker.handle_event(&entry.event).await;
                            feed.commit(&entry.token).await?;
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    worker.drain_due_retries().await;
                }
            }
        }

        while !worker.retries.is_empty() {
            if let Some(due) = worker.next_retry_due() {
                tokio::time::sleep_until(due).await;
            }
            worker.drain_due_retries().await;
        }

        Ok(worker.stats)
    }
}

struct Worker<P, D> {
    config: ProcessorConfig,
    progression: Arc<P>,
    directory: Arc<D>,
    retries: VecDeque<RetryEntry>,
    stats: ProcessorStats,
}

impl<P, D> Worker<P, D>
where
    P: ProgressionStore,
    D: IdentityDirectory,
{
    async fn handle_event(&mut self, event: &IdentityChangeEvent) {
        self.stats.processed += 1;

        if let Err(e) = self.apply(event).await {
            warn!(
                document_key = %event.document_key,
                error = %e,
                "Identity change failed, scheduling retry"
            );
            self.record_failure(event).await;
        }
    }

    /// Apply one event. Upsert-shaped throughout: re-applying a delivered
    /// event reproduces the same store state.
    async fn apply(&mut self, event: &IdentityChangeEvent) -> Result<()> {
        match event.operation {
            ChangeOperation::Insert | ChangeOperation::Update => {
                let Some(fields) = &event.full_document else {
                    return Err(TurnstileError::Feed(format!(
                        "{:?} event without document for {}",
                        event.operation, event.document_key
                    )));
                };

                let previous = self.progression.identity(&fields.external_id).await?;
                let foreign_id = self.progression.upsert_identity(&event.document_key, fields).await?;

                if let Some(previous) = previous {
                    if let (Some(old_rank), Some(new_rank)) = (&previous.fields.rank, &fields.rank) {
                        if old_rank != new_rank {
                            let update = RankUpdate {
                                old_rank: old_rank.clone(),
                                new_rank: new_rank.clone(),
                                updated_at: chrono::Utc::now(),
                            };
                            if let Err(e) = self
                                .progression
                                .record_rank_update(&fields.external_id, &update)
                                .await
                            {
                                // Audit-only; the identity itself propagated
                                warn!(external_id = %fields.external_id, error = %e, "Failed to record rank update");
                            } else {
                                self.stats.rank_updates += 1;
                            }
                        }
                    }
                }

                if let Err(e) = self.directory.mark_synced(&fields.external_id, &foreign_id).await {
                    warn!(external_id = %fields.external_id, error = %e, "Failed to record sync status");
                }

                self.stats.synced += 1;
                debug!(external_id = %fields.external_id, "Identity propagated");
            }
            ChangeOperation::Delete => {
                self.progression.deactivate_identity(&event.document_key).await?;
                self.stats.deactivated += 1;
                debug!(document_key = %event.document_key, "Identity deactivated");
            }
        }

        Ok(())
    }

    async fn record_failure(&mut self, event: &IdentityChangeEvent) {
        if let Some(external_id) = event.external_id() {
            if let Err(e) = self.directory.mark_failed(external_id).await {
                warn!(external_id = %external_id, error = %e, "Failed to record failed sync status");
            }
        }

        self.stats.failed += 1;
        self.retries.push_back(RetryEntry {
            event: event.clone(),
            attempts: 1,
            due_at: Instant::now() + self.config.retry_delay,
        });
    }

    fn next_retry_due(&self) -> Option<Instant> {
        self.retries.iter().map(|r| r.due_at).min()
    }

    async fn drain_due_retries(&mut self) {
        let now = Instant::now();

        for _ in 0..self.retries.len() {
            let Some(entry) = self.retries.pop_front() else {
                break;
            };
            if entry.due_at > now {
                self.retries.push_back(entry);
                continue;
            }

            match self.apply(&entry.event).await {
                Ok(()) => {
                    info!(
                        document_key = %entry.event.document_key,
                        attempts = entry.attempts + 1,
                        "Identity change applied on retry"
                    );
                    self.stats.recovered += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    if attempts >= self.config.max_attempts {
                        error!(
                            document_key = %entry.event.document_key,
                            attempts = attempts,
                            error = %e,
                            "Identity change abandoned after exhausting attempts"
                        );
                        self.stats.abandoned += 1;
                    } else {
                        self.retries.push_back(RetryEntry {
                            event: entry.event,
                            attempts,
                            due_at: now + self.config.retry_delay,
                        });
                    }
                }
            }
        }
    }
}

/// Spawn the processor as a background task
pub fn spawn_processor_task<F, P, D>(
    processor: IdentityChangeProcessor<F, P, D>,
) -> JoinHandle<()>
where
    F: ChangeFeed + Send + 'static,
    P: ProgressionStore + 'static,
    D: IdentityDirectory + 'static,
{
    tokio::spawn(async move {
        match processor.run().await {
            Ok(stats) => info!(
                processed = stats.processed,
                synced = stats.synced,
                failed = stats.failed,
                "Identity change feed ended"
            ),
            Err(e) => error!(error = %e, "Identity change processor stopped"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::SyncStatus;
    use crate::feed::InMemoryFeed;
    use crate::stores::{IdentityFields, InMemoryMeteringStore, InMemoryProgressionStore};
    use std::sync::atomic::Ordering;

    fn fields(external_id: &str, email: &str, rank: Option<&str>) -> IdentityFields {
        IdentityFields {
            external_id: external_id.to_string(),
            email: email.to_string(),
            name: external_id.to_string(),
            rank: rank.map(String::from),
            credential_hash: None,
        }
    }

    fn processor(
        config: ProcessorConfig,
        feed: InMemoryFeed,
        progression: Arc<InMemoryProgressionStore>,
        directory: Arc<InMemoryMeteringStore>,
    ) -> IdentityChangeProcessor<InMemoryFeed, InMemoryProgressionStore, InMemoryMeteringStore>
    {
        IdentityChangeProcessor::new(config, feed, progression, directory)
    }

    fn immediate_retries() -> ProcessorConfig {
        ProcessorConfig {
            max_attempts: 5,
            retry_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_insert_then_update_reflects_update_fields() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        // At-least-once delivery: every event arrives twice
        let insert = IdentityChangeEvent::insert(fields("u1", "old@example.org", Some("bronze")));
        let update = IdentityChangeEvent::update(fields("u1", "new@example.org", Some("bronze")));
        let feed = InMemoryFeed::new(vec![insert.clone(), insert, update.clone(), update]);

        let stats = processor(ProcessorConfig::default(), feed, Arc::clone(&progression), Arc::clone(&directory))
            .run()
            .await
            .unwrap();

        assert_eq!(stats.processed, 4);
        assert_eq!(stats.synced, 4);
        assert_eq!(stats.failed, 0);

        let record = progression.identity("u1").await.unwrap().unwrap();
        assert_eq!(record.fields.email, "new@example.org");
        assert!(record.active);

        let (status, foreign_id) = directory.sync_status("u1").await.unwrap();
        assert_eq!(status, SyncStatus::Synced);
        assert_eq!(foreign_id.as_deref(), Some(record.id.as_str()));
    }

    #[tokio::test]
    async fn test_rank_transition_recorded_once_despite_redelivery() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        let insert = IdentityChangeEvent::insert(fields("u1", "u1@example.org", Some("bronze")));
        let promote = IdentityChangeEvent::update(fields("u1", "u1@example.org", Some("silver")));
        let feed = InMemoryFeed::new(vec![insert, promote.clone(), promote]);

        let stats = processor(ProcessorConfig::default(), feed, Arc::clone(&progression), directory)
            .run()
            .await
            .unwrap();

        let updates = progression.rank_updates_for("u1").await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].old_rank, "bronze");
        assert_eq!(updates[0].new_rank, "silver");
        assert_eq!(stats.rank_updates, 1);
    }

    #[tokio::test]
    async fn test_delete_soft_deactivates() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        let feed = InMemoryFeed::new(vec![
            IdentityChangeEvent::insert(fields("u1", "u1@example.org", None)),
            IdentityChangeEvent::delete("u1"),
        ]);

        let stats = processor(ProcessorConfig::default(), feed, Arc::clone(&progression), directory)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.deactivated, 1);
        let record = progression.identity("u1").await.unwrap().unwrap();
        assert!(!record.active);
        assert!(progression.linked_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        // First upsert fails; the next event and the retry succeed
        progression.fail_next_identity_upserts(1);
        let feed = InMemoryFeed::new(vec![
            IdentityChangeEvent::insert(fields("u1", "u1@example.org", None)),
            IdentityChangeEvent::insert(fields("u2", "u2@example.org", None)),
        ]);

        let stats = processor(immediate_retries(), feed, Arc::clone(&progression), Arc::clone(&directory))
            .run()
            .await
            .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.abandoned, 0);

        // The later event was not blocked by the failing one
        assert!(progression.identity("u2").await.unwrap().is_some());

        // The failed event recovered and flipped back to synced
        let (status, foreign_id) = directory.sync_status("u1").await.unwrap();
        assert_eq!(status, SyncStatus::Synced);
        assert!(foreign_id.is_some());
    }

    #[tokio::test]
    async fn test_persistent_failure_is_abandoned_after_max_attempts() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        progression.fail_next_identity_upserts(10);
        let feed = InMemoryFeed::new(vec![IdentityChangeEvent::insert(fields("u1", "u1@example.org", None))]);

        let stats = processor(
            ProcessorConfig {
                max_attempts: 3,
                retry_delay: Duration::ZERO,
            },
            feed,
            Arc::clone(&progression),
            Arc::clone(&directory),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.recovered, 0);
        assert!(progression.identity("u1").await.unwrap().is_none());

        let (status, _) = directory.sync_status("u1").await.unwrap();
        assert_eq!(status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_advances_past_failed_events() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        progression.fail_next_identity_upserts(1);
        let feed = InMemoryFeed::new(vec![
            IdentityChangeEvent::insert(fields("u1", "u1@example.org", None)),
            IdentityChangeEvent::insert(fields("u2", "u2@example.org", None)),
        ]);
        let marker = feed.committed_marker();

        processor(immediate_retries(), feed, progression, directory)
            .run()
            .await
            .unwrap();

        // Both positions were committed: the failure was recorded, not
        // re-delivered forever
        assert_eq!(marker.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_for_unknown_key_is_harmless() {
        let progression = Arc::new(InMemoryProgressionStore::new());
        let directory = Arc::new(InMemoryMeteringStore::new());

        let feed = InMemoryFeed::new(vec![IdentityChangeEvent::delete("ghost")]);
        let stats = processor(ProcessorConfig::default(), feed, progression, directory)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.deactivated, 1);
        assert_eq!(stats.failed, 0);
    }
}
