//! Reconciliation sweep
//!
//! Periodic corrective pass that overwrites the gamification store's cached
//! weekly counters from the metering store's authoritative figures, healing
//! drift from missed or failed dual-writes. One user's failure never aborts
//! the pass for the rest of the population, and each user's work is bounded
//! by a deadline so an unreachable identity cannot stall the sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::stores::{MeteringStore, ProgressionStore};
use crate::types::Result;

/// Sweep cadence and per-user deadline
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between passes
    pub interval: Duration,
    /// Deadline for one user's fetch-and-overwrite
    pub user_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            user_timeout: Duration::from_secs(5),
        }
    }
}

/// Summary of one reconciliation pass
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Users with a linked metering identity at pass start
    pub users_seen: usize,
    /// Users whose cached counter was overwritten
    pub users_synced: usize,
    /// Per-user failures, logged and skipped
    pub errors: Vec<String>,
}

/// Scheduled corrective pass over all linked users
pub struct ReconciliationSweep<M, P> {
    config: SweepConfig,
    metering: Arc<M>,
    progression: Arc<P>,
}

impl<M, P> ReconciliationSweep<M, P>
where
    M: MeteringStore,
    P: ProgressionStore,
{
    pub fn new(config: SweepConfig, metering: Arc<M>, progression: Arc<P>) -> Self {
        Self { config, metering, progression }
    }

    /// Run a single pass. This is the entry point an external scheduler
    /// invokes; per-user failures are recorded in the report, not raised.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let users = self.progression.linked_users().await?;
        let mut report = SweepReport {
            users_seen: users.len(),
            ..SweepReport::default()
        };

        for user_id in users {
            match tokio::time::timeout(self.config.user_timeout, self.sync_user(&user_id)).await {
                Ok(Ok(())) => report.users_synced += 1,
                Ok(Err(e)) => {
                    warn!(user_id = %user_id, error = %e, "Reconciliation failed for user, skipping");
                    report.errors.push(format!("{}: {}", user_id, e));
                }
                Err(_) => {
                    warn!(user_id = %user_id, "Reconciliation timed out for user, skipping");
                    report.errors.push(format!("{}: timed out", user_id));
                }
            }
        }

        info!(
            users_seen = report.users_seen,
            users_synced = report.users_synced,
            errors = report.errors.len(),
            "Reconciliation sweep completed"
        );

        Ok(report)
    }

    /// Overwrite one user's cached counter from the authoritative figure
    async fn sync_user(&self, user_id: &str) -> Result<()> {
        let usage = self.metering.weekly_usage(user_id).await?;
        self.progression.set_weekly_tokens(user_id, usage.count).await?;
        Ok(())
    }
}

/// Spawn the sweep as a background task on its configured cadence
pub fn spawn_reconciliation_task<M, P>(sweep: Arc<ReconciliationSweep<M, P>>) -> JoinHandle<()>
where
    M: MeteringStore + 'static,
    P: ProgressionStore + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = sweep.run_once().await {
                error!(error = %e, "Reconciliation sweep failed");
            }
        }
    })
}
