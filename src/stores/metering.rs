//! MongoDB-backed metering store
//!
//! Implements [`MeteringStore`] over the authoritative usage collection and
//! [`IdentityDirectory`] over the identity collection. Counter writes are
//! single-document updates, which MongoDB applies atomically; every counter
//! mutation is an `$inc`, never an absolute set.

use bson::{doc, DateTime};
use chrono::Utc;
use tracing::debug;

use crate::db::schemas::{
    IdentityDoc, SyncStatus, UsageDoc, EVENT_ID_WINDOW, IDENTITY_COLLECTION, USAGE_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::stores::{week_start, IdentityDirectory, MeteringStore, WeeklyUsage};
use crate::types::{Result, TurnstileError};

/// Metering store backed by MongoDB
#[derive(Clone)]
pub struct MongoMeteringStore {
    usage: MongoCollection<UsageDoc>,
    identities: MongoCollection<IdentityDoc>,
}

impl MongoMeteringStore {
    /// Open the usage and identity collections, applying their indexes
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            usage: mongo.collection::<UsageDoc>(USAGE_COLLECTION).await?,
            identities: mongo.collection::<IdentityDoc>(IDENTITY_COLLECTION).await?,
        })
    }

    /// Make sure a usage record exists and its weekly window is current.
    ///
    /// The rollover guard filters on the stale reset date, so two concurrent
    /// rollovers collapse into one: the loser's filter no longer matches.
    async fn ensure_current_window(&self, user_id: &str) -> Result<()> {
        let window_start = DateTime::from_chrono(week_start(Utc::now()));

        let fresh = UsageDoc::new(user_id.to_string(), window_start);
        let mut initial = bson::to_document(&fresh)
            .map_err(|e| TurnstileError::Database(format!("Serialize usage record: {}", e)))?;
        // The filter already pins user_id; keeping it in $setOnInsert too
        // would conflict
        initial.remove("user_id");
        self.usage
            .upsert_one(
                doc! { "user_id": user_id },
                doc! { "$setOnInsert": initial },
            )
            .await?;

        self.usage
            .update_one(
                doc! {
                    "user_id": user_id,
                    "weekly_usage.last_reset_date": { "$lt": window_start },
                },
                doc! {
                    "$set": {
                        "weekly_usage.count": 0,
                        "weekly_usage.last_reset_date": window_start,
                        "metadata.updated_at": DateTime::now(),
                    },
                },
            )
            .await?;

        Ok(())
    }

    fn weekly_from_doc(doc: &UsageDoc) -> WeeklyUsage {
        let now = Utc::now();
        let window_start = week_start(now);
        let last_reset = doc.weekly_usage.last_reset_date.to_chrono();

        // A record from a previous window reads as empty until the next write
        // rolls it over.
        if last_reset < window_start {
            WeeklyUsage {
                count: 0,
                base_limit: doc.weekly_usage.base_limit,
                last_reset_date: window_start,
            }
        } else {
            WeeklyUsage {
                count: doc.weekly_usage.count,
                base_limit: doc.weekly_usage.base_limit,
                last_reset_date: last_reset,
            }
        }
    }

    fn empty_window() -> WeeklyUsage {
        WeeklyUsage {
            count: 0,
            base_limit: crate::db::schemas::DEFAULT_BASE_LIMIT,
            last_reset_date: week_start(Utc::now()),
        }
    }
}

#[async_trait::async_trait]
impl MeteringStore for MongoMeteringStore {
    async fn record_usage(&self, user_id: &str, amount: i64, event_id: &str) -> Result<WeeklyUsage> {
        if amount <= 0 {
            return Err(TurnstileError::InvalidAmount(amount));
        }

        self.ensure_current_window(user_id).await?;

        // The event-id filter makes the increment idempotent: a retried event
        // matches no document and falls through to the read below.
        let updated = self
            .usage
            .find_one_and_update(
                doc! {
                    "user_id": user_id,
                    "event_ids": { "$ne": event_id },
                },
                doc! {
                    "$inc": {
                        "weekly_usage.count": amount,
                        "total_tokens_consumed": amount,
                    },
                    "$push": {
                        "event_ids": { "$each": [event_id], "$slice": -EVENT_ID_WINDOW },
                    },
                    "$set": { "metadata.updated_at": DateTime::now() },
                },
            )
            .await?;

        match updated {
            Some(doc) => Ok(Self::weekly_from_doc(&doc)),
            None => {
                debug!(user_id = %user_id, event_id = %event_id, "Duplicate consumption event ignored");
                self.weekly_usage(user_id).await
            }
        }
    }

    async fn weekly_usage(&self, user_id: &str) -> Result<WeeklyUsage> {
        let doc = self.usage.find_one(doc! { "user_id": user_id }).await?;
        Ok(doc.as_ref().map(Self::weekly_from_doc).unwrap_or_else(Self::empty_window))
    }

    async fn total_consumed(&self, user_id: &str) -> Result<i64> {
        let doc = self.usage.find_one(doc! { "user_id": user_id }).await?;
        Ok(doc.map(|d| d.total_tokens_consumed).unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl IdentityDirectory for MongoMeteringStore {
    async fn mark_synced(&self, external_id: &str, foreign_id: &str) -> Result<()> {
        let status = bson::to_bson(&SyncStatus::Synced)
            .map_err(|e| TurnstileError::Database(format!("Serialize sync status: {}", e)))?;
        self.identities
            .update_one(
                doc! { "external_id": external_id },
                doc! {
                    "$set": {
                        "sync_status": status,
                        "postgres_id": foreign_id,
                        "metadata.updated_at": DateTime::now(),
                    },
                },
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, external_id: &str) -> Result<()> {
        let status = bson::to_bson(&SyncStatus::Failed)
            .map_err(|e| TurnstileError::Database(format!("Serialize sync status: {}", e)))?;
        self.identities
            .update_one(
                doc! { "external_id": external_id },
                doc! {
                    "$set": {
                        "sync_status": status,
                        "metadata.updated_at": DateTime::now(),
                    },
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Integration tests would require a running MongoDB instance. The
    // metering semantics (idempotent increments, window rollover) are
    // covered against the in-memory implementation in stores::memory.
}
