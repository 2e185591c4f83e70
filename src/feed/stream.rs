//! MongoDB change-stream feed
//!
//! Watches the identity collection and exposes it through the [`ChangeFeed`]
//! contract. The resume token is persisted in the metering store per
//! consumer, so a restarted processor picks up after the last committed
//! event. The driver resumes transient stream interruptions internally;
//! `next_entry` returning `None` means the stream has genuinely ended
//! (e.g. the collection was invalidated).

use bson::{doc, Bson, DateTime};
use futures_util::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use tracing::{debug, info, warn};

use crate::db::schemas::{CheckpointDoc, IdentityDoc, CHECKPOINT_COLLECTION, IDENTITY_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::feed::{ChangeFeed, ChangeOperation, FeedEntry, FeedToken, IdentityChangeEvent};
use crate::types::{Result, TurnstileError};

/// Consumer name under which the identity sync checkpoint is stored
pub const FEED_CONSUMER: &str = "identity-sync";

/// Change feed over the identity collection
pub struct MongoChangeFeed {
    stream: ChangeStream<ChangeStreamEvent<IdentityDoc>>,
    checkpoints: MongoCollection<CheckpointDoc>,
}

impl MongoChangeFeed {
    /// Open the feed, resuming from the persisted checkpoint when present
    pub async fn open(mongo: &MongoClient) -> Result<Self> {
        let checkpoints = mongo.collection::<CheckpointDoc>(CHECKPOINT_COLLECTION).await?;

        let resume_token = checkpoints
            .find_one(doc! { "consumer": FEED_CONSUMER })
            .await?
            .and_then(|c| c.resume_token)
            .map(|raw| bson::from_bson::<ResumeToken>(raw))
            .transpose()
            .map_err(|e| TurnstileError::Feed(format!("Corrupt resume token: {}", e)))?;

        let identities = mongo
            .inner()
            .database(mongo.db_name())
            .collection::<IdentityDoc>(IDENTITY_COLLECTION);

        let mut watch = identities
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_token {
            info!("Resuming identity change feed from checkpoint");
            watch = watch.resume_after(token);
        } else {
            info!("Starting identity change feed from the current position");
        }

        let stream = watch
            .await
            .map_err(|e| TurnstileError::Feed(format!("Failed to open change stream: {}", e)))?;

        Ok(Self { stream, checkpoints })
    }

    fn document_key_string(event: &ChangeStreamEvent<IdentityDoc>) -> Option<String> {
        let key = event.document_key.as_ref()?.get("_id")?;
        match key {
            Bson::ObjectId(oid) => Some(oid.to_hex()),
            Bson::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn next_entry(&mut self) -> Result<Option<FeedEntry>> {
        loop {
            let Some(event) = self.stream.next().await else {
                return Ok(None);
            };
            let event = event.map_err(|e| TurnstileError::Feed(format!("Change stream error: {}", e)))?;

            let operation = match event.operation_type {
                OperationType::Insert => ChangeOperation::Insert,
                OperationType::Update | OperationType::Replace => ChangeOperation::Update,
                OperationType::Delete => ChangeOperation::Delete,
                OperationType::Invalidate => {
                    warn!("Identity change stream invalidated");
                    return Ok(None);
                }
                other => {
                    debug!(operation = ?other, "Skipping non-identity change event");
                    continue;
                }
            };

            // The raw document key is the one identifier present on every
            // operation, deletes included. The gamification store records it
            // at upsert time so deletes resolve to the same row.
            let Some(document_key) = Self::document_key_string(&event) else {
                debug!("Skipping change event without document key");
                continue;
            };

            let full_document = event.full_document.as_ref().map(IdentityDoc::fields);

            let token = self
                .stream
                .resume_token()
                .ok_or_else(|| TurnstileError::Feed("Change stream yielded no resume token".to_string()))?;
            let token = bson::to_bson(&token)
                .map_err(|e| TurnstileError::Feed(format!("Serialize resume token: {}", e)))?;

            return Ok(Some(FeedEntry {
                event: IdentityChangeEvent {
                    operation,
                    document_key,
                    full_document,
                },
                token: FeedToken(token),
            }));
        }
    }

    async fn commit(&mut self, token: &FeedToken) -> Result<()> {
        self.checkpoints
            .upsert_one(
                doc! { "consumer": FEED_CONSUMER },
                doc! {
                    "$set": {
                        "resume_token": token.0.clone(),
                        "metadata.updated_at": DateTime::now(),
                    },
                    "$setOnInsert": {
                        "metadata.created_at": DateTime::now(),
                        "metadata.is_deleted": false,
                    },
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Integration tests would require a MongoDB replica set (change streams
    // are unavailable on standalone servers). Processor semantics are
    // covered against the in-memory feed in feed::processor.
}
