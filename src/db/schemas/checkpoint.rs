//! Change-feed checkpoint schema
//!
//! Persists the change stream's resume position so a restarted processor
//! continues from where it left off instead of skipping events.

use bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for feed checkpoints
pub const CHECKPOINT_COLLECTION: &str = "feed_checkpoints";

/// Checkpoint document, one per feed consumer
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// Consumer name owning this checkpoint
    pub consumer: String,

    /// Opaque resume position within the change stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Bson>,
}

impl IntoIndexes for CheckpointDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "consumer": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("consumer_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for CheckpointDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
