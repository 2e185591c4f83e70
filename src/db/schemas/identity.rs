//! Identity document schema
//!
//! Canonical user identity owned by the metering store. Mutations to these
//! documents are propagated into the gamification store by the identity
//! change processor, which records the propagation state back here.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::stores::IdentityFields;

/// Collection name for identities
pub const IDENTITY_COLLECTION: &str = "identities";

/// Propagation state of an identity record
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Not yet propagated to the gamification store
    #[default]
    Pending,
    /// Propagated; `postgres_id` holds the resolved row id
    Synced,
    /// Last propagation attempt failed
    Failed,
}

/// Identity document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IdentityDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// External identifier linking this identity across stores
    pub external_id: String,

    /// Contact email
    pub email: String,

    /// Display name
    pub name: String,

    /// Rank; transitions are recorded as audit facts downstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,

    /// Opaque credential hash reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_hash: Option<String>,

    /// Propagation state, maintained by the change processor
    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Gamification-store row id, set once propagation succeeds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres_id: Option<String>,
}

impl IdentityDoc {
    /// The identity fields carried across stores
    pub fn fields(&self) -> IdentityFields {
        IdentityFields {
            external_id: self.external_id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            rank: self.rank.clone(),
            credential_hash: self.credential_hash.clone(),
        }
    }
}

impl IntoIndexes for IdentityDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "external_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("external_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "sync_status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("sync_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for IdentityDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
