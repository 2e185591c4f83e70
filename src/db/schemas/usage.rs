//! Usage record schema
//!
//! Authoritative per-user consumption counters for the metering store.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for usage records
pub const USAGE_COLLECTION: &str = "usage_records";

/// Default per-user weekly allowance when none is configured
pub const DEFAULT_BASE_LIMIT: i64 = 100_000;

/// How many recent consumption event ids are retained for deduplication
pub const EVENT_ID_WINDOW: i64 = 200;

/// Weekly consumption window embedded in a usage record
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WeeklyWindow {
    /// Tokens consumed in the current window
    #[serde(default)]
    pub count: i64,

    /// Per-user weekly allowance
    #[serde(default = "default_base_limit")]
    pub base_limit: i64,

    /// Start of the window the count belongs to
    pub last_reset_date: DateTime,
}

fn default_base_limit() -> i64 {
    DEFAULT_BASE_LIMIT
}

/// Usage record stored in MongoDB, one per user
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UsageDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    /// User identifier
    pub user_id: String,

    /// Current weekly window
    pub weekly_usage: WeeklyWindow,

    /// Lifetime tokens consumed
    #[serde(default)]
    pub total_tokens_consumed: i64,

    /// Recent consumption event ids; retried events are dropped instead of
    /// double counted
    #[serde(default)]
    pub event_ids: Vec<String>,
}

impl UsageDoc {
    /// Create a fresh usage record for a user with an empty window
    pub fn new(user_id: String, window_start: DateTime) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user_id,
            weekly_usage: WeeklyWindow {
                count: 0,
                base_limit: DEFAULT_BASE_LIMIT,
                last_reset_date: window_start,
            },
            total_tokens_consumed: 0,
            event_ids: Vec::new(),
        }
    }
}

impl IntoIndexes for UsageDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("user_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for UsageDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
