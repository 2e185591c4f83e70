//! Identity change feed
//!
//! Ordered stream of identity mutations emitted by the metering store,
//! consumed at-least-once by the change processor. The feed contract is an
//! ordered `next` plus an explicit position commit; backends are the MongoDB
//! change stream (production) and an in-memory queue (tests, dev mode).

pub mod processor;
pub mod stream;

use async_trait::async_trait;
use bson::Bson;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::stores::IdentityFields;
use crate::types::Result;

pub use processor::{spawn_processor_task, IdentityChangeProcessor, ProcessorConfig, ProcessorStats};
pub use stream::MongoChangeFeed;

/// Kind of mutation carried by a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One identity mutation from the metering store.
///
/// Delete events carry only the document key; insert and update events carry
/// the full post-image.
#[derive(Debug, Clone)]
pub struct IdentityChangeEvent {
    pub operation: ChangeOperation,
    pub document_key: String,
    pub full_document: Option<IdentityFields>,
}

impl IdentityChangeEvent {
    pub fn insert(fields: IdentityFields) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            document_key: fields.external_id.clone(),
            full_document: Some(fields),
        }
    }

    pub fn update(fields: IdentityFields) -> Self {
        Self {
            operation: ChangeOperation::Update,
            document_key: fields.external_id.clone(),
            full_document: Some(fields),
        }
    }

    pub fn delete(document_key: &str) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            document_key: document_key.to_string(),
            full_document: None,
        }
    }

    /// External id of the affected identity, when the event carries one
    pub fn external_id(&self) -> Option<&str> {
        self.full_document.as_ref().map(|f| f.external_id.as_str())
    }
}

/// Opaque stream position
#[derive(Debug, Clone, PartialEq)]
pub struct FeedToken(pub Bson);

/// An event plus its position in the stream
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub event: IdentityChangeEvent,
    pub token: FeedToken,
}

/// Ordered change feed with explicit position commits.
///
/// `commit` durably records the position so a restarted consumer resumes
/// after the committed entry rather than skipping ahead.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event in stream order; `None` once the stream has ended
    async fn next_entry(&mut self) -> Result<Option<FeedEntry>>;

    /// Record `token` as the resume position
    async fn commit(&mut self, token: &FeedToken) -> Result<()>;
}

/// In-memory feed over a fixed event sequence
pub struct InMemoryFeed {
    events: VecDeque<IdentityChangeEvent>,
    next_seq: i64,
    committed: Arc<AtomicI64>,
}

impl InMemoryFeed {
    pub fn new(events: Vec<IdentityChangeEvent>) -> Self {
        Self {
            events: events.into(),
            next_seq: 0,
            committed: Arc::new(AtomicI64::new(-1)),
        }
    }

    /// Shared committed-position marker (-1 until the first commit)
    pub fn committed_marker(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.committed)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryFeed {
    async fn next_entry(&mut self) -> Result<Option<FeedEntry>> {
        let Some(event) = self.events.pop_front() else {
            return Ok(None);
        };
        let token = FeedToken(Bson::Int64(self.next_seq));
        self.next_seq += 1;
        Ok(Some(FeedEntry { event, token }))
    }

    async fn commit(&mut self, token: &FeedToken) -> Result<()> {
        if let Bson::Int64(seq) = token.0 {
            self.committed.store(seq, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(external_id: &str) -> IdentityFields {
        IdentityFields {
            external_id: external_id.to_string(),
            email: format!("{}@example.org", external_id),
            name: external_id.to_string(),
            rank: None,
            credential_hash: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_feed_preserves_order() {
        let mut feed = InMemoryFeed::new(vec![
            IdentityChangeEvent::insert(fields("u1")),
            IdentityChangeEvent::update(fields("u2")),
            IdentityChangeEvent::delete("u1"),
        ]);

        let first = feed.next_entry().await.unwrap().unwrap();
        assert_eq!(first.event.operation, ChangeOperation::Insert);
        assert_eq!(first.event.document_key, "u1");

        let second = feed.next_entry().await.unwrap().unwrap();
        assert_eq!(second.event.operation, ChangeOperation::Update);

        let third = feed.next_entry().await.unwrap().unwrap();
        assert_eq!(third.event.operation, ChangeOperation::Delete);
        assert!(third.event.full_document.is_none());

        assert!(feed.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_moves_the_marker() {
        let mut feed = InMemoryFeed::new(vec![
            IdentityChangeEvent::insert(fields("u1")),
            IdentityChangeEvent::insert(fields("u2")),
        ]);
        let marker = feed.committed_marker();
        assert_eq!(marker.load(Ordering::SeqCst), -1);

        let entry = feed.next_entry().await.unwrap().unwrap();
        feed.commit(&entry.token).await.unwrap();
        assert_eq!(marker.load(Ordering::SeqCst), 0);

        let entry = feed.next_entry().await.unwrap().unwrap();
        feed.commit(&entry.token).await.unwrap();
        assert_eq!(marker.load(Ordering::SeqCst), 1);
    }
}
