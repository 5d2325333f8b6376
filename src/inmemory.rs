//! In-memory backends for local mode and tests.
//!
//! Selected via the backend settings (`publisher_backend = "inmemory"`,
//! repository backend `"inmemory"`). They honor the same contracts as the
//! broker/store adapters — including queue-capacity overflow — minus
//! durability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{AckError, PublishError, StoreError};
use crate::message::FetchRequest;
use crate::ports::{IncomingMessage, MessagePublisher, MetadataStore};
use crate::record::{MetadataBlock, MetadataRecord, ProcessingContext, ProcessingInfo};
use crate::status::ProcessingStatus;

/// Publisher that appends to a vector. Ready from construction, like a
/// broker that never drops; `with_capacity` simulates `reject-publish`
/// overflow.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    ready: AtomicBool,
    capacity: Option<usize>,
    messages: Mutex<Vec<FetchRequest>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self { ready: AtomicBool::new(true), capacity: None, messages: Mutex::new(Vec::new()) }
    }

    /// Reject publishes past `capacity`, mirroring `x-overflow = reject-publish`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ready: AtomicBool::new(true),
            capacity: Some(capacity),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Not ready until `connect` is called. For readiness-path tests.
    pub fn not_ready() -> Self {
        Self { ready: AtomicBool::new(false), capacity: None, messages: Mutex::new(Vec::new()) }
    }

    pub fn published(&self) -> Vec<FetchRequest> {
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn published_count(&self) -> usize {
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, request: &FetchRequest) -> Result<(), PublishError> {
        if !self.ready() {
            return Err(PublishError::NotReady);
        }
        let mut messages = self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(capacity) = self.capacity {
            if messages.len() >= capacity {
                return Err(PublishError::QueueRejected(format!(
                    "queue at capacity ({capacity})"
                )));
            }
        }
        messages.push(request.clone());
        Ok(())
    }

    async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    NackedRequeue,
    Rejected,
}

/// Delivery double tracking its settlement. Settling twice is an error, as
/// it would be on a real channel.
#[derive(Debug)]
pub struct InMemoryMessage {
    body: Vec<u8>,
    outcome: Mutex<Option<MessageOutcome>>,
}

impl InMemoryMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, outcome: Mutex::new(None) }
    }

    pub fn outcome(&self) -> Option<MessageOutcome> {
        *self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, outcome: MessageOutcome) -> Result<(), AckError> {
        let mut slot = self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *slot {
            return Err(AckError(format!("message already settled as {previous:?}")));
        }
        *slot = Some(outcome);
        Ok(())
    }
}

#[async_trait]
impl IncomingMessage for InMemoryMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self) -> Result<(), AckError> {
        self.settle(MessageOutcome::Acked)
    }

    async fn nack_requeue(&self) -> Result<(), AckError> {
        self.settle(MessageOutcome::NackedRequeue)
    }

    async fn reject(&self) -> Result<(), AckError> {
        self.settle(MessageOutcome::Rejected)
    }

    fn processed(&self) -> bool {
        self.outcome().is_some()
    }
}

/// Store over a hash map with the same upsert semantics as the document
/// store: full-document writes keyed by url, `ensure_record` insert-only.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, MetadataRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing the transition ops.
    pub fn insert(&self, record: MetadataRecord) {
        self.lock().insert(record.url.clone(), record);
    }

    pub fn record_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MetadataRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn upsert_with(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        apply: impl FnOnce(&mut MetadataRecord),
    ) -> MetadataRecord {
        let now = Utc::now();
        let mut records = self.lock();
        let record = records.entry(url.to_owned()).or_insert_with(|| MetadataRecord {
            url: url.to_owned(),
            status: ProcessingStatus::Pending,
            metadata: MetadataBlock::empty(),
            processing: ProcessingInfo {
                attempt_number: ctx.attempt_number,
                error_msg: None,
                last_attempt_at: now,
                last_request_id: ctx.request_id.clone(),
            },
            created_at: now,
            updated_at: now,
        });
        record.updated_at = now;
        apply(record);
        record.clone()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn ensure_record(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError> {
        // Insert-only: an existing record keeps status and processing state.
        self.upsert_with(url, ctx, |_record| {});
        Ok(())
    }

    async fn mark_in_progress(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError> {
        self.upsert_with(url, ctx, |record| {
            record.status = ProcessingStatus::InProgress;
            record.processing.attempt_number = ctx.attempt_number;
            record.processing.error_msg = None;
            record.processing.last_attempt_at = Utc::now();
            record.processing.last_request_id = ctx.request_id.clone();
        });
        Ok(())
    }

    async fn mark_completed(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        metadata: &MetadataBlock,
    ) -> Result<(), StoreError> {
        self.upsert_with(url, ctx, |record| {
            record.status = ProcessingStatus::Completed;
            record.metadata = metadata.clone();
            record.processing.attempt_number = ctx.attempt_number;
            record.processing.error_msg = None;
            record.processing.last_attempt_at = Utc::now();
            record.processing.last_request_id = ctx.request_id.clone();
        });
        Ok(())
    }

    async fn mark_retryable_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<u32, StoreError> {
        let record = self.upsert_with(url, ctx, |record| {
            record.status = ProcessingStatus::FailedRetryable;
            record.processing.attempt_number = ctx.attempt_number;
            record.processing.error_msg = Some(error.to_owned());
            record.processing.last_attempt_at = Utc::now();
            record.processing.last_request_id = ctx.request_id.clone();
        });
        Ok(record.processing.attempt_number)
    }

    async fn mark_permanent_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<(), StoreError> {
        self.upsert_with(url, ctx, |record| {
            record.status = ProcessingStatus::FailedPermanent;
            record.processing.attempt_number = ctx.attempt_number;
            record.processing.error_msg = Some(error.to_owned());
            record.processing.last_attempt_at = Utc::now();
            record.processing.last_request_id = ctx.request_id.clone();
        });
        Ok(())
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError> {
        Ok(self.lock().get(url).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_records_messages_in_order() {
        let publisher = InMemoryPublisher::new();
        publisher.publish(&FetchRequest::new("https://a.example")).await.unwrap();
        publisher.publish(&FetchRequest::new("https://b.example")).await.unwrap();
        let published = publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].url, "https://a.example");
        assert_eq!(published[1].url, "https://b.example");
    }

    #[tokio::test]
    async fn publisher_at_capacity_rejects_like_overflow() {
        let publisher = InMemoryPublisher::with_capacity(1);
        publisher.publish(&FetchRequest::new("https://a.example")).await.unwrap();
        let err = publisher.publish(&FetchRequest::new("https://b.example")).await.unwrap_err();
        assert!(err.is_queue_rejected());
        assert_eq!(publisher.published_count(), 1);
    }

    #[tokio::test]
    async fn not_ready_publisher_rejects_until_connected() {
        let publisher = InMemoryPublisher::not_ready();
        let err = publisher.publish(&FetchRequest::new("https://a.example")).await.unwrap_err();
        assert!(matches!(err, PublishError::NotReady));
        publisher.connect().await.unwrap();
        publisher.publish(&FetchRequest::new("https://a.example")).await.unwrap();
    }

    #[tokio::test]
    async fn closed_publisher_is_not_ready() {
        let publisher = InMemoryPublisher::new();
        assert!(publisher.ready());
        publisher.close().await;
        assert!(!publisher.ready());
    }

    #[tokio::test]
    async fn message_settles_exactly_once() {
        let message = InMemoryMessage::new(b"{}".to_vec());
        assert!(!message.processed());
        message.ack().await.unwrap();
        assert!(message.processed());
        assert!(message.nack_requeue().await.is_err());
        assert_eq!(message.outcome(), Some(MessageOutcome::Acked));
    }

    #[tokio::test]
    async fn ensure_record_is_insert_only() {
        let store = InMemoryStore::new();
        let ctx = ProcessingContext::new("req-1");
        store.ensure_record("https://example.com", &ctx).await.unwrap();
        let created = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(created.status, ProcessingStatus::Pending);

        store.mark_completed("https://example.com", &ctx, &MetadataBlock::empty()).await.unwrap();
        store.ensure_record("https://example.com", &ctx.with_attempt(5)).await.unwrap();

        let after = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(after.status, ProcessingStatus::Completed);
        assert_eq!(after.created_at, created.created_at);
        assert!(after.updated_at >= created.updated_at);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn transitions_overwrite_status_and_attempts() {
        let store = InMemoryStore::new();
        let ctx = ProcessingContext::new("req-1");
        store.mark_in_progress("https://example.com", &ctx.with_attempt(0)).await.unwrap();

        let after_write =
            store.mark_retryable_failure("https://example.com", &ctx.with_attempt(1), "kaput").await.unwrap();
        assert_eq!(after_write, 1);

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::FailedRetryable);
        assert_eq!(record.processing.error_msg.as_deref(), Some("kaput"));

        store.mark_in_progress("https://example.com", &ctx.with_attempt(1)).await.unwrap();
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::InProgress);
        assert_eq!(record.processing.error_msg, None);
    }

    #[tokio::test]
    async fn missing_url_reads_as_none() {
        let store = InMemoryStore::new();
        assert!(store.get_by_url("https://nowhere.example").await.unwrap().is_none());
    }
}
