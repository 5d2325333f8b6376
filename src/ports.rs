//! Capability traits for the pipeline's external collaborators.
//!
//! The processing service and ingress handlers depend only on these; broker,
//! store, and HTTP adapters implement them. Tests substitute inline fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AckError, ConsumeError, FetchError, PublishError, StoreError};
use crate::message::FetchRequest;
use crate::record::{FetchResult, MetadataBlock, MetadataRecord, ProcessingContext};

/// Publishes fetch requests to the durable queue.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn connect(&self) -> Result<(), PublishError>;
    async fn publish(&self, request: &FetchRequest) -> Result<(), PublishError>;
    async fn close(&self);
    /// True only while the adapter can accept publishes.
    fn ready(&self) -> bool;
}

/// One delivery from the queue, with manual acknowledgement.
///
/// Exactly one of `ack`/`nack_requeue`/`reject` may take effect; afterwards
/// `processed()` reports true and further calls are errors at the broker's
/// discretion (callers check `processed()` first).
#[async_trait]
pub trait IncomingMessage: Send + Sync {
    fn body(&self) -> &[u8];
    async fn ack(&self) -> Result<(), AckError>;
    /// Negative acknowledgement; the broker redelivers.
    async fn nack_requeue(&self) -> Result<(), AckError>;
    /// Drop the message without redelivery (poison-message policy).
    async fn reject(&self) -> Result<(), AckError>;
    fn processed(&self) -> bool;
}

/// Receives each delivery from a consumer subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Box<dyn IncomingMessage>);
}

/// Subscribes to the durable queue and feeds a handler.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), ConsumeError>;
    /// Install the handler and begin delivery. Returns the consumer tag.
    async fn start_consuming(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String, ConsumeError>;
    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumeError>;
    async fn close(&self);
}

/// Record persistence. Every write is an idempotent upsert keyed on `url`;
/// `ctx.attempt_number` is persisted as given, never incremented here.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create the PENDING stub if absent; otherwise only bump `updated_at`.
    async fn ensure_record(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError>;
    async fn mark_in_progress(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError>;
    async fn mark_completed(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        metadata: &MetadataBlock,
    ) -> Result<(), StoreError>;
    /// Returns the attempt number as stored AFTER the write.
    async fn mark_retryable_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<u32, StoreError>;
    async fn mark_permanent_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<(), StoreError>;
    async fn get_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError>;
    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;
    async fn close(&self);
}

/// One-shot GET with redirect resolution. Does not truncate and does not
/// filter by content type; both are the processing service's concern.
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResult, FetchError>;
    async fn close(&self);
}
