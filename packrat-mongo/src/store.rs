//! The driver-backed store: connection bootstrap, index creation, and the
//! upsert transitions.

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use tracing::info;

use packrat::{
    MetadataBlock, MetadataRecord, MetadataStore, ProcessingContext, ProcessingStatus,
    StoreError, StoreSettings,
};

use crate::document::{
    completed_update, ensure_record_update, failure_update, filter_by_url, in_progress_update,
    record_from_document,
};

const URL_INDEX: &str = "uq_metadata_url";
const CREATED_AT_INDEX: &str = "idx_metadata_created_at";

/// MongoDB-backed [`MetadataStore`].
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connect with the configured server-selection timeout, fail fast with
    /// a ping, and create the indexes the pipeline relies on.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(settings.mongodb_uri())
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        options.server_selection_timeout = Some(settings.connection_timeout);
        options.connect_timeout = Some(settings.connection_timeout);

        let client =
            Client::with_options(options).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let database = client.database(&settings.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let store = Self { collection: database.collection(&settings.collection), client };
        store.ensure_indexes().await?;
        info!(
            event = "store_connected",
            database = %settings.database,
            collection = %settings.collection,
        );
        Ok(store)
    }

    /// Unique index on `url` plus the `created_at` secondary index.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique_url = IndexModel::builder()
            .keys(doc! { "url": 1 })
            .options(
                IndexOptions::builder().unique(true).name(URL_INDEX.to_string()).build(),
            )
            .build();
        let created_at = IndexModel::builder()
            .keys(doc! { "created_at": 1 })
            .options(IndexOptions::builder().name(CREATED_AT_INDEX.to_string()).build())
            .build();
        self.collection
            .create_index(unique_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        self.collection
            .create_index(created_at)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, url: &str, update: Document) -> Result<(), StoreError> {
        self.collection
            .update_one(filter_by_url(url), update)
            .upsert(true)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MongoStore {
    async fn ensure_record(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError> {
        self.upsert(url, ensure_record_update(url, ctx, DateTime::now())).await
    }

    async fn mark_in_progress(&self, url: &str, ctx: &ProcessingContext) -> Result<(), StoreError> {
        self.upsert(url, in_progress_update(url, ctx, DateTime::now())).await
    }

    async fn mark_completed(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        metadata: &MetadataBlock,
    ) -> Result<(), StoreError> {
        let update = completed_update(url, ctx, metadata, DateTime::now())?;
        self.upsert(url, update).await
    }

    async fn mark_retryable_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<u32, StoreError> {
        let update =
            failure_update(url, ctx, ProcessingStatus::FailedRetryable, error, DateTime::now());
        let after = self
            .collection
            .find_one_and_update(filter_by_url(url), update)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(after
            .map(|doc| record_from_document(&doc).processing.attempt_number)
            .unwrap_or(ctx.attempt_number))
    }

    async fn mark_permanent_failure(
        &self,
        url: &str,
        ctx: &ProcessingContext,
        error: &str,
    ) -> Result<(), StoreError> {
        let update =
            failure_update(url, ctx, ProcessingStatus::FailedPermanent, error, DateTime::now());
        self.upsert(url, update).await
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let doc = self
            .collection
            .find_one(filter_by_url(url))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(doc.map(|doc| record_from_document(&doc)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn close(&self) {
        // The driver's clients are handles over one shared topology;
        // shutting a clone down releases the process-wide resources.
        self.client.clone().shutdown().await;
        info!(event = "store_closed");
    }
}
