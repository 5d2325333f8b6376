//! Worker composition root: build and lifecycle-manage the concrete
//! dependencies behind the ports.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use packrat::{
    ConsumeError, InMemoryStore, MessageConsumer, MetadataStore, ProcessingService,
    SettingsError, StoreError, UrlFetcher,
};
use packrat_amqp::AmqpConsumer;
use packrat_mongo::MongoStore;

use crate::fetcher::ReqwestFetcher;
use crate::settings::{ConsumerBackend, RepositoryBackend, WorkerSettings};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("store startup failed: {0}")]
    Store(#[from] StoreError),
    #[error("consumer startup failed: {0}")]
    Consumer(#[from] ConsumeError),
    #[error("http client startup failed: {0}")]
    HttpClient(String),
    #[error("message handler reported a failure: {0}")]
    Handler(String),
}

/// Wired worker dependencies. Construction connects store then consumer;
/// a consumer failure tears the store down before the error propagates.
pub struct WorkerDependencies {
    pub settings: WorkerSettings,
    pub store: Arc<dyn MetadataStore>,
    pub consumer: Arc<dyn MessageConsumer>,
    pub fetcher: Arc<dyn UrlFetcher>,
    pub service: Arc<ProcessingService>,
}

impl WorkerDependencies {
    pub async fn connect(settings: WorkerSettings) -> Result<Self, WorkerError> {
        let store: Arc<dyn MetadataStore> = match settings.repository_backend {
            RepositoryBackend::Mongo => Arc::new(MongoStore::connect(&settings.store).await?),
            RepositoryBackend::InMemory => Arc::new(InMemoryStore::new()),
        };

        let ConsumerBackend::Broker = settings.consumer_backend;
        let consumer: Arc<dyn MessageConsumer> =
            Arc::new(AmqpConsumer::new(settings.broker.clone(), settings.backoff.clone()));
        if let Err(err) = consumer.connect().await {
            store.close().await;
            return Err(err.into());
        }

        let fetcher: Arc<dyn UrlFetcher> = Arc::new(
            ReqwestFetcher::new(
                settings.fetch_connect_timeout,
                settings.fetch_read_timeout,
                &settings.fetch_user_agent,
            )
            .map_err(|err| WorkerError::HttpClient(err.to_string()))?,
        );

        let service = Arc::new(
            ProcessingService::new(store.clone(), fetcher.clone(), settings.max_retries)
                .with_max_page_source_length(settings.max_page_source_length),
        );

        info!(
            event = "worker_bootstrap_complete",
            queue_name = %settings.broker.queue_name,
            prefetch_count = settings.broker.prefetch_count,
            max_retries = settings.max_retries,
        );
        Ok(Self { settings, store, consumer, fetcher, service })
    }

    /// Shutdown order: consumer, fetcher, store.
    pub async fn close(&self) {
        self.consumer.close().await;
        self.fetcher.close().await;
        self.store.close().await;
        info!(event = "worker_dependencies_closed");
    }
}
