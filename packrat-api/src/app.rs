//! Composition root: wire settings to concrete adapters, own the startup and
//! shutdown order, and build the router.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tracing::info;

use packrat::{
    InMemoryPublisher, InMemoryStore, MessagePublisher, MetadataStore, PublishError,
    SettingsError, StoreError,
};
use packrat_amqp::AmqpPublisher;
use packrat_mongo::MongoStore;

use crate::health;
use crate::routes;
use crate::settings::{ApiSettings, DatabaseBackend, PublisherBackend};
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("publisher startup failed: {0}")]
    Publisher(#[from] PublishError),
    #[error("store startup failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wired adapters plus their lifecycle. Built only here; handlers receive
/// the immutable [`AppState`] view.
pub struct AppDependencies {
    pub settings: ApiSettings,
    pub publisher: Arc<dyn MessagePublisher>,
    pub store: Arc<dyn MetadataStore>,
}

impl AppDependencies {
    /// Connect publisher then store. If the store fails, the publisher is
    /// torn down before the error propagates so startup never leaks a
    /// half-wired process.
    pub async fn connect(settings: ApiSettings) -> Result<Self, ApiError> {
        let publisher: Arc<dyn MessagePublisher> = match settings.publisher_backend {
            PublisherBackend::Broker => Arc::new(AmqpPublisher::new(
                settings.broker.clone(),
                settings.backoff.clone(),
                settings.publish_timeout,
            )),
            PublisherBackend::InMemory => Arc::new(InMemoryPublisher::new()),
        };
        publisher.connect().await?;

        let store: Arc<dyn MetadataStore> = match settings.database_backend {
            DatabaseBackend::Mongo => match MongoStore::connect(&settings.store).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    publisher.close().await;
                    return Err(err.into());
                }
            },
            DatabaseBackend::InMemory => Arc::new(InMemoryStore::new()),
        };

        info!(event = "api_dependencies_connected");
        Ok(Self { settings, publisher, store })
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.publisher.clone(),
            self.store.clone(),
            self.settings.readiness_ping_timeout,
        )
    }

    pub async fn close(&self) {
        self.publisher.close().await;
        self.store.close().await;
        info!(event = "api_dependencies_closed");
    }
}

/// The ingress surface: metadata accept/lookup plus the two probes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metadata", post(routes::post_metadata).get(routes::get_metadata))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .with_state(state)
}
