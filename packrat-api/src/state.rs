//! Shared request-handler state: immutable references to the adapters.

use std::sync::Arc;
use std::time::Duration;

use packrat::{MessagePublisher, MetadataStore};

/// Handed to every handler by the router. Built once at startup; handlers
/// never mutate it, only call through the trait objects.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn MessagePublisher>,
    pub store: Arc<dyn MetadataStore>,
    pub readiness_ping_timeout: Duration,
}

impl AppState {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        store: Arc<dyn MetadataStore>,
        readiness_ping_timeout: Duration,
    ) -> Self {
        Self { publisher, store, readiness_ping_timeout }
    }
}
