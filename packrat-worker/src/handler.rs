//! The consumer-facing message handler: single-slot execution plus the
//! poison-message policy.
//!
//! A process-wide mutex serializes handler runs (the broker's prefetch
//! already throttles delivery; the mutex is what shutdown waits on). Any
//! error escaping the processing service is rejected without requeue and
//! recorded on the error channel for the supervisor loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use packrat::{IncomingMessage, MessageHandler, ProcessingError, ProcessingService};

pub struct PipelineHandler {
    service: Arc<ProcessingService>,
    slot: Arc<Mutex<()>>,
    errors: mpsc::UnboundedSender<ProcessingError>,
}

impl PipelineHandler {
    pub fn new(
        service: Arc<ProcessingService>,
        slot: Arc<Mutex<()>>,
        errors: mpsc::UnboundedSender<ProcessingError>,
    ) -> Self {
        Self { service, slot, errors }
    }
}

#[async_trait]
impl MessageHandler for PipelineHandler {
    async fn handle(&self, message: Box<dyn IncomingMessage>) {
        let _slot = self.slot.lock().await;
        if let Err(err) = self.service.process_message(message.as_ref()).await {
            error!(event = "message_handling_failed", error = %err);
            if !message.processed() {
                if let Err(reject_err) = message.reject().await {
                    warn!(event = "poison_reject_failed", error = %reject_err);
                }
            }
            let _ = self.errors.send(err);
        }
    }
}
