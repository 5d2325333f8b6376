//! Error types for the pipeline's collaborators.
//!
//! Each stateful collaborator gets its own enum; predicates expose the
//! classifications the pipeline branches on (queue overflow, retryability).

use std::time::Duration;

use thiserror::Error;

use crate::message::MalformedMessage;

/// Failures surfaced by a message publisher.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The adapter is not in its READY state; the caller should back off.
    #[error("publisher_not_ready")]
    NotReady,
    /// The broker refused the message because the queue is at capacity.
    #[error("queue_rejected: {0}")]
    QueueRejected(String),
    /// The publish confirm did not arrive within the configured window.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    /// The broker connection or channel failed mid-publish.
    #[error("connection_lost: {0}")]
    ConnectionLost(String),
    /// The connect attempt budget ran out without reaching READY.
    #[error("broker connect failed after {attempts} attempts: {reason}")]
    ConnectExhausted { attempts: u32, reason: String },
    /// The outgoing message could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialize(String),
}

impl PublishError {
    /// Queue-overflow detection. Besides the dedicated variant, broker error
    /// text carrying `queue_rejected`/`queue_overflow` counts (the overflow
    /// signal sometimes arrives as a channel error string).
    pub fn is_queue_rejected(&self) -> bool {
        match self {
            Self::QueueRejected(_) => true,
            Self::ConnectionLost(reason) => {
                reason.contains("queue_rejected") || reason.contains("queue_overflow")
            }
            _ => false,
        }
    }
}

/// Failures surfaced by a message consumer.
#[derive(Debug, Clone, Error)]
pub enum ConsumeError {
    #[error("consumer not connected")]
    NotConnected,
    #[error("broker connect failed after {attempts} attempts: {reason}")]
    ConnectExhausted { attempts: u32, reason: String },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("cancel failed: {0}")]
    Cancel(String),
}

/// Failure to acknowledge, requeue, or reject a delivery.
#[derive(Debug, Clone, Error)]
#[error("broker acknowledgement failed: {0}")]
pub struct AckError(pub String);

/// Failures surfaced by the metadata store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or the operation failed server-side.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored document could not be mapped to the record shape.
    #[error("malformed stored document: {0}")]
    Document(String),
}

/// Failures surfaced by the URL fetcher.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Connect or read deadline exceeded.
    #[error("fetch timed out: {0}")]
    Timeout(String),
    /// Network, TLS, DNS, or HTTP-status failure.
    #[error("fetch failed: {0}")]
    Request(String),
    /// The URL was not acceptable to the HTTP client at all.
    #[error("invalid fetch url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Timeouts and request failures earn another attempt; a URL the client
    /// cannot even build a request for never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Request(_))
    }
}

/// Errors escaping the processing service into the handler wrapper.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ack(#[from] AckError),
}
