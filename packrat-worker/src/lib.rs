#![forbid(unsafe_code)]

//! Queue worker for the packrat pipeline.
//!
//! Consumes fetch requests from the durable queue one at a time, drives each
//! through the processing service (fetch → persist → ack/nack with bounded
//! retry), and owns graceful shutdown: cancel the subscription, wait a
//! bounded time for the in-flight handler, then close consumer, fetcher and
//! store in that order.

pub mod composition;
pub mod fetcher;
pub mod handler;
pub mod settings;

pub use composition::{WorkerDependencies, WorkerError};
pub use fetcher::ReqwestFetcher;
pub use handler::PipelineHandler;
pub use settings::{ConsumerBackend, RepositoryBackend, WorkerSettings};
