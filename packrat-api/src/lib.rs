#![forbid(unsafe_code)]

//! Ingress HTTP service for the packrat pipeline.
//!
//! Accepts URL submissions (`POST /metadata`), answers lookups
//! (`GET /metadata?url=U`) from the store written by the worker, and exposes
//! liveness/readiness probes. The ingress never mutates records; on a lookup
//! miss it publishes exactly one queue message and reports 202.

pub mod app;
pub mod health;
pub mod routes;
pub mod settings;
pub mod state;

pub use app::{router, ApiError, AppDependencies};
pub use settings::{ApiSettings, DatabaseBackend, PublisherBackend};
pub use state::AppState;
