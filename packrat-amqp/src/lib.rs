#![forbid(unsafe_code)]

//! RabbitMQ adapters for the packrat pipeline (companion crate).
//!
//! [`AmqpPublisher`] and [`AmqpConsumer`] implement the root crate's
//! publisher/consumer ports over lapin with the durable, bounded queue the
//! pipeline requires: `x-max-length` plus `x-overflow = reject-publish`,
//! publisher confirms on the publish side, manual acks with per-consumer
//! prefetch on the consume side. Connection recovery is local to each
//! adapter: broker close callbacks enqueue an event, and a supervisor task on
//! the owning runtime re-climbs the connection ladder with bounded
//! exponential backoff.

mod connection;
mod consumer;
mod publisher;

pub use connection::{queue_arguments, LinkState};
pub use consumer::{AmqpConsumer, AmqpDelivery};
pub use publisher::AmqpPublisher;
