#![forbid(unsafe_code)]

//! # packrat
//!
//! Core of an asynchronous URL-metadata inventory: clients submit a URL, a
//! fetch pipeline eventually persists a record with the response headers,
//! cookies, status code, final redirect URL and body, and clients poll for
//! the result.
//!
//! This crate holds the pieces every service shares:
//!
//! - the domain model ([`MetadataRecord`], [`FetchRequest`], [`ProcessingStatus`])
//! - capability traits for the stateful collaborators ([`MessagePublisher`],
//!   [`MessageConsumer`], [`MetadataStore`], [`UrlFetcher`])
//! - the worker's state machine ([`ProcessingService`]): ensure → in-progress
//!   → fetch → persist → ack/nack, with bounded retry and byte-capped bodies
//! - connection retry pacing ([`BackoffSchedule`])
//! - in-memory backends for local mode and tests
//!
//! Broker, store and HTTP integrations live in the companion crates
//! (`packrat-amqp`, `packrat-mongo`, `packrat-api`, `packrat-worker`).

mod backoff;
mod error;
mod inmemory;
mod message;
mod ports;
mod processing;
mod record;
mod settings;
mod status;

pub use backoff::{
    BackoffSchedule, BackoffSequence, InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper,
};
pub use error::{AckError, ConsumeError, FetchError, ProcessingError, PublishError, StoreError};
pub use inmemory::{InMemoryMessage, InMemoryPublisher, InMemoryStore, MessageOutcome};
pub use message::{FetchRequest, IncomingFetchRequest, MalformedMessage};
pub use ports::{
    IncomingMessage, MessageConsumer, MessageHandler, MessagePublisher, MetadataStore, UrlFetcher,
};
pub use processing::{ProcessingService, MAX_PAGE_SOURCE_LENGTH};
pub use record::{
    FetchResult, MetadataBlock, MetadataRecord, ProcessingContext, ProcessingInfo,
};
pub use settings::{
    env_lookup, parse, parse_or, require, string_or, BackoffSettings, BrokerSettings, EnvLookup,
    SettingsError, StoreSettings,
};
pub use status::ProcessingStatus;
