//! Worker service settings.

use std::time::Duration;

use packrat::{
    env_lookup, parse, parse_or, string_or, BackoffSettings, BrokerSettings, EnvLookup,
    SettingsError, StoreSettings, MAX_PAGE_SOURCE_LENGTH,
};

/// Which store implementation the worker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryBackend {
    Mongo,
    InMemory,
}

/// Which consumer implementation feeds the worker. Only the broker-backed
/// consumer exists; the selector stays so a bad value fails at startup
/// instead of silently defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBackend {
    Broker,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub broker: BrokerSettings,
    pub store: StoreSettings,
    pub backoff: BackoffSettings,
    pub max_retries: u32,
    pub fetch_connect_timeout: Duration,
    pub fetch_read_timeout: Duration,
    pub fetch_user_agent: String,
    pub max_page_source_length: i64,
    pub repository_backend: RepositoryBackend,
    pub consumer_backend: ConsumerBackend,
    pub shutdown_lock_wait: Duration,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, SettingsError> {
        let connect_timeout: f64 = parse_or(lookup, "FETCH_CONNECT_TIMEOUT_SECONDS", 5.0)?;
        let read_timeout: f64 = parse_or(lookup, "FETCH_READ_TIMEOUT_SECONDS", 15.0)?;
        let shutdown_wait: f64 = parse_or(lookup, "SHUTDOWN_LOCK_WAIT_SECONDS", 60.0)?;
        Ok(Self {
            broker: BrokerSettings::from_lookup(lookup)?,
            store: StoreSettings::from_lookup(lookup)?,
            backoff: BackoffSettings::from_lookup(lookup)?,
            max_retries: parse(lookup, "MAX_RETRIES")?,
            fetch_connect_timeout: Duration::from_secs_f64(connect_timeout),
            fetch_read_timeout: Duration::from_secs_f64(read_timeout),
            fetch_user_agent: string_or(lookup, "FETCH_USER_AGENT", ""),
            max_page_source_length: parse_or(
                lookup,
                "MAX_PAGE_SOURCE_LENGTH",
                MAX_PAGE_SOURCE_LENGTH,
            )?,
            repository_backend: repository_backend(lookup)?,
            consumer_backend: consumer_backend(lookup)?,
            shutdown_lock_wait: Duration::from_secs_f64(shutdown_wait),
        })
    }
}

fn repository_backend(lookup: EnvLookup<'_>) -> Result<RepositoryBackend, SettingsError> {
    let value = string_or(lookup, "REPOSITORY_BACKEND", "mongo");
    match value.as_str() {
        "mongo" => Ok(RepositoryBackend::Mongo),
        "inmemory" => Ok(RepositoryBackend::InMemory),
        _ => Err(SettingsError::Invalid { name: "REPOSITORY_BACKEND", value }),
    }
}

fn consumer_backend(lookup: EnvLookup<'_>) -> Result<ConsumerBackend, SettingsError> {
    let value = string_or(lookup, "CONSUMER_BACKEND", "broker");
    match value.as_str() {
        "broker" | "rabbitmq" => Ok(ConsumerBackend::Broker),
        _ => Err(SettingsError::Invalid { name: "CONSUMER_BACKEND", value }),
    }
}
