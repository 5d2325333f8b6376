//! Ingress service settings.

use std::time::Duration;

use packrat::{
    env_lookup, parse_or, string_or, BackoffSettings, BrokerSettings, EnvLookup, SettingsError,
    StoreSettings,
};

/// Which publisher implementation to wire at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherBackend {
    Broker,
    InMemory,
}

/// Which store implementation to wire at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Mongo,
    InMemory,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub broker: BrokerSettings,
    pub store: StoreSettings,
    pub backoff: BackoffSettings,
    pub publish_timeout: Duration,
    pub readiness_ping_timeout: Duration,
    pub publisher_backend: PublisherBackend,
    pub database_backend: DatabaseBackend,
    pub bind_addr: String,
}

impl ApiSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, SettingsError> {
        let publish_timeout: f64 = parse_or(lookup, "PUBLISH_TIMEOUT_SECONDS", 30.0)?;
        let ping_timeout: f64 = parse_or(lookup, "READINESS_PING_TIMEOUT_SECONDS", 30.0)?;
        Ok(Self {
            broker: BrokerSettings::from_lookup(lookup)?,
            store: StoreSettings::from_lookup(lookup)?,
            backoff: BackoffSettings::from_lookup(lookup)?,
            publish_timeout: Duration::from_secs_f64(publish_timeout),
            readiness_ping_timeout: Duration::from_secs_f64(ping_timeout),
            publisher_backend: publisher_backend(lookup)?,
            database_backend: database_backend(lookup)?,
            bind_addr: string_or(lookup, "API_BIND_ADDR", "0.0.0.0:8000"),
        })
    }
}

fn publisher_backend(lookup: EnvLookup<'_>) -> Result<PublisherBackend, SettingsError> {
    let value = string_or(lookup, "PUBLISHER_BACKEND", "broker");
    match value.as_str() {
        // "rabbitmq" is the historical spelling of the broker backend.
        "broker" | "rabbitmq" => Ok(PublisherBackend::Broker),
        "inmemory" => Ok(PublisherBackend::InMemory),
        _ => Err(SettingsError::Invalid { name: "PUBLISHER_BACKEND", value }),
    }
}

fn database_backend(lookup: EnvLookup<'_>) -> Result<DatabaseBackend, SettingsError> {
    let value = string_or(lookup, "DATABASE_BACKEND", "mongo");
    match value.as_str() {
        "mongo" => Ok(DatabaseBackend::Mongo),
        "inmemory" => Ok(DatabaseBackend::InMemory),
        _ => Err(SettingsError::Invalid { name: "DATABASE_BACKEND", value }),
    }
}
