//! The queue message exchanged between ingress and worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON payload published per ingress submission and consumed by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
}

impl FetchRequest {
    /// Mint a message for a fresh submission: new opaque id, current time.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_id: Uuid::new_v4().to_string(),
            requested_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Decoded view of an incoming delivery, tolerant of partial payloads.
///
/// Only `url` is required; older producers may omit `request_id` or
/// `requested_at`. A missing/empty `url` (or a non-JSON body) is a malformed
/// message and must be rejected without requeue by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingFetchRequest {
    pub url: String,
    pub request_id: String,
}

impl IncomingFetchRequest {
    pub fn decode(body: &[u8]) -> Result<Self, MalformedMessage> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            url: String,
            #[serde(default)]
            request_id: String,
        }

        let raw: Raw = serde_json::from_slice(body)
            .map_err(|err| MalformedMessage(format!("invalid JSON body: {err}")))?;
        let url = raw.url.trim().to_owned();
        if url.is_empty() {
            return Err(MalformedMessage("message missing required field: url".into()));
        }
        Ok(Self { url, request_id: raw.request_id.trim().to_owned() })
    }
}

/// A delivery whose body cannot be processed, ever. Poison-message policy
/// applies: reject without requeue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct MalformedMessage(pub String);
