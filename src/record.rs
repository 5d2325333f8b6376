//! Domain value objects: the persisted metadata record and its pieces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::ProcessingStatus;

/// The `metadata` block of a record: what the fetch observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataBlock {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub page_source: String,
    pub status_code: u16,
    pub final_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_details: Option<Map<String, Value>>,
}

impl MetadataBlock {
    /// Stub written when a record is created before any fetch completed.
    pub fn empty() -> Self {
        Self {
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            page_source: String::new(),
            status_code: 0,
            final_url: String::new(),
            additional_details: None,
        }
    }
}

impl From<FetchResult> for MetadataBlock {
    fn from(result: FetchResult) -> Self {
        Self {
            headers: result.headers,
            cookies: result.cookies,
            page_source: result.page_source,
            status_code: result.status_code,
            final_url: result.final_url,
            additional_details: result.additional_details,
        }
    }
}

/// Bookkeeping for the worker's attempts on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub attempt_number: u32,
    pub error_msg: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
    pub last_request_id: String,
}

/// One persisted record per URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub url: String,
    pub status: ProcessingStatus,
    pub metadata: MetadataBlock,
    pub processing: ProcessingInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-message processing context threaded through store transitions.
///
/// `attempt_number` is the count of fetch attempts completed for the URL; the
/// processing service owns it (reads it back from the store, bumps it on
/// failure) and the store only persists the supplied value.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingContext {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub attempt_number: u32,
}

impl ProcessingContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), started_at: Utc::now(), attempt_number: 0 }
    }

    /// Same submission, different attempt count.
    pub fn with_attempt(&self, attempt_number: u32) -> Self {
        Self {
            request_id: self.request_id.clone(),
            started_at: self.started_at,
            attempt_number,
        }
    }
}

/// What a successful one-shot GET produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub page_source: String,
    pub status_code: u16,
    pub final_url: String,
    pub additional_details: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_serializes_without_additional_details() {
        let json = serde_json::to_value(MetadataBlock::empty()).unwrap();
        assert_eq!(json["page_source"], "");
        assert_eq!(json["status_code"], 0);
        assert!(json.get("additional_details").is_none());
    }

    #[test]
    fn block_round_trips_through_json() {
        let mut details = Map::new();
        details.insert("truncated".into(), Value::Bool(true));
        details.insert("original_length".into(), Value::from(4096));
        let block = MetadataBlock {
            headers: BTreeMap::from([("content-type".into(), "text/html".into())]),
            cookies: BTreeMap::from([("session".into(), "abc".into())]),
            page_source: "<html/>".into(),
            status_code: 200,
            final_url: "https://example.com/".into(),
            additional_details: Some(details),
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: MetadataBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn context_with_attempt_keeps_identity() {
        let ctx = ProcessingContext::new("req-1");
        let next = ctx.with_attempt(3);
        assert_eq!(next.request_id, "req-1");
        assert_eq!(next.started_at, ctx.started_at);
        assert_eq!(next.attempt_number, 3);
    }
}
