//! Update-document builders and the document → record mapping.
//!
//! Kept free of the driver so the exact shapes the store writes and reads
//! are unit-testable. Readers are lenient: missing or oddly-typed fields
//! degrade to defaults instead of failing a lookup.

use std::collections::BTreeMap;

use bson::{doc, Bson, DateTime, Document};
use chrono::Utc;
use serde_json::{Map, Value};

use packrat::{
    MetadataBlock, MetadataRecord, ProcessingContext, ProcessingInfo, ProcessingStatus, StoreError,
};

pub(crate) fn filter_by_url(url: &str) -> Document {
    doc! { "url": url }
}

fn empty_metadata() -> Document {
    // Serialization of MetadataBlock::empty() cannot fail; fall back to an
    // empty document rather than panic if it ever does.
    bson::to_document(&MetadataBlock::empty()).unwrap_or_default()
}

fn processing_fields(ctx: &ProcessingContext, now: DateTime) -> Document {
    doc! {
        "attempt_number": ctx.attempt_number as i64,
        "error_msg": Bson::Null,
        "last_attempt_at": now,
        "last_request_id": ctx.request_id.clone(),
    }
}

/// Insert the PENDING stub when absent; otherwise only bump `updated_at`.
pub(crate) fn ensure_record_update(url: &str, ctx: &ProcessingContext, now: DateTime) -> Document {
    doc! {
        "$setOnInsert": {
            "url": url,
            "status": ProcessingStatus::Pending.as_str(),
            "metadata": empty_metadata(),
            "processing": processing_fields(ctx, now),
            "created_at": now,
        },
        "$set": { "updated_at": now },
    }
}

/// Overwrite status to IN_PROGRESS regardless of the prior state.
pub(crate) fn in_progress_update(url: &str, ctx: &ProcessingContext, now: DateTime) -> Document {
    doc! {
        "$set": {
            "status": ProcessingStatus::InProgress.as_str(),
            "processing.attempt_number": ctx.attempt_number as i64,
            "processing.error_msg": Bson::Null,
            "processing.last_attempt_at": now,
            "processing.last_request_id": ctx.request_id.clone(),
            "updated_at": now,
        },
        "$setOnInsert": {
            "url": url,
            "metadata": empty_metadata(),
            "created_at": now,
        },
    }
}

pub(crate) fn completed_update(
    url: &str,
    ctx: &ProcessingContext,
    metadata: &MetadataBlock,
    now: DateTime,
) -> Result<Document, StoreError> {
    let payload = bson::to_document(metadata)
        .map_err(|err| StoreError::Document(format!("metadata block: {err}")))?;
    Ok(doc! {
        "$setOnInsert": {
            "url": url,
            "created_at": now,
        },
        "$set": {
            "status": ProcessingStatus::Completed.as_str(),
            "metadata": payload,
            "processing.attempt_number": ctx.attempt_number as i64,
            "processing.error_msg": Bson::Null,
            "processing.last_attempt_at": now,
            "processing.last_request_id": ctx.request_id.clone(),
            "updated_at": now,
        },
    })
}

pub(crate) fn failure_update(
    url: &str,
    ctx: &ProcessingContext,
    status: ProcessingStatus,
    error: &str,
    now: DateTime,
) -> Document {
    doc! {
        "$setOnInsert": {
            "url": url,
            "metadata": empty_metadata(),
            "created_at": now,
        },
        "$set": {
            "status": status.as_str(),
            "processing.error_msg": error,
            "processing.last_attempt_at": now,
            "processing.last_request_id": ctx.request_id.clone(),
            "processing.attempt_number": ctx.attempt_number as i64,
            "updated_at": now,
        },
    }
}

fn bson_to_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        _ => None,
    }
}

fn string_map(doc: Option<&Document>) -> BTreeMap<String, String> {
    let Some(doc) = doc else {
        return BTreeMap::new();
    };
    doc.iter()
        .filter_map(|(key, value)| match value {
            Bson::String(s) => Some((key.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

fn details_map(doc: Option<&Document>) -> Option<Map<String, Value>> {
    let doc = doc?;
    let mut map = Map::new();
    for (key, value) in doc.iter() {
        map.insert(key.clone(), value.clone().into_relaxed_extjson());
    }
    Some(map)
}

fn timestamp(doc: &Document, key: &str) -> chrono::DateTime<Utc> {
    doc.get_datetime(key).map(|dt| dt.to_chrono()).unwrap_or(chrono::DateTime::UNIX_EPOCH)
}

/// Map a stored document to the record shape, degrading missing fields to
/// their defaults.
pub(crate) fn record_from_document(doc: &Document) -> MetadataRecord {
    let metadata = doc.get_document("metadata").ok();
    let processing = doc.get_document("processing").ok();

    MetadataRecord {
        url: doc.get_str("url").unwrap_or_default().to_owned(),
        status: ProcessingStatus::parse(doc.get_str("status").unwrap_or_default()),
        metadata: MetadataBlock {
            headers: string_map(metadata.and_then(|m| m.get_document("headers").ok())),
            cookies: string_map(metadata.and_then(|m| m.get_document("cookies").ok())),
            page_source: metadata
                .and_then(|m| m.get_str("page_source").ok())
                .unwrap_or_default()
                .to_owned(),
            status_code: metadata
                .and_then(|m| m.get("status_code"))
                .and_then(bson_to_i64)
                .and_then(|n| u16::try_from(n).ok())
                .unwrap_or(0),
            final_url: metadata
                .and_then(|m| m.get_str("final_url").ok())
                .unwrap_or_default()
                .to_owned(),
            additional_details: details_map(
                metadata.and_then(|m| m.get_document("additional_details").ok()),
            ),
        },
        processing: ProcessingInfo {
            attempt_number: processing
                .and_then(|p| p.get("attempt_number"))
                .and_then(bson_to_i64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            error_msg: processing
                .and_then(|p| p.get_str("error_msg").ok())
                .map(str::to_owned),
            last_attempt_at: processing
                .map(|p| timestamp(p, "last_attempt_at"))
                .unwrap_or(chrono::DateTime::UNIX_EPOCH),
            last_request_id: processing
                .and_then(|p| p.get_str("last_request_id").ok())
                .unwrap_or_default()
                .to_owned(),
        },
        created_at: timestamp(doc, "created_at"),
        updated_at: timestamp(doc, "updated_at"),
    }
}
