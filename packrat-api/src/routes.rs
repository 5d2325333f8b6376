//! Accept and lookup endpoints.
//!
//! `POST /metadata` validates the URL and enqueues exactly one message.
//! `GET /metadata?url=U` translates the stored record into a response, and
//! behaves like the accept endpoint when no usable record exists. Handlers
//! never mutate the store; the worker owns every record transition.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

use packrat::{
    FetchRequest, MessagePublisher, MetadataRecord, ProcessingStatus, PublishError,
};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MetadataPostRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct MetadataLookupQuery {
    pub url: Option<String>,
}

/// 202 shape shared by accept and in-progress lookups.
#[derive(Debug, Serialize)]
pub struct MetadataAcceptedResponse {
    pub status: ProcessingStatus,
    pub url: String,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct MetadataPayload {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub status_code: u16,
    pub page_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_details: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct MetadataCompletedResponse {
    pub status: ProcessingStatus,
    pub url: String,
    pub metadata: MetadataPayload,
}

#[derive(Debug, Serialize)]
pub struct MetadataFailedResponse {
    pub status: ProcessingStatus,
    pub url: String,
    pub error_msg: Option<String>,
    pub attempt_number: u32,
}

/// Accept: validate, mint a request id, publish, 202.
pub async fn post_metadata(
    State(state): State<AppState>,
    Json(body): Json<MetadataPostRequest>,
) -> Response {
    if let Err(reason) = validate_submission_url(&body.url) {
        return (StatusCode::UNPROCESSABLE_ENTITY, reason).into_response();
    }
    enqueue(state.publisher.as_ref(), &body.url).await
}

/// Lookup: map the stored record, or enqueue when nothing usable is stored.
pub async fn get_metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataLookupQuery>,
) -> Response {
    let Some(url) = query.url.filter(|url| !url.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing url query parameter").into_response();
    };
    if let Err(reason) = validate_submission_url(&url) {
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }

    let record = match state.store.get_by_url(&url).await {
        Ok(record) => record,
        Err(err) => {
            warn!(event = "lookup_store_unavailable", url = %url, error = %err);
            return (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable").into_response();
        }
    };

    match record.and_then(|record| response_for_record(record, &url)) {
        Some(response) => response,
        // Absent record, or a status this reader does not recognize:
        // behave exactly like the accept endpoint.
        None => enqueue(state.publisher.as_ref(), &url).await,
    }
}

/// The accept path shared by POST and the lookup miss.
async fn enqueue(publisher: &dyn MessagePublisher, url: &str) -> Response {
    if !publisher.ready() {
        warn!(event = "publish_rejected", reason = "publisher_not_ready", url = %url);
        return (StatusCode::SERVICE_UNAVAILABLE, "Publisher not ready").into_response();
    }

    let request = FetchRequest::new(url);
    match publisher.publish(&request).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(MetadataAcceptedResponse {
                status: ProcessingStatus::Queued,
                url: request.url,
                request_id: request.request_id,
            }),
        )
            .into_response(),
        Err(err) => {
            warn!(
                event = "publish_failed",
                url = %url,
                request_id = %request.request_id,
                reason = %err,
            );
            let body = if err.is_queue_rejected() {
                "Queue rejected"
            } else if matches!(err, PublishError::NotReady) {
                "Publisher not ready"
            } else {
                "Publish failed"
            };
            (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
        }
    }
}

/// A submission must be an absolute http(s) URL with a non-empty authority.
pub fn validate_submission_url(raw: &str) -> Result<(), &'static str> {
    let parsed = Url::parse(raw).map_err(|_| "url must be an absolute http(s) URL")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("url scheme must be http or https");
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("url must have a non-empty host");
    }
    Ok(())
}

/// Map a persisted record to a response; `None` means the caller should
/// fall back to enqueueing (status unknown to this reader).
fn response_for_record(record: MetadataRecord, requested_url: &str) -> Option<Response> {
    let url = if record.url.is_empty() { requested_url.to_owned() } else { record.url.clone() };

    if record.status == ProcessingStatus::Completed {
        return Some(
            (
                StatusCode::OK,
                Json(MetadataCompletedResponse {
                    status: ProcessingStatus::Completed,
                    url,
                    metadata: MetadataPayload {
                        headers: record.metadata.headers,
                        cookies: record.metadata.cookies,
                        status_code: record.metadata.status_code,
                        page_source: record.metadata.page_source,
                        additional_details: record.metadata.additional_details,
                    },
                }),
            )
                .into_response(),
        );
    }

    if record.status == ProcessingStatus::FailedPermanent {
        return Some(
            (
                StatusCode::OK,
                Json(MetadataFailedResponse {
                    status: ProcessingStatus::FailedPermanent,
                    url,
                    error_msg: record.processing.error_msg,
                    attempt_number: record.processing.attempt_number,
                }),
            )
                .into_response(),
        );
    }

    if record.status.is_in_flight() {
        // PENDING, QUEUED and FAILED_RETRYABLE all read as "in progress";
        // re-enqueueing here would double-publish a URL the worker still owns.
        return Some(
            (
                StatusCode::ACCEPTED,
                Json(MetadataAcceptedResponse {
                    status: ProcessingStatus::InProgress,
                    url,
                    request_id: record.processing.last_request_id,
                }),
            )
                .into_response(),
        );
    }

    None
}
