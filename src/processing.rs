//! Processing service: drives one delivered message through the record
//! lifecycle — ensure, mark in-progress, fetch, persist, acknowledge.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{FetchError, ProcessingError};
use crate::message::IncomingFetchRequest;
use crate::ports::{IncomingMessage, MetadataStore, UrlFetcher};
use crate::record::{FetchResult, MetadataBlock, ProcessingContext};
use crate::status::ProcessingStatus;

/// Default cap on stored page source, in bytes.
pub const MAX_PAGE_SOURCE_LENGTH: i64 = 1_000_000;

/// Orchestrates message → fetch → persist → ack/nack.
///
/// `max_retries` counts TOTAL fetch attempts for a URL across broker
/// redeliveries, not retries beyond the first: with `max_retries = N`,
/// attempts `1..=N` run and the Nth failure is marked permanent and acked.
pub struct ProcessingService {
    store: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn UrlFetcher>,
    max_retries: u32,
    max_page_source_length: i64,
}

impl ProcessingService {
    pub fn new(store: Arc<dyn MetadataStore>, fetcher: Arc<dyn UrlFetcher>, max_retries: u32) -> Self {
        Self { store, fetcher, max_retries, max_page_source_length: MAX_PAGE_SOURCE_LENGTH }
    }

    /// Override the page-source cap. Zero or negative disables truncation.
    pub fn with_max_page_source_length(mut self, max: i64) -> Self {
        self.max_page_source_length = max;
        self
    }

    /// Handle one delivery end to end.
    ///
    /// A malformed body returns an error WITHOUT touching the message; the
    /// caller applies the poison-message policy (reject, no requeue). Fetch
    /// failures are absorbed here into the retry state machine; only store
    /// and acknowledgement faults propagate.
    pub async fn process_message(
        &self,
        message: &dyn IncomingMessage,
    ) -> Result<(), ProcessingError> {
        let incoming = IncomingFetchRequest::decode(message.body())?;
        let url = incoming.url;
        let ctx = ProcessingContext::new(incoming.request_id);
        info!(event = "message_received", url = %url, request_id = %ctx.request_id);

        self.store.ensure_record(&url, &ctx).await?;
        let ctx = ctx.with_attempt(self.stored_attempt_number(&url).await?);
        self.store.mark_in_progress(&url, &ctx).await?;
        info!(event = "message_in_progress", url = %url, request_id = %ctx.request_id);

        match self.fetcher.fetch(&url).await {
            Ok(result) => {
                let result = self.truncate_page_source(result);
                self.store.mark_completed(&url, &ctx, &MetadataBlock::from(result)).await?;
                message.ack().await?;
                let (status, attempt_number) = self.final_state(&url).await;
                info!(
                    event = "metadata_persisted",
                    url = %url,
                    request_id = %ctx.request_id,
                    status = %status,
                    attempt_number,
                );
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.handle_retryable_failure(message, &url, &ctx, &err).await
            }
            Err(err) => {
                let error_text = err.to_string();
                self.store.mark_permanent_failure(&url, &ctx, &error_text).await?;
                let (status, attempt_number) = self.final_state(&url).await;
                message.ack().await?;
                info!(
                    event = "metadata_permanent_failure",
                    url = %url,
                    request_id = %ctx.request_id,
                    status = %status,
                    attempt_number,
                    error = %error_text,
                );
                Ok(())
            }
        }
    }

    async fn handle_retryable_failure(
        &self,
        message: &dyn IncomingMessage,
        url: &str,
        ctx: &ProcessingContext,
        err: &FetchError,
    ) -> Result<(), ProcessingError> {
        let error_text = err.to_string();
        let next_attempt = ctx.attempt_number + 1;
        let ctx_next = ctx.with_attempt(next_attempt);
        self.store.mark_retryable_failure(url, &ctx_next, &error_text).await?;

        if next_attempt >= self.max_retries {
            self.store.mark_permanent_failure(url, &ctx_next, &error_text).await?;
            let (status, _) = self.final_state(url).await;
            message.ack().await?;
            info!(
                event = "metadata_permanent_failure",
                url = %url,
                request_id = %ctx.request_id,
                attempt_number = next_attempt,
                status = %status,
                error = %error_text,
            );
            return Ok(());
        }

        let (status, _) = self.final_state(url).await;
        message.nack_requeue().await?;
        info!(
            event = "metadata_retryable_failure",
            url = %url,
            request_id = %ctx.request_id,
            attempt_number = next_attempt,
            status = %status,
            error = %error_text,
        );
        Ok(())
    }

    async fn stored_attempt_number(&self, url: &str) -> Result<u32, ProcessingError> {
        let record = self.store.get_by_url(url).await?;
        Ok(record.map(|r| r.processing.attempt_number).unwrap_or(0))
    }

    /// Cap `page_source` at the configured byte length, cutting at the
    /// nearest char boundary at or below the cap. The enriched
    /// `additional_details` is a fresh map; caller data is not mutated.
    fn truncate_page_source(&self, result: FetchResult) -> FetchResult {
        if self.max_page_source_length <= 0 {
            return result;
        }
        let cap = self.max_page_source_length as usize;
        if result.page_source.len() <= cap {
            return result;
        }

        let FetchResult { headers, cookies, mut page_source, status_code, final_url, additional_details } =
            result;
        let original_length = page_source.len();
        let mut cut = cap;
        while cut > 0 && !page_source.is_char_boundary(cut) {
            cut -= 1;
        }
        page_source.truncate(cut);

        let mut details: Map<String, Value> = additional_details.unwrap_or_default();
        details.insert("truncated".into(), Value::Bool(true));
        details.insert("original_length".into(), Value::from(original_length));

        FetchResult {
            headers,
            cookies,
            page_source,
            status_code,
            final_url,
            additional_details: Some(details),
        }
    }

    /// Best-effort read-back for the closing log line; never fails the
    /// message over a logging read.
    async fn final_state(&self, url: &str) -> (ProcessingStatus, u32) {
        match self.store.get_by_url(url).await {
            Ok(Some(record)) => (record.status, record.processing.attempt_number),
            Ok(None) => (ProcessingStatus::Unknown, 0),
            Err(err) => {
                warn!(event = "final_state_read_failed", url = %url, error = %err);
                (ProcessingStatus::Unknown, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::inmemory::{InMemoryMessage, InMemoryStore, MessageOutcome};
    use crate::message::FetchRequest;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        script: Vec<Result<FetchResult, FetchError>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchResult, FetchError>>) -> Arc<Self> {
            Arc::new(Self { script, calls: AtomicUsize::new(0) })
        }

        fn always(outcome: Result<FetchResult, FetchError>) -> Arc<Self> {
            Self::new(vec![outcome])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UrlFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchResult, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.script[n.min(self.script.len() - 1)].clone()
        }

        async fn close(&self) {}
    }

    fn page(body: &str) -> FetchResult {
        FetchResult {
            headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
            cookies: BTreeMap::from([("sid".to_string(), "1".to_string())]),
            page_source: body.to_string(),
            status_code: 200,
            final_url: "https://example.com/landed".to_string(),
            additional_details: None,
        }
    }

    fn delivery(url: &str) -> InMemoryMessage {
        InMemoryMessage::new(FetchRequest::new(url).to_bytes().unwrap())
    }

    #[tokio::test]
    async fn successful_fetch_completes_and_acks() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Ok(page("<html/>")));
        let service = ProcessingService::new(store.clone(), fetcher, 3);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        assert_eq!(message.outcome(), Some(MessageOutcome::Acked));
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.metadata.final_url, "https://example.com/landed");
        assert_eq!(record.metadata.page_source, "<html/>");
        assert!(record.metadata.additional_details.is_none());
    }

    #[tokio::test]
    async fn malformed_body_errors_without_touching_the_message() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Ok(page("x")));
        let service = ProcessingService::new(store.clone(), fetcher.clone(), 3);

        let message = InMemoryMessage::new(b"{\"request_id\":\"only\"}".to_vec());
        let err = service.process_message(&message).await.unwrap_err();

        assert!(matches!(err, ProcessingError::Malformed(_)));
        assert_eq!(message.outcome(), None);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_below_budget_nacks_for_redelivery() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Err(FetchError::Timeout("read".into())));
        let service = ProcessingService::new(store.clone(), fetcher, 3);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        assert_eq!(message.outcome(), Some(MessageOutcome::NackedRequeue));
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::FailedRetryable);
        assert_eq!(record.processing.attempt_number, 1);
        assert!(record.processing.error_msg.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn attempt_budget_exhaustion_goes_permanent_and_acks() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Err(FetchError::Request("boom".into())));
        let service = ProcessingService::new(store.clone(), fetcher, 2);

        // Two deliveries: the first nacks, the second exhausts the budget.
        let first = delivery("https://example.com");
        service.process_message(&first).await.unwrap();
        assert_eq!(first.outcome(), Some(MessageOutcome::NackedRequeue));

        let second = delivery("https://example.com");
        service.process_message(&second).await.unwrap();
        assert_eq!(second.outcome(), Some(MessageOutcome::Acked));

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::FailedPermanent);
        assert_eq!(record.processing.attempt_number, 2);
    }

    #[tokio::test]
    async fn single_attempt_budget_is_permanent_on_first_failure() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Err(FetchError::Timeout("connect".into())));
        let service = ProcessingService::new(store.clone(), fetcher, 1);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        assert_eq!(message.outcome(), Some(MessageOutcome::Acked));
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::FailedPermanent);
        assert_eq!(record.processing.attempt_number, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_permanent_without_bumping_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::always(Err(FetchError::InvalidUrl("bad".into())));
        let service = ProcessingService::new(store.clone(), fetcher, 5);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        assert_eq!(message.outcome(), Some(MessageOutcome::Acked));
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::FailedPermanent);
        assert_eq!(record.processing.attempt_number, 0);
    }

    #[tokio::test]
    async fn recovery_after_retryable_failure_completes() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Request("flaky".into())),
            Ok(page("<html>ok</html>")),
        ]);
        let service = ProcessingService::new(store.clone(), fetcher, 3);

        let first = delivery("https://example.com");
        service.process_message(&first).await.unwrap();
        let second = delivery("https://example.com");
        service.process_message(&second).await.unwrap();

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        // The recovered attempt ran with the bumped attempt number read back
        // from the store.
        assert_eq!(record.processing.attempt_number, 1);
    }

    #[tokio::test]
    async fn long_bodies_are_truncated_with_details() {
        let store = Arc::new(InMemoryStore::new());
        let body = "a".repeat(500);
        let fetcher = ScriptedFetcher::always(Ok(page(&body)));
        let service =
            ProcessingService::new(store.clone(), fetcher, 3).with_max_page_source_length(300);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.metadata.page_source.len(), 300);
        let details = record.metadata.additional_details.unwrap();
        assert_eq!(details["truncated"], serde_json::Value::Bool(true));
        assert_eq!(details["original_length"], serde_json::Value::from(500));
    }

    #[tokio::test]
    async fn truncation_respects_char_boundaries() {
        let store = Arc::new(InMemoryStore::new());
        // Each 'é' is two bytes; a 5-byte cap lands mid-char.
        let fetcher = ScriptedFetcher::always(Ok(page(&"é".repeat(10))));
        let service =
            ProcessingService::new(store.clone(), fetcher, 3).with_max_page_source_length(5);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.metadata.page_source, "éé");
        assert_eq!(record.metadata.page_source.len(), 4);
    }

    #[tokio::test]
    async fn non_positive_cap_disables_truncation() {
        let store = Arc::new(InMemoryStore::new());
        let body = "b".repeat(2048);
        let fetcher = ScriptedFetcher::always(Ok(page(&body)));
        let service =
            ProcessingService::new(store.clone(), fetcher, 3).with_max_page_source_length(0);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.metadata.page_source.len(), 2048);
        assert!(record.metadata.additional_details.is_none());
    }

    #[tokio::test]
    async fn body_exactly_at_cap_is_not_marked_truncated() {
        let store = Arc::new(InMemoryStore::new());
        let body = "c".repeat(300);
        let fetcher = ScriptedFetcher::always(Ok(page(&body)));
        let service =
            ProcessingService::new(store.clone(), fetcher, 3).with_max_page_source_length(300);

        let message = delivery("https://example.com");
        service.process_message(&message).await.unwrap();

        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert_eq!(record.metadata.page_source.len(), 300);
        assert!(record.metadata.additional_details.is_none());
    }

    #[tokio::test]
    async fn store_failure_propagates_without_ack() {
        struct DownStore;

        #[async_trait]
        impl MetadataStore for DownStore {
            async fn ensure_record(
                &self,
                _url: &str,
                _ctx: &ProcessingContext,
            ) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn mark_in_progress(
                &self,
                _url: &str,
                _ctx: &ProcessingContext,
            ) -> Result<(), StoreError> {
                unreachable!("ensure_record fails first")
            }
            async fn mark_completed(
                &self,
                _url: &str,
                _ctx: &ProcessingContext,
                _metadata: &MetadataBlock,
            ) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn mark_retryable_failure(
                &self,
                _url: &str,
                _ctx: &ProcessingContext,
                _error: &str,
            ) -> Result<u32, StoreError> {
                unreachable!()
            }
            async fn mark_permanent_failure(
                &self,
                _url: &str,
                _ctx: &ProcessingContext,
                _error: &str,
            ) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn get_by_url(&self, _url: &str) -> Result<Option<crate::record::MetadataRecord>, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn ping(&self) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn close(&self) {}
        }

        let fetcher = ScriptedFetcher::always(Ok(page("x")));
        let service = ProcessingService::new(Arc::new(DownStore), fetcher, 3);

        let message = delivery("https://example.com");
        let err = service.process_message(&message).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Store(_)));
        assert_eq!(message.outcome(), None);
    }
}
