//! Pipeline scenarios over the in-memory backends: ingress-published
//! messages driven through the processing service, with broker redelivery
//! simulated by re-wrapping nacked payloads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use packrat::{
    FetchError, FetchRequest, FetchResult, InMemoryMessage, InMemoryPublisher, InMemoryStore,
    MessageOutcome, MessagePublisher, MetadataStore, ProcessingService, ProcessingStatus,
    UrlFetcher,
};

struct ScriptedFetcher {
    script: Vec<Result<FetchResult, FetchError>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(script: Vec<Result<FetchResult, FetchError>>) -> Arc<Self> {
        Arc::new(Self { script, calls: AtomicUsize::new(0) })
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
        cookies: BTreeMap::new(),
        page_source: body.to_string(),
        status_code: 200,
        final_url: "https://example.com/final".to_string(),
        additional_details: None,
    }
}

/// Deliver one published message to the service, simulating the broker's
/// redelivery loop: as long as the handler nacks with requeue, wrap the same
/// payload in a fresh delivery. Returns the deliveries that took place.
async fn drive_until_settled(
    service: &ProcessingService,
    payload: &FetchRequest,
) -> Vec<MessageOutcome> {
    let mut outcomes = Vec::new();
    loop {
        let message = InMemoryMessage::new(payload.to_bytes().unwrap());
        service.process_message(&message).await.unwrap();
        let outcome = message.outcome().expect("every delivery must be settled");
        outcomes.push(outcome);
        if outcome != MessageOutcome::NackedRequeue {
            return outcomes;
        }
        assert!(outcomes.len() < 32, "redelivery loop did not converge");
    }
}

#[tokio::test]
async fn submitted_url_ends_completed_with_final_url() {
    let publisher = InMemoryPublisher::new();
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Ok(page("<html>hello</html>"))]);
    let service = ProcessingService::new(store.clone(), fetcher, 3);

    publisher.publish(&FetchRequest::new("https://example.com")).await.unwrap();
    let published = publisher.published();
    assert_eq!(published.len(), 1);

    let outcomes = drive_until_settled(&service, &published[0]).await;
    assert_eq!(outcomes, vec![MessageOutcome::Acked]);

    let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert!(!record.metadata.final_url.is_empty());
    assert_eq!(record.processing.last_request_id, published[0].request_id);
}

#[tokio::test]
async fn retry_exhaustion_settles_permanent_without_redelivery() {
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Err(FetchError::Request("connect reset".into()))]);
    let service = ProcessingService::new(store.clone(), fetcher.clone(), 2);

    let payload = FetchRequest::new("https://flaky.example");
    let outcomes = drive_until_settled(&service, &payload).await;

    // Two total attempts: first nacks for redelivery, second acks terminally.
    assert_eq!(outcomes, vec![MessageOutcome::NackedRequeue, MessageOutcome::Acked]);
    assert_eq!(fetcher.calls(), 2);

    let record = store.get_by_url("https://flaky.example").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::FailedPermanent);
    assert_eq!(record.processing.attempt_number, 2);
    assert!(record.processing.error_msg.as_deref().unwrap().contains("connect reset"));
}

#[tokio::test]
async fn flaky_url_recovers_on_redelivery() {
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![
        Err(FetchError::Timeout("read".into())),
        Err(FetchError::Timeout("read".into())),
        Ok(page("eventually")),
    ]);
    let service = ProcessingService::new(store.clone(), fetcher.clone(), 5);

    let payload = FetchRequest::new("https://slow.example");
    let outcomes = drive_until_settled(&service, &payload).await;

    assert_eq!(
        outcomes,
        vec![MessageOutcome::NackedRequeue, MessageOutcome::NackedRequeue, MessageOutcome::Acked]
    );
    let record = store.get_by_url("https://slow.example").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.metadata.page_source, "eventually");
    assert_eq!(record.processing.attempt_number, 2);
}

#[tokio::test]
async fn truncated_body_round_trips_through_the_store() {
    let store = Arc::new(InMemoryStore::new());
    let long_body = "x".repeat(1_000);
    let fetcher = ScriptedFetcher::new(vec![Ok(page(&long_body))]);
    let service =
        ProcessingService::new(store.clone(), fetcher, 3).with_max_page_source_length(300);

    let payload = FetchRequest::new("https://big.example");
    drive_until_settled(&service, &payload).await;

    let record = store.get_by_url("https://big.example").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert!(record.metadata.page_source.len() <= 300);
    let details = record.metadata.additional_details.expect("truncation details");
    assert_eq!(details["truncated"], serde_json::Value::Bool(true));
    assert_eq!(details["original_length"], serde_json::Value::from(1_000));
}

#[tokio::test]
async fn repeated_submissions_keep_one_record_per_url() {
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![Ok(page("v1"))]);
    let service = ProcessingService::new(store.clone(), fetcher, 3);

    for _ in 0..3 {
        let payload = FetchRequest::new("https://example.com");
        drive_until_settled(&service, &payload).await;
    }
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn each_submission_mints_a_distinct_request_id() {
    let publisher = InMemoryPublisher::new();
    for _ in 0..10 {
        publisher.publish(&FetchRequest::new("https://example.com")).await.unwrap();
    }
    let ids: std::collections::HashSet<String> =
        publisher.published().into_iter().map(|m| m.request_id).collect();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn later_submission_overwrites_a_terminal_record() {
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![
        Err(FetchError::Request("boom".into())),
        Ok(page("second time lucky")),
    ]);
    let service = ProcessingService::new(store.clone(), fetcher, 1);

    let first = FetchRequest::new("https://example.com");
    drive_until_settled(&service, &first).await;
    let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::FailedPermanent);

    // A fresh ingress submission for the same URL re-runs the pipeline and
    // the worker overwrites the terminal record.
    let second = FetchRequest::new("https://example.com");
    drive_until_settled(&service, &second).await;
    let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.processing.last_request_id, second.request_id);
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn attempt_number_never_decreases_across_transitions() {
    let store = Arc::new(InMemoryStore::new());
    let fetcher = ScriptedFetcher::new(vec![
        Err(FetchError::Timeout("t1".into())),
        Err(FetchError::Timeout("t2".into())),
        Err(FetchError::Timeout("t3".into())),
    ]);
    let service = ProcessingService::new(store.clone(), fetcher, 3);

    let payload = FetchRequest::new("https://example.com");
    let mut last_attempt = 0;
    loop {
        let message = InMemoryMessage::new(payload.to_bytes().unwrap());
        service.process_message(&message).await.unwrap();
        let record = store.get_by_url("https://example.com").await.unwrap().unwrap();
        assert!(record.processing.attempt_number >= last_attempt);
        last_attempt = record.processing.attempt_number;
        if message.outcome() != Some(MessageOutcome::NackedRequeue) {
            break;
        }
    }
    assert_eq!(last_attempt, 3);
}
