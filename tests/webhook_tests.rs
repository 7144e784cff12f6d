//! Black-box coverage of C10 (`WebhookIngress`) composed with the `Store`
//! and `Queue` it actually runs against — verifying the accepted delivery is
//! both audited and enqueued, not just that `ingest` returns `Ok`.

use agentmesh::queue::{InMemoryQueue, Queue};
use agentmesh::store::{InMemoryStore, Store};
use agentmesh::webhook::{IngestError, IngestOutcome, WebhookEndpoint, WebhookIngress};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("sha256={}", digest.iter().map(|b| format!("{:02x}", b)).collect::<String>())
}

#[tokio::test]
async fn accepted_booking_webhook_is_audited_and_enqueued_for_the_worker_pool() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let ingress = WebhookIngress::new(store.clone(), queue.clone(), "booking-secret".to_string());

    let body = br#"{"external_id":"booking-77","customer":"Jane Doe","slot":"2026-08-01T10:00:00Z"}"#;
    let header = sign("booking-secret", body);

    let outcome = ingress
        .ingest(WebhookEndpoint::Booking, &header, body, Default::default())
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Accepted);

    assert!(store
        .lookup_audit_entry("booking", "booking-77")
        .await
        .unwrap()
        .is_some());

    let job = queue.claim(Duration::from_millis(200)).await.unwrap();
    assert!(job.is_some());
}

#[tokio::test]
async fn replaying_the_same_delivery_does_not_enqueue_a_second_job() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let ingress = WebhookIngress::new(store.clone(), queue.clone(), "alert-secret".to_string());

    let body = br#"{"external_id":"alert-1","severity":"high"}"#;
    let header = sign("alert-secret", body);

    ingress.ingest(WebhookEndpoint::Alert, &header, body, Default::default()).await.unwrap();
    let first_job = queue.claim(Duration::from_millis(200)).await.unwrap();
    assert!(first_job.is_some());

    let replay = ingress
        .ingest(WebhookEndpoint::Alert, &header, body, Default::default())
        .await
        .unwrap();
    assert_eq!(replay, IngestOutcome::Duplicate);

    let second_job = queue.claim(Duration::from_millis(100)).await.unwrap();
    assert!(second_job.is_none());
}

#[tokio::test]
async fn wrong_secret_is_rejected_before_touching_the_store() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let ingress = WebhookIngress::new(store.clone(), queue.clone(), "real-secret".to_string());

    let body = br#"{"external_id":"scrape-9"}"#;
    let header = sign("wrong-secret", body);

    let err = ingress
        .ingest(WebhookEndpoint::Scrape, &header, body, Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, IngestError::BadSignature);
    assert!(store.lookup_audit_entry("scrape", "scrape-9").await.unwrap().is_none());
}
