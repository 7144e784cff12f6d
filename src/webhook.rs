//! C10 — `WebhookIngress`: signature verification, dedup, and a thin
//! accept/reject decision for inbound webhook deliveries. Ingress never does
//! the substantive follow-up work itself (fetching a full mail body, parsing a
//! scrape result, creating a booking/triage task) — it only verifies, dedups,
//! and enqueues a [`crate::queue::JobKind::WebhookFollowUp`] for the
//! `WorkerPool` (C11) to pick up, so the HTTP handler returns fast under a
//! hard ~1s deadline (§4.6 `timeouts.webhook_ack`).

use std::sync::Arc;

use chrono::Utc;

use crate::queue::{Job, JobKind, Queue};
use crate::signer::Signer;
use crate::store::Store;
use crate::task::WebhookAuditEntry;

/// Hard cap on an accepted webhook body (§4.10 step 3).
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// The four endpoints named in §6's closed webhook set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEndpoint {
    Mail,
    Scrape,
    Booking,
    Alert,
}

impl WebhookEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEndpoint::Mail => "mail",
            WebhookEndpoint::Scrape => "scrape",
            WebhookEndpoint::Booking => "booking",
            WebhookEndpoint::Alert => "alert",
        }
    }
}

/// Outcome of an ingest attempt, carrying enough to map directly to an HTTP
/// status code at the `server`-feature boundary without re-deriving it there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 200. A new delivery; a follow-up job was enqueued.
    Accepted,
    /// 200. Already seen this `(endpoint, external_id)` before; no new job enqueued.
    Duplicate,
}

/// Reasons an ingest attempt is rejected, one-to-one with the status codes
/// named in §4.10 step 1/2/3/5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// 401 — signature missing, malformed, or did not verify.
    BadSignature,
    /// 400 — body lacked a usable `external_id`.
    MissingExternalId,
    /// 413 — body exceeded [`MAX_BODY_BYTES`].
    TooLarge,
    /// 503 — the delivery was verified and deduped but the queue rejected enqueue.
    QueueUnavailable,
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::BadSignature => write!(f, "webhook signature invalid"),
            IngestError::MissingExternalId => write!(f, "webhook body missing external_id"),
            IngestError::TooLarge => write!(f, "webhook body exceeds size limit"),
            IngestError::QueueUnavailable => write!(f, "webhook follow-up queue unavailable"),
        }
    }
}

impl std::error::Error for IngestError {}

/// Signature verification, dedup, and enqueue for inbound webhook deliveries (§4.10).
pub struct WebhookIngress {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    secret: String,
}

impl WebhookIngress {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, secret: String) -> Self {
        WebhookIngress { store, queue, secret }
    }

    /// §4.10 steps 1-6. `signature_header` is the raw `X-Signature` (or
    /// equivalent) header value; `body` is the exact raw bytes the signature
    /// was computed over — callers must not re-serialise before calling this.
    pub async fn ingest(
        &self,
        endpoint: WebhookEndpoint,
        signature_header: &str,
        body: &[u8],
        headers: std::collections::HashMap<String, String>,
    ) -> Result<IngestOutcome, IngestError> {
        if body.len() > MAX_BODY_BYTES {
            return Err(IngestError::TooLarge);
        }

        let signature_valid = Signer::verify_webhook(body, signature_header, &self.secret);
        if !signature_valid {
            return Err(IngestError::BadSignature);
        }

        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
        let external_id = parsed
            .get("external_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or(IngestError::MissingExternalId)?;

        let existing = self
            .store
            .lookup_audit_entry(endpoint.as_str(), &external_id)
            .await
            .map_err(|_| IngestError::QueueUnavailable)?;
        if existing.is_some() {
            return Ok(IngestOutcome::Duplicate);
        }

        self.store
            .insert_audit_entry(WebhookAuditEntry {
                endpoint: endpoint.as_str().to_string(),
                external_id: external_id.clone(),
                headers,
                received_at: Utc::now(),
                signature_valid: true,
            })
            .await
            .map_err(|_| IngestError::QueueUnavailable)?;

        let job = Job::new(JobKind::WebhookFollowUp {
            endpoint: endpoint.as_str().to_string(),
            external_id,
            body: parsed,
        });
        self.queue.enqueue(job).await.map_err(|_| IngestError::QueueUnavailable)?;

        Ok(IngestOutcome::Accepted)
    }
}
