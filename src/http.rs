//! C12 HTTP surface (§6), gated behind the `server` feature. Grounded in the
//! donor's `AxumHttpAdapter::start`: an axum `Router` built once, bound with
//! `TcpListener`, and served with `axum::serve`. Unlike the donor's
//! per-route manual `Arc` cloning (written
//! before axum grew a typed `State` extractor), routes here share state via
//! `Router::with_state`, since that is how this version of axum is meant to
//! be used.
//!
//! Webhook handlers also exist as the plain async functions on
//! [`crate::webhook::WebhookIngress`] independent of this module, so they stay
//! unit-testable without standing up a server (§4.10 implementation note).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::task::{Task, TaskId};
use crate::webhook::{IngestError, IngestOutcome, WebhookEndpoint};

impl EngineError {
    /// §7's status-code mapping table.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::UnknownAgent(_) => StatusCode::BAD_REQUEST,
            EngineError::CycleDetected { .. } => StatusCode::BAD_REQUEST,
            EngineError::CycleExceeded { .. } => StatusCode::BAD_REQUEST,
            EngineError::Timeout => StatusCode::REQUEST_TIMEOUT,
            EngineError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::ProviderError(_) => StatusCode::BAD_GATEWAY,
            EngineError::BadResponse(_) => StatusCode::BAD_GATEWAY,
            EngineError::Network(_) => StatusCode::BAD_GATEWAY,
            EngineError::NoSources => StatusCode::BAD_GATEWAY,
            EngineError::Cancelled => StatusCode::CONFLICT,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IngestError {
    fn status_code(&self) -> StatusCode {
        match self {
            IngestError::BadSignature => StatusCode::UNAUTHORIZED,
            IngestError::MissingExternalId => StatusCode::BAD_REQUEST,
            IngestError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router named in §6: agent/research/multi-agent submission, task
/// read/cancel, conversation history, and the four webhook endpoints.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/agents/{agent_id}", post(submit_agent_task))
        .route("/research", post(submit_research))
        .route("/multi-agent", post(submit_multi_agent))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}", delete(cancel_task))
        .route("/conversations/{id}/messages", get(conversation_messages))
        .route("/webhook/mail", post(webhook_mail))
        .route("/webhook/scrape", post(webhook_scrape))
        .route("/webhook/booking", post(webhook_booking))
        .route("/webhook/alert", post(webhook_alert))
        .with_state(engine)
}

/// Bind `addr` and serve `router(engine)` until the process is signalled to
/// stop. Mirrors the donor's bind-then-`axum::serve` shape.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let _ = env_logger::Builder::from_default_env().try_init();
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {}", addr);
    axum::serve(listener, app).await
}

/// `context?:{conversation_id?}` (§6).
#[derive(Debug, Deserialize, Default)]
struct RequestContext {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitAgentRequest {
    requester_id: String,
    prompt: String,
    #[serde(default)]
    context: Option<RequestContext>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    id: String,
    state: String,
    output: Option<serde_json::Value>,
    error: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        TaskResponse {
            id: task.id.0,
            state: format!("{:?}", task.state).to_lowercase(),
            output: task.output,
            error: task.error,
        }
    }
}

/// Build the §6 `POST /agents/{agent_id}` / `POST /multi-agent` response:
/// `200 {task_id, output, used_model, delegations}` once `task` has gone
/// terminal within the fast-path deadline, else `202 {task_id}`.
fn fast_path_response(task: Task) -> axum::response::Response {
    if !task.state.is_terminal() {
        return (StatusCode::ACCEPTED, Json(json!({ "task_id": task.id.0 }))).into_response();
    }
    if task.state != crate::task::TaskState::Completed {
        return (
            StatusCode::OK,
            Json(json!({ "task_id": task.id.0, "error": task.error, "state": format!("{:?}", task.state).to_lowercase() })),
        )
            .into_response();
    }
    let out = task.output.unwrap_or(serde_json::Value::Null);
    let body = json!({
        "task_id": task.id.0,
        "output": out.get("text").cloned().unwrap_or(serde_json::Value::Null),
        "used_model": out.get("used_model").cloned().unwrap_or(serde_json::Value::Null),
        "delegations": out.get("delegations").cloned().unwrap_or_else(|| json!([])),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn submit_agent_task(
    State(engine): State<Arc<Engine>>,
    Path(agent_id): Path<String>,
    Json(body): Json<SubmitAgentRequest>,
) -> Result<axum::response::Response, EngineError> {
    let inputs = json!({ "prompt": body.prompt });
    let conversation_id = body.context.and_then(|c| c.conversation_id);
    let task = engine
        .orchestrator
        .submit(&body.requester_id, &agent_id, inputs, body.idempotency_key, conversation_id)
        .await?;
    let task = engine.orchestrator.await_terminal(&task.id, engine.config.timeouts.agent).await?;
    Ok(fast_path_response(task))
}

#[derive(Debug, Deserialize)]
struct SubmitResearchRequest {
    requester_id: String,
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    preferred_agent: Option<String>,
}

/// §6: `POST /research` returns the answer inline — there is no queued/202
/// variant in the external interface for this endpoint, only the research
/// timeout class (§5) bounding how long the wait can take.
async fn submit_research(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SubmitResearchRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let task = engine
        .orchestrator
        .research(&body.requester_id, &body.query, body.max_results, body.preferred_agent)
        .await?;
    let task = engine.orchestrator.await_terminal(&task.id, engine.config.timeouts.research).await?;
    match task.state {
        crate::task::TaskState::Completed => Ok(Json(task.output.unwrap_or(serde_json::Value::Null))),
        crate::task::TaskState::Failed => Err(EngineError::NoSources),
        crate::task::TaskState::Cancelled => Err(EngineError::Cancelled),
        _ => Err(EngineError::Timeout),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitMultiAgentRequest {
    requester_id: String,
    prompt: String,
    #[serde(default)]
    context: Option<RequestContext>,
}

async fn submit_multi_agent(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SubmitMultiAgentRequest>,
) -> Result<axum::response::Response, EngineError> {
    let conversation_id = body.context.and_then(|c| c.conversation_id);
    let task = engine
        .orchestrator
        .submit_multi(&body.requester_id, &body.prompt, conversation_id)
        .await?;
    let task = engine.orchestrator.await_terminal(&task.id, engine.config.timeouts.agent).await?;
    Ok(fast_path_response(task))
}

async fn get_task(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Result<Json<TaskResponse>, EngineError> {
    let task = engine.orchestrator.get(&TaskId(id)).await?;
    Ok(Json(task.into()))
}

async fn cancel_task(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    engine.orchestrator.cancel(&TaskId(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
struct ConversationMessageResponse {
    seq: u64,
    role: String,
    speaker: Option<String>,
    content: String,
}

async fn conversation_messages(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<ConversationMessageResponse>> {
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
    let messages = engine
        .memory
        .recent(&id, limit)
        .await
        .into_iter()
        .map(|m| ConversationMessageResponse {
            seq: m.seq,
            role: format!("{:?}", m.role).to_lowercase(),
            speaker: m.speaker,
            content: m.content,
        })
        .collect();
    Json(messages)
}

async fn webhook_mail(state: State<Arc<Engine>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    webhook_handler(state, WebhookEndpoint::Mail, headers, body).await
}

async fn webhook_scrape(state: State<Arc<Engine>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    webhook_handler(state, WebhookEndpoint::Scrape, headers, body).await
}

async fn webhook_booking(state: State<Arc<Engine>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    webhook_handler(state, WebhookEndpoint::Booking, headers, body).await
}

async fn webhook_alert(state: State<Arc<Engine>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    webhook_handler(state, WebhookEndpoint::Alert, headers, body).await
}

async fn webhook_handler(
    State(engine): State<Arc<Engine>>,
    endpoint: WebhookEndpoint,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    match engine.webhook_ingress.ingest(endpoint, &signature, &body, header_map).await {
        Ok(IngestOutcome::Accepted) => (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response(),
        Ok(IngestOutcome::Duplicate) => (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response(),
        Err(err) => err.into_response(),
    }
}
