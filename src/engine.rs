//! C12 — `Engine`: process-wide wiring, constructed once and cloned (cheaply,
//! by `Arc`) into every worker and handler.
//!
//! Grounded in §9's redesign flag "model singletons as an explicit `Engine`
//! context": no global (`lazy_static`, `once_cell`, or otherwise) holds cache
//! or limiter state here. `Engine` builds and owns its own `reqwest::Client`
//! rather than reaching for a process-wide one, so the whole context is
//! constructible more than once (tests build many).

use std::sync::Arc;

use crate::agent_registry::AgentRegistry;
use crate::agent_runner::AgentRunner;
use crate::cache::Cache;
use crate::cancel::CancelRegistry;
use crate::config::EngineConfig;
use crate::limiter::Limiter;
use crate::memory_log::MemoryLog;
use crate::model_client::{HttpModelProvider, ModelClient, ModelProvider};
use crate::orchestrator::Orchestrator;
use crate::queue::Queue;
use crate::researcher::{Researcher, SearchProvider};
use crate::signer::Signer;
use crate::store::Store;
use crate::webhook::WebhookIngress;
use crate::worker_pool::WorkerPool;

/// Bundled `Arc`s to every shared component, built once in
/// [`Engine::start`]/[`Engine::new`] and handed out to workers and HTTP
/// handlers alike.
pub struct Engine {
    pub config: EngineConfig,
    pub cache: Arc<Cache>,
    pub limiter: Arc<Limiter>,
    pub memory: Arc<MemoryLog>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
    pub registry: Arc<AgentRegistry>,
    pub model: Arc<ModelClient>,
    pub researcher: Arc<Researcher>,
    pub agent_runner: Arc<AgentRunner>,
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_ingress: Arc<WebhookIngress>,
    pub cancel_registry: Arc<CancelRegistry>,
    worker_pool: Arc<WorkerPool>,
}

impl Engine {
    /// Wire every component from `config` plus the caller-supplied `Store`,
    /// `Queue`, `ModelProvider`, and `SearchProvider` — the four seams the
    /// spec keeps abstract (§6). `model_ids` overrides are read from
    /// `config.model_ids` via [`AgentRegistry::default_registry`].
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        model_provider: Arc<dyn ModelProvider>,
        search_provider: Arc<dyn SearchProvider>,
    ) -> Self {
        let cache = Arc::new(Cache::new());
        let limiter = Arc::new(Limiter::new(
            config.k_global,
            config.k_user,
            config.bucket_capacity,
            config.bucket_refill,
        ));
        let memory = Arc::new(MemoryLog::new());
        let registry = Arc::new(AgentRegistry::default_registry(&config.model_ids));
        let cancel_registry = Arc::new(CancelRegistry::new());

        let model = Arc::new(ModelClient::new(
            model_provider,
            cache.clone(),
            limiter.clone(),
            config.cache_ttls.model,
        ));

        let researcher = Arc::new(Researcher::new(
            reqwest::Client::new(),
            search_provider,
            model.clone(),
            cache.clone(),
            limiter.clone(),
            config.per_source_char_cap,
            config.cache_ttls.page,
            config.cache_ttls.research,
        ));

        let agent_runner = Arc::new(AgentRunner::new(
            registry.clone(),
            model.clone(),
            memory.clone(),
            store.clone(),
            config.max_depth,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            cancel_registry.clone(),
            config.research_max_sources,
        ));

        let webhook_ingress = Arc::new(WebhookIngress::new(store.clone(), queue.clone(), config.webhook_secret.clone()));

        let worker_pool = Arc::new(WorkerPool::new(
            queue.clone(),
            store.clone(),
            agent_runner.clone(),
            researcher.clone(),
            cancel_registry.clone(),
        ));

        Engine {
            config,
            cache,
            limiter,
            memory,
            store,
            queue,
            registry,
            model,
            researcher,
            agent_runner,
            orchestrator,
            webhook_ingress,
            cancel_registry,
            worker_pool,
        }
    }

    /// Convenience constructor for a fully in-process engine (`InMemoryStore` +
    /// `InMemoryQueue` + an `HttpModelProvider` against `config`'s provider
    /// settings) — the shape most tests and the `server`-feature binary want.
    pub fn in_process(config: EngineConfig, search_provider: Arc<dyn SearchProvider>) -> Self {
        let store: Arc<dyn Store> = Arc::new(crate::store::InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(crate::queue::InMemoryQueue::new());
        let provider: Arc<dyn ModelProvider> = Arc::new(HttpModelProvider::new(
            reqwest::Client::new(),
            config.llm_provider_base_url.clone(),
            config.llm_api_key.clone(),
        ));
        Engine::new(config, store, queue, provider, search_provider)
    }

    /// Start the worker pool's background loops (§4.11/§4.12 startup).
    /// Returns their join handles; the caller is responsible for awaiting them
    /// as part of graceful shutdown.
    pub fn start_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.worker_pool.spawn()
    }

    /// Issue a short-lived internal bearer token identifying `issuer` to
    /// `audience`, for agent-to-agent or worker-to-provider calls that need
    /// one (C2).
    pub fn issue_internal_bearer(&self, issuer: &str, audience: &str, ttl_secs: i64) -> String {
        Signer::issue_internal_bearer(&self.config.internal_bearer_key, issuer, audience, ttl_secs)
    }

    /// Known agent ids, for surfacing to callers (e.g. an HTTP 404 body
    /// listing valid agent ids).
    pub fn agent_ids(&self) -> Vec<String> {
        self.registry.ids().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model_client::{CompletionRequest, CompletionResponse, TokenUsage};
    use crate::researcher::SearchResult;
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EngineError> {
            Ok(CompletionResponse {
                text: format!("echo: {}", request.messages.last().map(|m| m.content.as_str()).unwrap_or("")),
                usage: TokenUsage::default(),
            })
        }
    }

    struct NullSearch;

    #[async_trait]
    impl SearchProvider for NullSearch {
        async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchResult>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn test_engine() -> Engine {
        let config = EngineConfig {
            webhook_secret: "topsecret".to_string(),
            ..EngineConfig::default()
        };
        let store: Arc<dyn Store> = Arc::new(crate::store::InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(crate::queue::InMemoryQueue::new());
        Engine::new(config, store, queue, Arc::new(EchoProvider), Arc::new(NullSearch))
    }

    #[tokio::test]
    async fn submit_through_orchestrator_and_process_through_worker_pool() {
        let engine = test_engine();
        let task = engine
            .orchestrator
            .submit("u1", "finance_manager", serde_json::json!({"prompt": "burn rate?"}), None, None)
            .await
            .unwrap();

        let job = engine.queue.claim(std::time::Duration::from_millis(200)).await.unwrap().unwrap();
        engine.worker_pool.process_one(job).await;

        let completed = engine.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(completed.state, crate::task::TaskState::Completed);
    }

    #[test]
    fn agent_ids_includes_the_closed_set() {
        let engine = test_engine();
        let ids = engine.agent_ids();
        assert!(ids.iter().any(|id| id == "engineer"));
        assert!(ids.iter().any(|id| id == "assistant"));
    }

    #[test]
    fn issue_internal_bearer_round_trips_through_signer() {
        let mut config = EngineConfig::default();
        config.internal_bearer_key = "k".to_string();
        let store: Arc<dyn Store> = Arc::new(crate::store::InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(crate::queue::InMemoryQueue::new());
        let engine = Engine::new(config, store, queue, Arc::new(EchoProvider), Arc::new(NullSearch));

        let token = engine.issue_internal_bearer("orchestrator", "engineer", 10);
        let claims = Signer::verify_internal_bearer("k", &token, "engineer").unwrap();
        assert_eq!(claims.audience, "engineer");
    }
}
