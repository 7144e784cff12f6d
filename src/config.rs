//! Process-wide configuration (§6).
//!
//! Users construct [`EngineConfig`] manually or via [`EngineConfig::from_env`] — no
//! TOML/YAML parsing dependency is introduced, following the same philosophy the
//! donor crate states for its own configuration type: "no file parsing dependencies
//! are required".

use std::collections::HashMap;
use std::time::Duration;

/// Per-purpose cache TTLs (§3 CacheEntry, §6).
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub model: Duration,
    pub page: Duration,
    pub research: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            model: Duration::from_secs(24 * 3600),
            page: Duration::from_secs(24 * 3600),
            research: Duration::from_secs(6 * 3600),
        }
    }
}

/// Per-call-class deadlines (§5).
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub agent: Duration,
    pub research: Duration,
    pub webhook_ack: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            agent: Duration::from_secs(60),
            research: Duration::from_secs(120),
            webhook_ack: Duration::from_secs(1),
        }
    }
}

/// Global configuration for the orchestration engine.
///
/// This struct is intentionally flat and constructed however the embedder wants;
/// no config-file format is imposed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible model provider endpoint.
    pub llm_provider_base_url: String,
    /// Bearer credential for the model provider.
    pub llm_api_key: String,
    /// Per-agent model id overrides (falls back to the registry default when absent).
    pub model_ids: HashMap<String, String>,
    /// HMAC secret used to verify inbound webhook signatures.
    pub webhook_secret: String,
    /// Symmetric key used to issue/verify internal bearer tokens for agent-to-agent calls.
    pub internal_bearer_key: String,
    /// Opaque connection string for the `Store` backend.
    pub store_dsn: String,
    /// Opaque connection string for the `Queue` backend.
    pub queue_dsn: String,
    /// Global concurrent-LLM-call ceiling (C4).
    pub k_global: usize,
    /// Per-requester concurrent-LLM-call ceiling (C4).
    pub k_user: usize,
    /// Token bucket capacity, per model (C4).
    pub bucket_capacity: u32,
    /// Token bucket refill rate per second, per model (C4).
    pub bucket_refill: f64,
    /// Maximum inter-agent delegation depth (C8). Default 3.
    pub max_depth: u32,
    /// Default maximum sources for a research run (C7).
    pub research_max_sources: usize,
    /// Per-source character cap before summarisation (C7).
    pub per_source_char_cap: usize,
    /// Per-call-class deadlines.
    pub timeouts: Timeouts,
    /// Per-purpose cache TTLs.
    pub cache_ttls: CacheTtls,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_provider_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            model_ids: HashMap::new(),
            webhook_secret: String::new(),
            internal_bearer_key: String::new(),
            store_dsn: "memory://".to_string(),
            queue_dsn: "memory://".to_string(),
            k_global: 3,
            k_user: 2,
            bucket_capacity: 60,
            bucket_refill: 1.0,
            max_depth: 3,
            research_max_sources: 5,
            per_source_char_cap: 8000,
            timeouts: Timeouts::default(),
            cache_ttls: CacheTtls::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from process environment variables, falling back to
    /// [`EngineConfig::default`] for anything unset.
    ///
    /// Recognised variables: `LLM_PROVIDER_BASE_URL`, `LLM_API_KEY`,
    /// `WEBHOOK_SECRET`, `INTERNAL_BEARER_KEY`, `STORE_DSN`, `QUEUE_DSN`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LLM_PROVIDER_BASE_URL") {
            cfg.llm_provider_base_url = v;
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            cfg.llm_api_key = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_SECRET") {
            cfg.webhook_secret = v;
        }
        if let Ok(v) = std::env::var("INTERNAL_BEARER_KEY") {
            cfg.internal_bearer_key = v;
        }
        if let Ok(v) = std::env::var("STORE_DSN") {
            cfg.store_dsn = v;
        }
        if let Ok(v) = std::env::var("QUEUE_DSN") {
            cfg.queue_dsn = v;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.k_global, 3);
        assert_eq!(cfg.k_user, 2);
        assert_eq!(cfg.max_depth, 3);
        assert_eq!(cfg.research_max_sources, 5);
        assert_eq!(cfg.per_source_char_cap, 8000);
        assert_eq!(cfg.timeouts.agent, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.research, Duration::from_secs(120));
        assert_eq!(cfg.timeouts.webhook_ack, Duration::from_secs(1));
    }
}
