//! C7 — `Researcher`: search → polite fetch → per-source reduce → cited
//! synthesis.
//!
//! Politeness (domain backoff, `robots.txt` respect, a bounded per-fetch
//! timeout) is grounded in the donor's `tools/http_client.rs`, which already
//! documents domain allowlist/blocklist handling, timeout controls, and response
//! size limits for agent-initiated HTTP calls; this module generalises that
//! single-call discipline into a multi-source pipeline gated through C4's
//! `Limiter` rather than per-call options.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::limiter::Limiter;
use crate::model_client::{ChatMessage, CompletionRequest, ModelClient};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const ROBOTS_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Pluggable web search backend; the engine core never hardcodes a vendor.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, EngineError>;
}

/// A source that was successfully fetched and summarised, ready to be cited.
#[derive(Debug, Clone)]
pub struct CitedSource {
    pub index: usize,
    pub url: String,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct ResearchResult {
    pub answer: String,
    pub sources: Vec<CitedSource>,
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.strip_prefix("www.").unwrap_or(without_scheme).to_lowercase()
}

fn domain_of(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

fn scheme_of(url: &str) -> &'static str {
    if url.starts_with("http://") {
        "http"
    } else {
        "https"
    }
}

fn path_of(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match without_scheme.find('/') {
        Some(i) => without_scheme[i..].to_string(),
        None => "/".to_string(),
    }
}

/// Disallow prefixes for user-agent `*` (§4.4: "`robots.txt` disallow is a hard
/// block"). This crate only honours the `*` group — agent-specific groups in a
/// real `robots.txt` are out of scope for a research crawler with no identity
/// to target.
fn parse_robots_disallow(body: &str) -> Vec<String> {
    let mut disallow = Vec::new();
    let mut in_wildcard_group = false;
    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else { continue };
        let field = field.trim().to_lowercase();
        let value = value.trim();
        match field.as_str() {
            "user-agent" => in_wildcard_group = value == "*",
            "disallow" if in_wildcard_group && !value.is_empty() => disallow.push(value.to_string()),
            _ => {}
        }
    }
    disallow
}

fn path_is_disallowed(path: &str, disallow: &[String]) -> bool {
    disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Heuristic tag-stripping to get plain text out of an HTML response without a
/// full HTML parser dependency: the research pipeline only needs running text
/// for the summarisation call, not a DOM.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Search → fetch → reduce → synthesise pipeline (§4.7).
pub struct Researcher {
    http: reqwest::Client,
    search: Arc<dyn SearchProvider>,
    model: Arc<ModelClient>,
    cache: Arc<Cache>,
    limiter: Arc<Limiter>,
    per_source_char_cap: usize,
    search_cache_ttl: Duration,
    research_cache_ttl: Duration,
}

impl Researcher {
    pub fn new(
        http: reqwest::Client,
        search: Arc<dyn SearchProvider>,
        model: Arc<ModelClient>,
        cache: Arc<Cache>,
        limiter: Arc<Limiter>,
        per_source_char_cap: usize,
        search_cache_ttl: Duration,
        research_cache_ttl: Duration,
    ) -> Self {
        Researcher {
            http,
            search,
            model,
            cache,
            limiter,
            per_source_char_cap,
            search_cache_ttl,
            research_cache_ttl,
        }
    }

    /// Run the full pipeline for `query`, citing up to `max_sources` distinct
    /// domains. Tolerates partial source failure; fails only if every source
    /// errors (§4.7 edge case, §7 `NoSources`).
    pub async fn research(
        &self,
        requester_id: &str,
        query: &str,
        max_sources: usize,
        mut cancel: CancelToken,
    ) -> Result<ResearchResult, EngineError> {
        let search_key = format!("{}:{}", query, max_sources);
        let cached_search = self
            .cache
            .get_or_produce("search", &search_key, self.search_cache_ttl, || async {
                let results = self.search.search(query, max_sources).await?;
                serde_json::to_value(&results.iter().map(|r| (r.url.clone(), r.title.clone(), r.snippet.clone())).collect::<Vec<_>>())
                    .map_err(|e| EngineError::Internal(e.to_string()))
            })
            .await?;

        let raw: Vec<(String, String, String)> =
            serde_json::from_value(cached_search).map_err(|e| EngineError::Internal(e.to_string()))?;
        let results: Vec<SearchResult> = raw
            .into_iter()
            .map(|(url, title, snippet)| SearchResult { url, title, snippet })
            .collect();

        let mut seen_domains = HashSet::new();
        let mut deduped = Vec::new();
        for result in results {
            let key = normalize_url(&result.url);
            if seen_domains.insert(key) {
                deduped.push(result);
            }
            if deduped.len() >= max_sources {
                break;
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        // §4.7 step 2: fetches run in parallel (gated per-domain by the
        // `Limiter`, which already serialises concurrent hits to the same
        // domain) rather than one at a time; a single source failing does
        // not stop the others from being fetched and summarised.
        let fetches = deduped.iter().map(|result| self.fetch_and_summarise(requester_id, result));
        let fetched = tokio::select! {
            res = join_all(fetches) => res,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let mut sources = Vec::new();
        for (result, outcome) in deduped.into_iter().zip(fetched.into_iter()) {
            if let Ok(summary) = outcome {
                sources.push((result, summary));
            }
        }

        if sources.is_empty() {
            return Err(EngineError::NoSources);
        }

        let cited: Vec<CitedSource> = sources
            .iter()
            .enumerate()
            .map(|(i, (result, summary))| CitedSource {
                index: i + 1,
                url: result.url.clone(),
                title: result.title.clone(),
                summary: summary.clone(),
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let answer = self.synthesise(requester_id, query, &cited).await?;

        Ok(ResearchResult { answer, sources: cited })
    }

    async fn fetch_and_summarise(
        &self,
        requester_id: &str,
        result: &SearchResult,
    ) -> Result<String, EngineError> {
        let domain = domain_of(&result.url);
        self.limiter.can_fetch(&domain).await?;

        if self.is_blocked_by_robots(&domain, &result.url).await {
            self.limiter.record_robots_disallow(&domain).await;
            return Err(EngineError::ProviderError(format!("{} disallowed by robots.txt", result.url)));
        }

        let page_key = normalize_url(&result.url);
        let cache = &self.cache;
        let http = self.http.clone();
        let url = result.url.clone();
        let domain_lock = self.limiter.acquire_domain_fetch_lock(&domain).await;
        let page_text = cache
            .get_or_produce("page", &page_key, self.research_cache_ttl, || async move {
                let response = http
                    .get(&url)
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(EngineError::from)?;
                if !response.status().is_success() {
                    return Err(EngineError::ProviderError(format!(
                        "fetch {} returned {}",
                        url,
                        response.status()
                    )));
                }
                let body = response.text().await.map_err(EngineError::from)?;
                Ok(serde_json::json!(strip_tags(&body)))
            })
            .await;
        drop(domain_lock);

        let page_text = match page_text {
            Ok(value) => {
                self.limiter.record_fetch_success(&domain).await;
                value.as_str().unwrap_or_default().to_string()
            }
            Err(err) => {
                self.limiter.record_fetch_failure(&domain).await;
                return Err(err);
            }
        };

        let capped: String = page_text.chars().take(self.per_source_char_cap).collect();

        let request = CompletionRequest {
            model_id: "research-summariser".to_string(),
            system_text: "Summarise the following page content in 3-5 sentences, preserving facts and figures relevant to research."
                .to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: capped,
            }],
            temperature: 0.2,
            max_tokens: 400,
            timeout: Duration::from_secs(30),
            idempotency_key: format!("summarise:{}", page_key),
        };
        let response = self.model.complete(requester_id, request).await?;
        Ok(response.text)
    }

    /// Fetch and cache `domain`'s `robots.txt` (24h TTL, §4.4) and check
    /// whether it disallows `url`'s path for the wildcard user-agent group.
    /// A missing file or failed fetch is treated as fully allowed, matching
    /// standard crawler behaviour — `robots.txt` absence is not a block.
    async fn is_blocked_by_robots(&self, domain: &str, url: &str) -> bool {
        let robots_url = format!("{}://{}/robots.txt", scheme_of(url), domain);
        let http = self.http.clone();
        let fetch_url = robots_url.clone();
        let cached = self
            .cache
            .get_or_produce("robots", domain, ROBOTS_CACHE_TTL, || async move {
                let body = http
                    .get(&fetch_url)
                    .timeout(ROBOTS_FETCH_TIMEOUT)
                    .send()
                    .await
                    .ok()
                    .filter(|r| r.status().is_success());
                let disallow = match body {
                    Some(response) => match response.text().await {
                        Ok(text) => parse_robots_disallow(&text),
                        Err(_) => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(serde_json::json!(disallow))
            })
            .await;

        let disallow: Vec<String> = match cached {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(_) => return false,
        };

        path_is_disallowed(&path_of(url), &disallow)
    }

    async fn synthesise(
        &self,
        requester_id: &str,
        query: &str,
        sources: &[CitedSource],
    ) -> Result<String, EngineError> {
        let mut context = String::new();
        for source in sources {
            context.push_str(&format!("[{}] {} — {}\n", source.index, source.title, source.summary));
        }

        let request = CompletionRequest {
            model_id: "research-synthesiser".to_string(),
            system_text: "Answer the user's question from the numbered sources only, citing each claim inline as [n]."
                .to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: format!("Question: {}\n\nSources:\n{}", query, context),
            }],
            temperature: 0.3,
            max_tokens: 800,
            timeout: Duration::from_secs(30),
            idempotency_key: format!("synthesise:{}:{}", query, sources.len()),
        };
        let response = self.model.complete(requester_id, request).await?;
        Ok(response.text)
    }
}
