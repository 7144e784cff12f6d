//! Black-box coverage of C7 (`Researcher`) against mocked HTTP backends: a
//! fake search provider plus a `wiremock` server standing in for both the
//! fetched pages and the OpenAI-compatible completions endpoint used for
//! summarisation/synthesis.

use agentmesh::cache::Cache;
use agentmesh::error::EngineError;
use agentmesh::limiter::Limiter;
use agentmesh::model_client::{HttpModelProvider, ModelClient};
use agentmesh::researcher::{Researcher, SearchProvider, SearchResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedSearch(Vec<SearchResult>);

#[async_trait]
impl SearchProvider for FixedSearch {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchResult>, EngineError> {
        Ok(self.0.clone())
    }
}

async fn researcher_against(server: &MockServer, search: Vec<SearchResult>) -> Researcher {
    let cache = Arc::new(Cache::new());
    let limiter = Arc::new(Limiter::new(5, 5, 60, 10.0));
    let provider = Arc::new(HttpModelProvider::new(reqwest::Client::new(), server.uri(), "test-key"));
    let model = Arc::new(ModelClient::new(provider, cache.clone(), limiter.clone(), Duration::from_secs(60)));
    Researcher::new(
        reqwest::Client::new(),
        Arc::new(FixedSearch(search)),
        model,
        cache,
        limiter,
        8000,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    )
}

fn completion_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{"message": {"content": text}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
    })
}

#[tokio::test]
async fn research_cites_sources_from_every_fetched_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body><p>Rust async runtimes compared.</p></body></html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response("a concise summary")))
        .mount(&server)
        .await;

    let search_results = vec![SearchResult {
        url: format!("{}/article", server.uri()),
        title: "Async Runtimes".to_string(),
        snippet: "a comparison".to_string(),
    }];

    let researcher = researcher_against(&server, search_results).await;
    let cancel = agentmesh::cancel::CancelToken::never();
    let result = researcher.research("u1", "compare rust async runtimes", 3, cancel).await.unwrap();

    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].index, 1);
    assert_eq!(result.answer, "a concise summary");
}

#[tokio::test]
async fn pages_blocked_by_robots_txt_are_excluded_from_the_cited_sources() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>allowed content</p>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response("summary of the allowed page")))
        .mount(&server)
        .await;

    let search_results = vec![
        SearchResult {
            url: format!("{}/private/page", server.uri()),
            title: "Blocked".to_string(),
            snippet: "blocked".to_string(),
        },
        SearchResult {
            url: format!("{}/public", server.uri()),
            title: "Allowed".to_string(),
            snippet: "allowed".to_string(),
        },
    ];

    let researcher = researcher_against(&server, search_results).await;
    let cancel = agentmesh::cancel::CancelToken::never();
    let result = researcher.research("u1", "anything", 5, cancel).await.unwrap();

    assert_eq!(result.sources.len(), 1);
    assert!(result.sources[0].url.ends_with("/public"));
}

#[tokio::test]
async fn all_sources_blocked_yields_no_sources_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
        .mount(&server)
        .await;

    let search_results = vec![SearchResult {
        url: format!("{}/anything", server.uri()),
        title: "Blocked".to_string(),
        snippet: "blocked".to_string(),
    }];

    let researcher = researcher_against(&server, search_results).await;
    let cancel = agentmesh::cancel::CancelToken::never();
    let err = researcher.research("u1", "anything", 5, cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::NoSources));
}
