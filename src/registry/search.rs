//! Tool search and description for the meta-tool presentation.
//!
//! Search first asks the embeddings service. Whenever that service is not
//! configured, fails, or times out, a keyword match over the cached catalog
//! answers instead. Either way the caller only ever sees tools of backends
//! it may access.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::registry::ToolSnapshot;
use crate::types::BackendId;

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(5);

const NAME_MATCH_SCORE: f64 = 0.8;
const DESCRIPTION_MATCH_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Embeddings,
    CacheFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub tool_name: String,
    pub server_id: String,
    pub display_name: String,
    pub description: String,
    pub relevance_score: f64,
    pub source: SearchSource,
}

/// One hit as returned by the embeddings service.
#[derive(Debug, Deserialize)]
struct RemoteHit {
    tool_name: String,
    #[serde(default)]
    relevance_score: Option<f64>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    results: Vec<RemoteHit>,
}

/// Semantic ranking collaborator.
pub trait EmbeddingSearch: Send + Sync {
    /// Tool names with scores, best first.
    fn search<'a>(
        &'a self,
        query: &'a str,
        allowed_servers: &'a [BackendId],
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(String, f64)>>> + Send + 'a>>;
}

pub struct HttpEmbeddingSearch {
    base_url: String,
    http: reqwest::Client,
}

impl HttpEmbeddingSearch {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().timeout(EMBEDDINGS_TIMEOUT).build()?,
        })
    }
}

impl EmbeddingSearch for HttpEmbeddingSearch {
    fn search<'a>(
        &'a self,
        query: &'a str,
        allowed_servers: &'a [BackendId],
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(String, f64)>>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .http
                .post(format!("{}/search", self.base_url))
                .json(&json!({
                    "query": query,
                    "allowed_servers": allowed_servers,
                    "limit": limit,
                }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(anyhow::anyhow!("embeddings service returned {}", response.status()));
            }
            let body: RemoteResponse = response.json().await?;
            Ok(body
                .results
                .into_iter()
                .map(|h| {
                    let score = h.relevance_score.or(h.score).unwrap_or(0.0);
                    (h.tool_name, score)
                })
                .collect())
        })
    }
}

/// Case-insensitive substring match over tool names and descriptions.
pub fn keyword_search(
    snapshot: &ToolSnapshot,
    query: &str,
    allowed: &BTreeSet<BackendId>,
    limit: usize,
) -> Vec<SearchHit> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = snapshot
        .tools()
        .filter(|t| allowed.contains(&t.backend_id))
        .filter_map(|t| {
            let score = if t.name.as_str().to_lowercase().contains(&needle) {
                NAME_MATCH_SCORE
            } else if t.description.to_lowercase().contains(&needle) {
                DESCRIPTION_MATCH_SCORE
            } else {
                return None;
            };
            Some(SearchHit {
                tool_name: t.name.to_string(),
                server_id: t.backend_id.to_string(),
                display_name: t.backend_display_name.clone(),
                description: t.description.clone(),
                relevance_score: score,
                source: SearchSource::CacheFallback,
            })
        })
        .collect();

    // stable sort keeps name order within equal scores
    hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    hits.truncate(limit);
    hits
}

/// Rank tools for `query`, restricted to `allowed` backends.
pub async fn search_tools(
    snapshot: &ToolSnapshot,
    embeddings: Option<&dyn EmbeddingSearch>,
    query: &str,
    allowed: &BTreeSet<BackendId>,
    limit: usize,
) -> Vec<SearchHit> {
    if allowed.is_empty() {
        return Vec::new();
    }

    if let Some(embeddings) = embeddings {
        let servers: Vec<BackendId> = allowed.iter().cloned().collect();
        match embeddings.search(query, &servers, limit).await {
            Ok(ranked) => {
                let hits: Vec<SearchHit> = ranked
                    .into_iter()
                    .filter_map(|(name, score)| {
                        let tool = snapshot.get(&name)?;
                        if !allowed.contains(&tool.backend_id) {
                            return None;
                        }
                        Some(SearchHit {
                            tool_name: tool.name.to_string(),
                            server_id: tool.backend_id.to_string(),
                            display_name: tool.backend_display_name.clone(),
                            description: tool.description.clone(),
                            relevance_score: score,
                            source: SearchSource::Embeddings,
                        })
                    })
                    .take(limit)
                    .collect();
                debug!(query, hits = hits.len(), "Embeddings search");
                return hits;
            }
            Err(e) => warn!("Embeddings search failed, using keyword fallback: {}", e),
        }
    }

    keyword_search(snapshot, query, allowed, limit)
}

/// Schema and metadata of each named tool, or why it cannot be shown.
pub fn describe_tools(
    snapshot: &ToolSnapshot,
    names: &[String],
    allowed: &BTreeSet<BackendId>,
) -> Vec<Value> {
    names
        .iter()
        .map(|name| match snapshot.get(name) {
            None => json!({"tool_name": name, "error": "Tool not found"}),
            Some(tool) if !allowed.contains(&tool.backend_id) => {
                json!({"tool_name": name, "error": "Access denied"})
            }
            Some(tool) => json!({
                "tool_name": tool.name,
                "server_id": tool.backend_id,
                "display_name": tool.backend_display_name,
                "description": tool.description,
                "endpoint": tool.endpoint(),
                "input_schema": tool
                    .input_schema()
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "additionalProperties": true})),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::snapshot::tests::tool;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot() -> ToolSnapshot {
        ToolSnapshot::builder()
            .add_backend(
                BackendId::new("github"),
                vec![
                    tool("github", "search_repositories", "Search repositories"),
                    tool("github", "create_issue", "Open a new issue"),
                ],
                None,
            )
            .add_backend(
                BackendId::new("linear"),
                vec![tool("linear", "list_issues", "List issues in a project")],
                None,
            )
            .build()
    }

    fn allowed(ids: &[&str]) -> BTreeSet<BackendId> {
        ids.iter().map(|id| BackendId::new(*id)).collect()
    }

    #[test]
    fn test_keyword_scores_and_filters() {
        let snapshot = snapshot();
        let hits = keyword_search(&snapshot, "ISSUE", &allowed(&["github", "linear"]), 10);
        let names: Vec<&str> = hits.iter().map(|h| h.tool_name.as_str()).collect();
        assert_eq!(names, vec!["github_create_issue", "linear_list_issues"]);
        assert!(hits.iter().all(|h| h.relevance_score == NAME_MATCH_SCORE));

        let hits = keyword_search(&snapshot, "project", &allowed(&["github", "linear"]), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance_score, DESCRIPTION_MATCH_SCORE);
        assert_eq!(hits[0].source, SearchSource::CacheFallback);

        let hits = keyword_search(&snapshot, "issue", &allowed(&["github"]), 10);
        assert_eq!(hits.len(), 1);

        assert_eq!(keyword_search(&snapshot, "issue", &allowed(&["github", "linear"]), 1).len(), 1);
    }

    #[tokio::test]
    async fn test_embeddings_results_are_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({"query": "repos", "allowed_servers": ["github"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"tool_name": "linear_list_issues", "relevance_score": 0.99},
                    {"tool_name": "github_search_repositories", "relevance_score": 0.91},
                    {"tool_name": "github_gone", "relevance_score": 0.5}
                ]
            })))
            .mount(&server)
            .await;

        let embeddings = HttpEmbeddingSearch::new(server.uri()).unwrap();
        let hits = search_tools(&snapshot(), Some(&embeddings), "repos", &allowed(&["github"]), 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_name, "github_search_repositories");
        assert_eq!(hits[0].source, SearchSource::Embeddings);
    }

    #[tokio::test]
    async fn test_embeddings_failure_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embeddings = HttpEmbeddingSearch::new(server.uri()).unwrap();
        let hits = search_tools(&snapshot(), Some(&embeddings), "search", &allowed(&["github"]), 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, SearchSource::CacheFallback);
    }

    #[test]
    fn test_describe_tools() {
        let described = describe_tools(
            &snapshot(),
            &[
                "github_create_issue".to_string(),
                "linear_list_issues".to_string(),
                "nope".to_string(),
            ],
            &allowed(&["github"]),
        );
        assert_eq!(described[0]["endpoint"], "/github/create_issue");
        assert_eq!(described[0]["input_schema"]["type"], "object");
        assert_eq!(described[1]["error"], "Access denied");
        assert_eq!(described[2]["error"], "Tool not found");
    }
}
