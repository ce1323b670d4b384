use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use labelens_contracts::coerce::{loose_string, string_field, string_list};

use crate::config::EngineConfig;
use crate::providers::response_json_or_status_error;

/// One ranked document from the grounded-search collaborator.
#[derive(Debug, Clone)]
pub struct SearchDocument {
    pub title: String,
    pub url: Option<String>,
    pub snippet: String,
    pub published: Option<String>,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>>;
}

/// Neural search over an Exa-style endpoint: POST /search with content
/// summaries and highlights requested alongside the ranked results.
pub struct NeuralSearchClient {
    api_base: String,
    api_key: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl NeuralSearchClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let Some(api_key) = config.search_api_key.clone() else {
            bail!("search API key not configured");
        };
        Ok(Self {
            api_base: config.search_api_base.clone(),
            api_key,
            request_timeout: config.search_call_timeout,
            http: reqwest::Client::new(),
        })
    }

    fn document_from_result(row: &Value) -> Option<SearchDocument> {
        let title = string_field(row, &["title"])?;
        let summary = string_field(row, &["summary"]);
        let highlights = string_list(row.get("highlights"));
        let snippet = summary
            .filter(|text| !text.is_empty())
            .or_else(|| (!highlights.is_empty()).then(|| highlights.join(" … ")))
            .or_else(|| row.get("text").and_then(loose_string))
            .unwrap_or_default();
        Some(SearchDocument {
            title,
            url: string_field(row, &["url"]),
            snippet,
            published: string_field(row, &["publishedDate", "published_date", "published"]),
        })
    }
}

#[async_trait]
impl SearchClient for NeuralSearchClient {
    fn name(&self) -> &str {
        "neural-search"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>> {
        let endpoint = format!("{}/search", self.api_base);
        let payload = json!({
            "query": query,
            "numResults": limit.max(1),
            "type": "neural",
            "contents": { "summary": true, "highlights": true },
        });
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("search request failed ({endpoint})"))?;
        let parsed = response_json_or_status_error("search", response).await?;

        let documents = parsed
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Self::document_from_result)
                    .take(limit.max(1))
                    .collect()
            })
            .unwrap_or_default();
        Ok(documents)
    }
}

/// One scripted search outcome, popped per call.
#[derive(Debug)]
pub enum ScriptedSearch {
    Documents(Vec<SearchDocument>),
    Failure(String),
    /// Never resolves inside any sane budget; exercises the per-call race.
    Hang,
}

#[derive(Default)]
pub struct ScriptedSearchClient {
    outcomes: Mutex<VecDeque<ScriptedSearch>>,
}

impl ScriptedSearchClient {
    pub fn new(outcomes: Vec<ScriptedSearch>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }

    pub fn canned_documents(count: usize) -> Vec<SearchDocument> {
        (0..count)
            .map(|idx| SearchDocument {
                title: format!("Document {idx}"),
                url: Some(format!("https://example.org/doc-{idx}")),
                snippet: "ingredient discussion".to_string(),
                published: None,
            })
            .collect()
    }
}

#[async_trait]
impl SearchClient for ScriptedSearchClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchDocument>> {
        let outcome = {
            let mut queue = self
                .outcomes
                .lock()
                .map_err(|_| anyhow::anyhow!("scripted search queue poisoned"))?;
            queue.pop_front()
        };
        match outcome {
            Some(ScriptedSearch::Documents(documents)) => Ok(documents),
            Some(ScriptedSearch::Failure(message)) => bail!(message),
            Some(ScriptedSearch::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("unreachable: hung search resolved")
            }
            None => bail!("scripted search queue exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn document_parsing_prefers_summary_then_highlights() {
        let with_summary = NeuralSearchClient::document_from_result(&json!({
            "title": "EFSA opinion",
            "url": "https://example.org",
            "summary": "the summary",
            "highlights": ["h1", "h2"]
        }))
        .expect("document");
        assert_eq!(with_summary.snippet, "the summary");

        let with_highlights = NeuralSearchClient::document_from_result(&json!({
            "title": "FDA notice",
            "highlights": ["first", "second"]
        }))
        .expect("document");
        assert_eq!(with_highlights.snippet, "first … second");

        assert!(NeuralSearchClient::document_from_result(&json!({ "url": "x" })).is_none());
    }

    #[tokio::test]
    async fn scripted_search_pops_in_order() {
        let client = ScriptedSearchClient::new(vec![
            ScriptedSearch::Documents(ScriptedSearchClient::canned_documents(2)),
            ScriptedSearch::Failure("provider down".to_string()),
        ]);
        assert_eq!(client.search("q", 5).await.unwrap().len(), 2);
        assert!(client.search("q", 5).await.is_err());
    }
}
