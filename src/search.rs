use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

use crate::data_models::SearchResult;
use crate::error::AppError;

pub const MAX_RESULTS: usize = 4;
pub const SEARCH_DEPTH: &str = "advanced";
pub const UNKNOWN_DOMAIN: &str = "unknown";

#[derive(Serialize, Debug)]
struct ProviderRequest<'a> {
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_domains: Vec<String>,
    api_key: &'a str,
}

/// One provider hit before defaults are applied. Every field may be absent.
#[derive(Debug, Default, Clone)]
pub struct RawSearchResult {
    pub title: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
}

impl RawSearchResult {
    /// Reads each field on its own; a field of the wrong type counts as absent
    /// without spoiling the others.
    pub fn from_value(item: &Value) -> Self {
        let field = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            title: field("title"),
            content: field("content"),
            url: field("url"),
            domain: field("domain"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchBridge {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl SearchBridge {
    pub fn new(client: reqwest::Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    /// Runs one provider search. Any failure fails the whole call; there is no
    /// partial result list.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let request = ProviderRequest {
            query,
            search_depth: SEARCH_DEPTH,
            max_results: MAX_RESULTS,
            include_domains: Vec::new(),
            api_key: &self.api_key,
        };

        let res = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(AppError::UpstreamTransport(format!(
                "search provider returned {status}"
            )));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| AppError::UpstreamFormat(format!("search payload is not json: {e}")))?;

        let results = parse_results(&payload)?;
        log::info!("search returned {} results for {:?}", results.len(), query);
        Ok(results)
    }
}

/// Validates the provider payload and normalizes up to [`MAX_RESULTS`] hits,
/// keeping provider order.
pub fn parse_results(payload: &Value) -> Result<Vec<SearchResult>, AppError> {
    let raw = payload
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            AppError::UpstreamFormat("invalid response format from search provider".to_string())
        })?;

    Ok(raw
        .iter()
        .take(MAX_RESULTS)
        .map(|item| normalize(RawSearchResult::from_value(item)))
        .collect())
}

pub fn normalize(raw: RawSearchResult) -> SearchResult {
    let title = non_empty(raw.title).unwrap_or_else(|| "Untitled".to_string());
    let content = raw.content.unwrap_or_default();
    let url = non_empty(raw.url).unwrap_or_else(|| "#".to_string());
    let domain = non_empty(raw.domain)
        .or_else(|| host_of(&url))
        .unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());

    SearchResult::new(title, content, url, domain)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// `[title]\ncontent` blocks separated by a blank line.
pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}]\n{}", r.title, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
