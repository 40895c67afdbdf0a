//! Web search: Brave Search API first, DuckDuckGo HTML results as fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use super::fetch::random_user_agent;

pub const BRAVE_API_URL: &str = "https://api.search.brave.com/res/v1/web/search";
pub const DUCKDUCKGO_HTML_URL: &str = "https://html.duckduckgo.com/html/";
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One ranked hit, normalised across providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("{provider}: missing credential {name}")]
    MissingCredential {
        provider: &'static str,
        name: &'static str,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{provider}: HTTP {status}")]
    Status { provider: &'static str, status: u16 },
    #[error("{provider}: malformed response: {message}")]
    Malformed {
        provider: &'static str,
        message: String,
    },
    #[error("all search providers failed; primary: {primary}; secondary: {secondary}")]
    Unavailable { primary: String, secondary: String },
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, SearchError>;
}

// =============================================================================
// Brave
// =============================================================================

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveItem>,
}

#[derive(Deserialize)]
struct BraveItem {
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

/// Brave Search web endpoint. Requires an API key (`X-Subscription-Token`).
#[derive(Debug, Clone)]
pub struct BraveSearch {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl BraveSearch {
    pub fn new(api_key: Option<String>) -> Result<Self, SearchError> {
        Self::with_config(BRAVE_API_URL, api_key, DEFAULT_SEARCH_TIMEOUT)
    }

    pub fn from_env() -> Result<Self, SearchError> {
        let key = std::env::var("BRAVE_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Self::new(key)
    }

    pub fn with_config(
        api_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl SearchProvider for BraveSearch {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let key = self.api_key.as_deref().ok_or(SearchError::MissingCredential {
            provider: "brave",
            name: "BRAVE_API_KEY",
        })?;

        let count = max_results.to_string();
        let response = self
            .client
            .get(&self.api_url)
            .header("X-Subscription-Token", key)
            .query(&[("q", query), ("count", count.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                provider: "brave",
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let parsed: BraveResponse =
            serde_json::from_str(&body).map_err(|e| SearchError::Malformed {
                provider: "brave",
                message: e.to_string(),
            })?;

        let results: Vec<SearchResult> = parsed
            .web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .map(|item| SearchResult {
                title: item.title.unwrap_or_else(|| "No title".into()),
                snippet: item.description.unwrap_or_else(|| "No snippet".into()),
                url: item.url.unwrap_or_default(),
            })
            .collect();

        tracing::info!(provider = "brave", query, results = results.len(), "search complete");
        Ok(results)
    }
}

// =============================================================================
// DuckDuckGo (HTML endpoint, no key)
// =============================================================================

#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    html_url: String,
}

impl DuckDuckGoSearch {
    pub fn new() -> Result<Self, SearchError> {
        Self::with_config(DUCKDUCKGO_HTML_URL, DEFAULT_SEARCH_TIMEOUT)
    }

    pub fn with_config(html_url: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            html_url: html_url.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let response = self
            .client
            .get(&self.html_url)
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .query(&[("q", query)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                provider: "duckduckgo",
                status: status.as_u16(),
            });
        }

        let html = response.text().await?;
        let results = parse_duckduckgo_html(&html, max_results)?;
        tracing::info!(provider = "duckduckgo", query, results = results.len(), "search complete");
        Ok(results)
    }
}

fn selector(css: &str) -> Result<Selector, SearchError> {
    Selector::parse(css).map_err(|e| SearchError::Malformed {
        provider: "duckduckgo",
        message: format!("selector {css}: {e}"),
    })
}

/// Pull ranked results out of a DuckDuckGo HTML results page.
pub fn parse_duckduckgo_html(html: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
    let document = Html::parse_document(html);
    let result_sel = selector(".result")?;
    let title_sel = selector(".result__a")?;
    let snippet_sel = selector(".result__snippet")?;
    let url_sel = selector(".result__url")?;

    let mut results = Vec::new();
    for element in document.select(&result_sel) {
        if results.len() >= max_results {
            break;
        }
        let Some(link) = element.select(&title_sel).next() else {
            continue;
        };
        let title = collapse_text(link.text());
        if title.is_empty() {
            continue;
        }

        let url = link
            .value()
            .attr("href")
            .and_then(resolve_result_href)
            .or_else(|| {
                element
                    .select(&url_sel)
                    .next()
                    .map(|e| collapse_text(e.text()))
                    .filter(|u| !u.is_empty())
                    .map(|u| {
                        if u.starts_with("http") {
                            u
                        } else {
                            format!("https://{u}")
                        }
                    })
            })
            .unwrap_or_default();

        let snippet = element
            .select(&snippet_sel)
            .next()
            .map(|e| collapse_text(e.text()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "No snippet".into());

        results.push(SearchResult {
            title,
            snippet,
            url,
        });
    }
    Ok(results)
}

/// DuckDuckGo wraps result links as `//duckduckgo.com/l/?uddg=<encoded>`.
fn resolve_result_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = url::Url::parse(&absolute).ok()?;
    if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
        return Some(target.into_owned());
    }
    match parsed.scheme() {
        "http" | "https" => Some(absolute),
        _ => None,
    }
}

fn collapse_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Client with fallback
// =============================================================================

/// Primary provider with a single fallback. No retries beyond the fallback.
#[derive(Clone)]
pub struct WebSearchClient {
    primary: Arc<dyn SearchProvider>,
    secondary: Arc<dyn SearchProvider>,
}

impl WebSearchClient {
    pub fn new(primary: Arc<dyn SearchProvider>, secondary: Arc<dyn SearchProvider>) -> Self {
        Self { primary, secondary }
    }

    /// Brave (key from `BRAVE_API_KEY`) with DuckDuckGo fallback.
    pub fn from_env() -> Result<Self, SearchError> {
        Ok(Self::new(
            Arc::new(BraveSearch::from_env()?),
            Arc::new(DuckDuckGoSearch::new()?),
        ))
    }

    pub async fn search_primary(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.primary.search(query, max_results).await
    }

    pub async fn search_fallback(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.secondary.search(query, max_results).await
    }

    /// Primary first; on any failure try the secondary once. If both fail the
    /// error names both causes.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let primary_err = match self.search_primary(query, max_results).await {
            Ok(results) => return Ok(results),
            Err(e) => e,
        };
        tracing::warn!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            error = %primary_err,
            "primary search failed, falling back"
        );

        self.search_fallback(query, max_results)
            .await
            .map_err(|secondary_err| SearchError::Unavailable {
                primary: primary_err.to_string(),
                secondary: secondary_err.to_string(),
            })
    }
}
