//! Web enrichment: intent detection, search, page fetch, content splicing.

pub mod fetch;
pub mod intent;
pub mod search;

use serde::Serialize;

pub use fetch::{FetchError, FetchedContent, PageFetcher};
pub use intent::{detect_web_search_intent, extract_search_query, parse_web_intent};
pub use search::{
    BraveSearch, DuckDuckGoSearch, SearchError, SearchProvider, SearchResult, WebSearchClient,
};

use crate::types::Signal;

pub const DEFAULT_MAX_RESULTS: usize = 7;
pub const DEFAULT_MAX_CHARS_PER_URL: usize = 10_000;
pub const WEB_SEARCH_TAG: &str = "web_search";

const BANNER_WIDTH: usize = 80;
const UNAVAILABLE_MARKER: &str = "[Full content unavailable - site blocked or failed to fetch]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched,
    SnippetOnly,
}

/// Provenance entry for one search hit, stored under `web_sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebSource {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub snippet: String,
    pub status: SourceStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Orchestrates intent → search → fetch → splice.
#[derive(Clone)]
pub struct WebEnricher {
    search: WebSearchClient,
    fetcher: PageFetcher,
    max_results: usize,
    max_chars_per_url: usize,
}

impl WebEnricher {
    pub fn new(search: WebSearchClient, fetcher: PageFetcher) -> Self {
        Self {
            search,
            fetcher,
            max_results: DEFAULT_MAX_RESULTS,
            max_chars_per_url: DEFAULT_MAX_CHARS_PER_URL,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_max_chars_per_url(mut self, max_chars: usize) -> Self {
        self.max_chars_per_url = max_chars;
        self
    }

    /// Enrich `signal` with web results when its content asks for a search.
    ///
    /// Never fails: without intent, without results, or on any error the
    /// input signal comes back unchanged.
    pub async fn enrich(&self, signal: &Signal) -> Signal {
        let Some(query) = parse_web_intent(&signal.content) else {
            tracing::debug!(signal_id = %signal.id, "no web search intent");
            return signal.clone();
        };

        match self.try_enrich(signal, &query).await {
            Ok(Some(enriched)) => enriched,
            Ok(None) => {
                tracing::warn!(query = %query, "no search results");
                signal.clone()
            }
            Err(e) => {
                tracing::error!(query = %query, error = %e, "web enrichment failed");
                signal.clone()
            }
        }
    }

    /// Search and splice for an explicit query. `Ok(None)` when the search
    /// returned nothing.
    pub async fn try_enrich(
        &self,
        signal: &Signal,
        query: &str,
    ) -> Result<Option<Signal>, EnrichError> {
        let results = self.search.search(query, self.max_results).await?;
        if results.is_empty() {
            return Ok(None);
        }

        let urls: Vec<String> = results.iter().map(|r| r.url.clone()).collect();
        let fetched = self.fetcher.fetch_many(&urls, self.max_chars_per_url).await;
        let fetched: Vec<Option<FetchedContent>> = fetched.into_iter().map(Result::ok).collect();

        let (content, sources) = splice(&signal.content, query, &results, &fetched);
        let fetched_count = sources
            .iter()
            .filter(|s| s.status == SourceStatus::Fetched)
            .count();

        let mut metadata = signal.metadata.clone();
        metadata.insert("web_search_query".into(), query.into());
        metadata.insert("web_sources".into(), serde_json::to_value(&sources)?);
        metadata.insert("web_enriched".into(), true.into());

        let mut tags = signal.tags.clone();
        tags.push(WEB_SEARCH_TAG.to_string());

        tracing::info!(
            query,
            results = results.len(),
            fetched = fetched_count,
            "signal enriched with web sources"
        );

        Ok(Some(Signal {
            id: signal.id.clone(),
            content,
            source: format!("web://{query}"),
            captured_at: signal.captured_at.clone(),
            tags,
            metadata,
        }))
    }
}

/// Render the enriched body. `fetched[i]` is the page for `results[i]`, if any.
fn splice(
    original: &str,
    query: &str,
    results: &[SearchResult],
    fetched: &[Option<FetchedContent>],
) -> (String, Vec<WebSource>) {
    let rule = "=".repeat(BANNER_WIDTH);
    let thin = "-".repeat(BANNER_WIDTH);

    let mut content = format!("{original}\n\n{rule}\nWEB SEARCH RESULTS FOR: {query}\n{rule}\n\n");
    let mut sources = Vec::with_capacity(results.len());

    for (i, result) in results.iter().enumerate() {
        content.push_str(&format!(
            "[SOURCE {}] {}\nURL: {}\nSnippet: {}\n{thin}\n",
            i + 1,
            result.title,
            result.url,
            result.snippet
        ));

        let status = match fetched.get(i).and_then(Option::as_ref) {
            Some(page) => {
                content.push_str(&format!("Full Content:\n{}\n\n", page.text));
                SourceStatus::Fetched
            }
            None => {
                content.push_str(UNAVAILABLE_MARKER);
                content.push_str("\n\n");
                SourceStatus::SnippetOnly
            }
        };

        sources.push(WebSource {
            title: result.title.clone(),
            url: result.url.clone(),
            domain: url_domain(&result.url),
            snippet: result.snippet.clone(),
            status,
        });
    }

    (content, sources)
}

fn url_domain(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_default()
}
