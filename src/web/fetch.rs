//! Page fetcher: GET a URL and reduce the HTML to readable text.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_CHARS: usize = 30_000;
pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

/// Maximum allowed response body length (5MB).
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Elements whose text never counts as page content.
const SKIPPED_ELEMENTS: [&str; 6] = ["script", "style", "nav", "footer", "header", "aside"];

/// Primary-content containers, most specific first.
const CONTENT_CONTAINERS: [&str; 3] = ["main", "article", "div.content"];

pub const USER_AGENTS: [&str; 10] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 OPR/106.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

/// A user agent drawn from the built-in pool.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("response too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadata {
    pub domain: String,
    pub content_type: String,
    /// Length of `text` in characters, truncation marker included.
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedContent {
    pub url: String,
    pub title: String,
    pub text: String,
    pub metadata: FetchMetadata,
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    user_agents: Vec<String>,
    parallelism: usize,
}

impl PageFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(DEFAULT_FETCH_TIMEOUT, Vec::new())
    }

    /// An empty `user_agents` list means the built-in pool.
    pub fn with_config(timeout: Duration, user_agents: Vec<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            user_agents,
            parallelism: 4,
        })
    }

    /// Concurrent fetches in `fetch_many`.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    fn user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_else(|| random_user_agent())
    }

    /// Fetch one page and extract at most `max_chars` characters of text.
    pub async fn fetch(&self, url: &str, max_chars: usize) -> Result<FetchedContent, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let domain = match parsed.host_str() {
            Some(host) if matches!(parsed.scheme(), "http" | "https") => match parsed.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            },
            _ => return Err(FetchError::InvalidUrl(url.to_string())),
        };

        let mut response = self
            .client
            .get(parsed)
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_BODY_BYTES {
                return Err(FetchError::TooLarge(new_len));
            }
            bytes.extend_from_slice(&chunk);
        }
        let html = String::from_utf8_lossy(&bytes);

        let page = extract_page(&html);
        let title = page.title.unwrap_or_else(|| domain.clone());
        let text = truncate_chars(&page.text, max_chars);
        let length = text.chars().count();

        tracing::info!(url, chars = length, "fetched page");
        Ok(FetchedContent {
            url: url.to_string(),
            title,
            text,
            metadata: FetchMetadata {
                domain,
                content_type,
                length,
            },
        })
    }

    /// Fetch several pages. One result per input URL, in input order; a
    /// failed URL never affects the others.
    pub async fn fetch_many(
        &self,
        urls: &[String],
        max_chars_per_url: usize,
    ) -> Vec<Result<FetchedContent, FetchError>> {
        stream::iter(urls)
            .map(|url| async move {
                let result = self.fetch(url, max_chars_per_url).await;
                if let Err(e) = &result {
                    tracing::warn!(url = %url, error = %e, "skipping page");
                }
                result
            })
            .buffered(self.parallelism)
            .collect()
            .await
    }
}

/// Title and readable text of an HTML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: String,
}

/// Reduce an HTML document to its title and readable text: skip
/// script/style/nav/footer/header/aside, prefer a main-content container over
/// the body, one stripped text run per line, no blank lines.
pub fn extract_page(html: &str) -> ExtractedPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let container = CONTENT_CONTAINERS
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|sel| document.select(&sel).find(|el| !inside_skipped(el)))
        .or_else(|| {
            Selector::parse("body")
                .ok()
                .and_then(|sel| document.select(&sel).next())
        })
        .unwrap_or_else(|| document.root_element());

    ExtractedPage {
        title,
        text: readable_text(container),
    }
}

fn is_skipped(el: &ElementRef) -> bool {
    SKIPPED_ELEMENTS.contains(&el.value().name())
}

fn inside_skipped(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| is_skipped(&a))
}

fn readable_text(container: ElementRef) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for node in container.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node
            .ancestors()
            .take_while(|a| a.id() != container.id())
            .filter_map(ElementRef::wrap)
            .any(|a| is_skipped(&a));
        if skipped {
            continue;
        }
        lines.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()));
    }
    lines.join("\n")
}

/// Cut `text` to `max_chars` characters, appending the truncation marker.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &text[..byte_idx]),
        None => text.to_string(),
    }
}
