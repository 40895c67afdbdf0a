//! Ollama adapter for text generation (`/api/generate`).

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default context window passed as `num_ctx`.
pub const DEFAULT_NUM_CTX: u32 = 32_768;

/// Ollama API adapter.
#[derive(Debug, Clone)]
pub struct OllamaSampler {
    client: reqwest::Client,
    base_url: String,
    num_ctx: u32,
    timeout: Duration,
}

impl OllamaSampler {
    /// Local Ollama with default timeout and context window.
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_config(DEFAULT_OLLAMA_URL, Duration::from_secs(120), DEFAULT_NUM_CTX)
    }

    pub fn with_config(
        base_url: impl Into<String>,
        timeout: Duration,
        num_ctx: u32,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProviderError::config("Ollama base URL is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            num_ctx,
            timeout,
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn http_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Http(e)
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_ctx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    error: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

/// Single-string prompt layout the generate endpoint expects.
fn combine_prompt(system: &str, user: &str) -> String {
    format!("{system}\n\nUser input:\n{user}")
}

// =============================================================================
// GENERATION
// =============================================================================

impl OllamaSampler {
    /// One non-streaming generate call. Returns the trimmed `response` text.
    pub async fn generate(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        let total_chars = req.system.len() + req.user.len();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let api_req = GenerateRequest {
            model: &req.model,
            prompt: combine_prompt(&req.system, &req.user),
            stream: false,
            options: GenerateOptions {
                temperature: req.temperature,
                num_ctx: self.num_ctx,
                top_k: req.top_k,
                top_p: req.top_p,
            },
        };

        let mut response = self
            .client
            .post(self.generate_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let status = response.status();

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.http_error(e))? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    "ollama",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let mut ctx = ErrorContext::new().with_status(status.as_u16());
            let message = match serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.error)
            {
                Some(err) => {
                    ctx = ctx.with_message(&err);
                    err
                }
                None => format!("HTTP {}", status.as_u16()),
            };
            return Err(ProviderError::provider_with_context(
                "ollama",
                message,
                status.as_u16() >= 500,
                ctx,
            ));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider("ollama", format!("Invalid JSON: {e}"), false))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider("ollama", error, false));
        }

        let content = parsed.response.unwrap_or_default().trim().to_string();

        Ok(SampleResponse {
            content,
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
            latency: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_layout_puts_user_after_marker() {
        let p = combine_prompt("SYS", "hello");
        assert_eq!(p, "SYS\n\nUser input:\nhello");
    }

    #[test]
    fn empty_base_url_is_config_error() {
        let err = OllamaSampler::with_config("", Duration::from_secs(1), 1024).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
