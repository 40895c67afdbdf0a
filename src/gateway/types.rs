//! Request/response types for the sampler gateway.

use std::time::Duration;

use crate::types::Prompt;

/// Which code path made a sampler call, for logs and usage records.
///
/// Use a static string like "ensemble::run" or "chat::follow_up".
#[derive(Debug, Clone, Copy, Default)]
pub struct Attribution {
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self { caller }
    }
}

/// One text-completion request: system text, user text and sampling knobs.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    /// Model identifier, e.g. "mistral:latest".
    pub model: String,
    pub system: String,
    pub user: String,
    /// Sampling temperature (0.1 - 2.0 under the default ranges).
    pub temperature: f64,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
    pub attribution: Attribution,
}

impl SampleRequest {
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.7,
            top_k: None,
            top_p: None,
            attribution,
        }
    }

    /// Request carrying a built prompt's text and sampling parameters.
    pub fn from_prompt(model: impl Into<String>, prompt: &Prompt, attribution: Attribution) -> Self {
        Self::new(model, prompt.system.clone(), prompt.user.clone(), attribution)
            .temperature(prompt.temperature)
            .top_k(prompt.top_k)
            .top_p(prompt.top_p)
    }

    pub fn temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn top_p(mut self, p: f64) -> Self {
        self.top_p = Some(p);
        self
    }
}

/// Generated text plus call bookkeeping.
#[derive(Debug, Clone)]
pub struct SampleResponse {
    pub content: String,
    /// Prompt tokens reported by the endpoint, if any.
    pub input_tokens: Option<u32>,
    /// Generated tokens reported by the endpoint, if any.
    pub output_tokens: Option<u32>,
    pub latency: Duration,
}
