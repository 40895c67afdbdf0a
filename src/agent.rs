//! Agent: an identity, a model reference, and a sampler.

use std::sync::Arc;

use chrono::Utc;

use crate::gateway::{Attribution, SampleRequest, Sampler};
use crate::pedal::{Pedal, PedalError};
use crate::types::{AgentOutput, Knobs, Metadata, Prompt, Signal};

/// Default model identifier for the local Ollama endpoint.
pub const DEFAULT_MODEL: &str = "mistral:latest";

/// Pairs a prompt builder with a sampler under a fixed agent id and model.
///
/// Sampler failures never escape `run`: they become an `[Error: ...]`
/// response so ensembles and chat turns always produce an output.
#[derive(Clone)]
pub struct Agent {
    agent_id: String,
    model_name: String,
    pedal: Pedal,
    sampler: Arc<dyn Sampler>,
    parallelism: usize,
}

impl Agent {
    pub fn new(
        agent_id: impl Into<String>,
        model_name: impl Into<String>,
        pedal: Pedal,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            model_name: model_name.into(),
            pedal,
            sampler,
            parallelism: 1,
        }
    }

    /// Maximum in-flight sampler calls when this agent runs an ensemble.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn pedal(&self) -> &Pedal {
        &self.pedal
    }

    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        &self.sampler
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Build the prompt for `signal` under `knobs`, then sample it.
    pub async fn run(&self, signal: &Signal, knobs: &Knobs) -> Result<AgentOutput, PedalError> {
        let prompt = self.pedal.distort(signal, knobs)?;
        Ok(self.complete(signal, knobs, prompt).await)
    }

    /// Sample an already-built prompt and wrap the result as an output record.
    pub async fn complete(&self, signal: &Signal, knobs: &Knobs, prompt: Prompt) -> AgentOutput {
        let response = self.sample_text(&prompt, "agent::run").await;

        let mut model_info = Metadata::new();
        model_info.insert("model_name".into(), self.model_name.clone().into());
        model_info.insert("temperature".into(), prompt.temperature.into());
        model_info.insert("top_k".into(), prompt.top_k.into());
        model_info.insert("top_p".into(), prompt.top_p.into());

        AgentOutput {
            agent_id: self.agent_id.clone(),
            knobs: *knobs,
            signal_id: signal.id.clone(),
            response,
            reasoning_style: format!("{}/{}", knobs.mode(), knobs.tone()),
            model_info,
            created_at: Utc::now(),
            provenance: prompt.metadata,
        }
    }

    /// Sample a prompt with this agent's model. Failures come back as
    /// `[Error: ...]` text.
    pub async fn sample_text(&self, prompt: &Prompt, caller: &'static str) -> String {
        let req = SampleRequest::from_prompt(&self.model_name, prompt, Attribution::new(caller));
        match self.sampler.sample(&req).await {
            Ok(resp) => resp.content,
            Err(err) => {
                tracing::warn!(
                    agent = %self.agent_id,
                    model = %self.model_name,
                    error = %err,
                    "sampler call failed"
                );
                format!("[Error: {err}]")
            }
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.agent_id)
            .field("model_name", &self.model_name)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ProviderError, SampleResponse};
    use crate::types::{Mode, Tone};
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl Sampler for Echo {
        async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
            Ok(SampleResponse {
                content: format!("t={} k={:?}", req.temperature, req.top_k),
                input_tokens: None,
                output_tokens: None,
                latency: Duration::ZERO,
            })
        }
    }

    struct Down;

    #[async_trait::async_trait]
    impl Sampler for Down {
        async fn sample(&self, _req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
            Err(ProviderError::provider("ollama", "connection refused", true))
        }
    }

    #[tokio::test]
    async fn run_records_model_info_and_style() {
        let agent = Agent::new("twistedpair", "m", Pedal::default(), Arc::new(Echo));
        let knobs = Knobs::new(Mode::EchoEr, Tone::Poetic, 10).unwrap();
        let out = agent.run(&Signal::new("hi", "test"), &knobs).await.unwrap();

        assert_eq!(out.reasoning_style, "echo_er/poetic");
        assert_eq!(out.model_info["model_name"], "m");
        assert_eq!(out.model_info["top_k"], 120);
        assert_eq!(out.response, "t=2 k=Some(120)");
        assert_eq!(out.provenance["knobs"]["gain"], 10);
    }

    #[tokio::test]
    async fn sampler_failure_becomes_error_text() {
        let agent = Agent::new("twistedpair", "m", Pedal::default(), Arc::new(Down));
        let knobs = Knobs::new(Mode::InvertEr, Tone::Neutral, 1).unwrap();
        let out = agent.run(&Signal::new("hi", "test"), &knobs).await.unwrap();

        assert!(out.is_error());
        assert!(out.response.contains("connection refused"));
    }
}
