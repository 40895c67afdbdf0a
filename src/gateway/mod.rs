//! Sampler gateway: the boundary between prompt building and text generation.

pub mod error;
pub mod ollama;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use usage::{CallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use ollama::{OllamaSampler, DEFAULT_NUM_CTX, DEFAULT_OLLAMA_URL};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, TracingUsageSink, UsageSink};

/// Anything that can turn a (system, user, sampling knobs) request into text.
#[async_trait::async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError>;

    /// Short provider name for usage records.
    fn provider_name(&self) -> &'static str {
        "sampler"
    }
}

#[async_trait::async_trait]
impl Sampler for OllamaSampler {
    async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        OllamaSampler::generate(self, req).await
    }

    fn provider_name(&self) -> &'static str {
        "ollama"
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Wraps a sampler with retry/backoff and usage recording.
pub struct SamplerGateway<S: Sampler, U: UsageSinkTrait> {
    inner: S,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<S: Sampler, U: UsageSinkTrait> Sampler for SamplerGateway<S, U> {
    async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        SamplerGateway::sample(self, req).await
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }
}

impl<S: Sampler, U: UsageSinkTrait> SamplerGateway<S, U> {
    pub fn new(inner: S, usage_sink: Arc<U>) -> Self {
        Self::with_config(inner, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(inner: S, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            inner,
            usage_sink,
            config,
        }
    }

    pub async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.inner.sample(req).await {
                Ok(resp) => {
                    let record = self
                        .base_record(req, attempt)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self.base_record(req, attempt).error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        http_status = ?err.context().and_then(|c| c.http_status),
                        error = %err,
                        "retrying sampler call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::provider(self.inner.provider_name(), "unknown error", false)
        }))
    }

    fn base_record(&self, req: &SampleRequest, attempt: u32) -> CallRecord {
        CallRecord::new(
            self.inner.provider_name(),
            req.model.clone(),
            req.attribution.caller,
        )
        .attempt(attempt)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Flaky {
        failures_left: AtomicU32,
        retryable: bool,
    }

    #[async_trait::async_trait]
    impl Sampler for Flaky {
        async fn sample(&self, _req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::provider("flaky", "boom", self.retryable));
            }
            Ok(SampleResponse {
                content: "ok".into(),
                input_tokens: Some(3),
                output_tokens: Some(1),
                latency: Duration::from_millis(5),
            })
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<CallRecord>>);

    #[async_trait::async_trait]
    impl UsageSinkTrait for Recording {
        async fn record(&self, record: CallRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn req() -> SampleRequest {
        SampleRequest::new("m", "sys", "user", Attribution::new("test"))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_and_records_each_attempt() {
        let sink = Arc::new(Recording::default());
        let gw = SamplerGateway::with_config(
            Flaky {
                failures_left: AtomicU32::new(2),
                retryable: true,
            },
            sink.clone(),
            GatewayConfig {
                max_retries: 2,
                retry_base_delay: Duration::from_millis(10),
            },
        );

        let resp = gw.sample(&req()).await.unwrap();
        assert_eq!(resp.content, "ok");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, CallStatus::Error);
        assert_eq!(records[2].status, CallStatus::Success);
        assert_eq!(records[2].attempt, 2);
        assert_eq!(records[2].input_tokens, Some(3));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let sink = Arc::new(Recording::default());
        let gw = SamplerGateway::with_config(
            Flaky {
                failures_left: AtomicU32::new(1),
                retryable: false,
            },
            sink.clone(),
            GatewayConfig {
                max_retries: 3,
                retry_base_delay: Duration::from_millis(10),
            },
        );

        let err = gw.sample(&req()).await.unwrap_err();
        assert_eq!(err.code(), "provider_error");
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
    }
}
