//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every sampler call through a UsageSink, which keeps
//! the gateway independent of where call records end up:
//! - the CLI uses TracingUsageSink (structured log lines)
//! - tests use NoopUsageSink or a recording sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Status of a sampler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one sampler call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Provider name: "ollama", ...
    pub provider: &'static str,
    /// Model used.
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: u64,
    /// Zero-based attempt number within the gateway's retry loop.
    pub attempt: u32,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: None,
            output_tokens: None,
            latency_ms: 0,
            attempt: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: Option<u32>, output: Option<u32>) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording sampler call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a call. Fire-and-forget: failures are logged, never propagated.
    async fn record(&self, record: CallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CallRecord) {
        // Discard
    }
}

/// Usage sink that emits one `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: CallRecord) {
        tracing::info!(
            provider = record.provider,
            model = %record.model,
            caller = record.caller,
            attempt = record.attempt,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            input_tokens = record.input_tokens.unwrap_or(0),
            output_tokens = record.output_tokens.unwrap_or(0),
            latency_ms = record.latency_ms,
            "sampler call"
        );
    }
}
