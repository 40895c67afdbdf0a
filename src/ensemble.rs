//! Ensemble runner: one signal through many knob settings.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::pedal::PedalError;
use crate::types::{AgentOutput, Knobs, Metadata, Mode, Signal, Tone};

/// Source tag given to captures that arrive without one.
pub const MANUAL_SOURCE: &str = "manual://input";

/// One completed run: the signal, its outputs, and the rendered summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub signal: Signal,
    pub outputs: Vec<AgentOutput>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// The six-voice default ensemble, in rendering order.
pub const DEFAULT_KNOB_SETS: [Knobs; 6] = [
    Knobs::preset(Mode::InvertEr, Tone::Satirical, 4),
    Knobs::preset(Mode::SoWhatEr, Tone::Neutral, 3),
    Knobs::preset(Mode::EchoEr, Tone::Poetic, 5),
    Knobs::preset(Mode::WhatIfEr, Tone::Primal, 6),
    Knobs::preset(Mode::CucumbEr, Tone::Technical, 2),
    Knobs::preset(Mode::ArchivEr, Tone::Technical, 3),
];

/// Knob setting used when a signal is processed outside ensemble mode.
pub const SINGLE_KNOBS: Knobs = Knobs::preset(Mode::SoWhatEr, Tone::Neutral, 3);

pub fn default_knob_sets() -> Vec<Knobs> {
    DEFAULT_KNOB_SETS.to_vec()
}

/// One knob setting per mode, all sharing `tone` and `gain`.
pub fn all_modes(tone: Tone, gain: u8) -> Result<Vec<Knobs>, PedalError> {
    Mode::ALL
        .iter()
        .map(|&mode| Knobs::new(mode, tone, gain))
        .collect()
}

/// Run `signal` through every knob setting, returning outputs in input order.
///
/// All prompts are built before any sampling starts, so a bad knob setting
/// fails the call without spending sampler time. Sampling runs with the
/// agent's parallelism; `buffered` keeps results in input order.
pub async fn run_ensemble(
    agent: &Agent,
    signal: &Signal,
    knob_sets: &[Knobs],
) -> Result<Vec<AgentOutput>, PedalError> {
    let prompts = knob_sets
        .iter()
        .map(|knobs| agent.pedal().distort(signal, knobs).map(|p| (*knobs, p)))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(
        signal_id = %signal.id,
        voices = prompts.len(),
        parallelism = agent.parallelism(),
        "running ensemble"
    );

    let outputs = stream::iter(prompts)
        .map(|(knobs, prompt)| async move { agent.complete(signal, &knobs, prompt).await })
        .buffered(agent.parallelism())
        .collect::<Vec<_>>()
        .await;

    Ok(outputs)
}

/// Compact summary: one `- [agent_id:mode/tone/g<gain>] response` line per output.
pub fn braid(outputs: &[AgentOutput]) -> String {
    outputs
        .iter()
        .map(|o| format!("- [{}:{}] {}", o.agent_id, o.knobs.label(), o.response.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run one signal either through the default ensemble or the single voice.
pub async fn process_signal(
    agent: &Agent,
    signal: Signal,
    ensemble: bool,
) -> Result<RunRecord, PedalError> {
    let (outputs, summary) = if ensemble {
        let outputs = run_ensemble(agent, &signal, &default_knob_sets()).await?;
        let summary = braid(&outputs);
        (outputs, summary)
    } else {
        let output = agent.run(&signal, &SINGLE_KNOBS).await?;
        let summary = output.response.clone();
        (vec![output], summary)
    };

    Ok(RunRecord {
        signal,
        outputs,
        summary,
        created_at: Utc::now(),
    })
}

/// A raw capture as it arrives from a collector. Unknown fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capture {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub captured_at: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: Metadata,
}

impl Capture {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Turn a raw capture into a Signal with a fresh identifier.
pub fn normalize_capture(raw: Capture) -> Signal {
    let mut signal = Signal::new(raw.text, raw.source.unwrap_or_else(|| MANUAL_SOURCE.into()));
    if let Some(captured_at) = raw.captured_at {
        signal.captured_at = captured_at;
    }
    signal.tags = raw.tags;
    signal.metadata = raw.extra;
    signal
}
