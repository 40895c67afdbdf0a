//! Core value types: signals, knob settings, prompts, and agent outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pedal::PedalError;

/// Open key-value map used for signal metadata, prompt metadata and provenance.
///
/// A `BTreeMap` keeps key order stable so rendered prompts and archived
/// records are byte-for-byte reproducible.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lowest accepted gain setting.
pub const GAIN_MIN: u8 = 1;
/// Highest accepted gain setting.
pub const GAIN_MAX: u8 = 10;

// =============================================================================
// Mode / Tone
// =============================================================================

/// Rhetorical operation applied to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Negates claims, flips polarity, points out missing information.
    InvertEr,
    /// Interrogates implications and downstream consequences.
    SoWhatEr,
    /// Amplifies and builds momentum around the signal.
    EchoEr,
    /// Hypothesizes alternative scenarios.
    WhatIfEr,
    /// Cool-headed academic analysis.
    CucumbEr,
    /// Historical context and prior works.
    ArchivEr,
}

impl Mode {
    pub const COUNT: usize = 6;

    pub const ALL: [Mode; Mode::COUNT] = [
        Mode::InvertEr,
        Mode::SoWhatEr,
        Mode::EchoEr,
        Mode::WhatIfEr,
        Mode::CucumbEr,
        Mode::ArchivEr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::InvertEr => "invert_er",
            Mode::SoWhatEr => "so_what_er",
            Mode::EchoEr => "echo_er",
            Mode::WhatIfEr => "what_if_er",
            Mode::CucumbEr => "cucumb_er",
            Mode::ArchivEr => "archiv_er",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = PedalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PedalError::InvalidKnobs(format!("unknown mode '{s}'")))
    }
}

/// Stylistic register for the rewritten output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Neutral,
    Technical,
    Primal,
    Poetic,
    Satirical,
}

impl Tone {
    pub const COUNT: usize = 5;

    pub const ALL: [Tone; Tone::COUNT] = [
        Tone::Neutral,
        Tone::Technical,
        Tone::Primal,
        Tone::Poetic,
        Tone::Satirical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Neutral => "neutral",
            Tone::Technical => "technical",
            Tone::Primal => "primal",
            Tone::Poetic => "poetic",
            Tone::Satirical => "satirical",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = PedalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PedalError::InvalidKnobs(format!("unknown tone '{s}'")))
    }
}

// =============================================================================
// Knobs
// =============================================================================

/// The (mode, tone, gain) triple controlling how a signal is rewritten.
///
/// Gain is validated on construction and on deserialization, so a `Knobs`
/// value always satisfies `GAIN_MIN <= gain <= GAIN_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawKnobs")]
pub struct Knobs {
    mode: Mode,
    tone: Tone,
    gain: u8,
}

#[derive(Deserialize)]
struct RawKnobs {
    mode: Mode,
    tone: Tone,
    gain: i64,
}

impl TryFrom<RawKnobs> for Knobs {
    type Error = PedalError;

    fn try_from(raw: RawKnobs) -> Result<Self, Self::Error> {
        let gain = u8::try_from(raw.gain)
            .map_err(|_| PedalError::InvalidKnobs(format!("gain {} out of range", raw.gain)))?;
        Knobs::new(raw.mode, raw.tone, gain)
    }
}

impl Knobs {
    pub fn new(mode: Mode, tone: Tone, gain: u8) -> Result<Self, PedalError> {
        if !(GAIN_MIN..=GAIN_MAX).contains(&gain) {
            return Err(PedalError::InvalidKnobs(format!(
                "gain {gain} outside [{GAIN_MIN}, {GAIN_MAX}]"
            )));
        }
        Ok(Self { mode, tone, gain })
    }

    /// Compile-time knob presets. Panics during const evaluation if `gain` is out of range.
    pub(crate) const fn preset(mode: Mode, tone: Tone, gain: u8) -> Self {
        assert!(gain >= GAIN_MIN && gain <= GAIN_MAX);
        Self { mode, tone, gain }
    }

    /// Parse knobs from their string labels, e.g. `("invert_er", "satirical", 4)`.
    pub fn parse(mode: &str, tone: &str, gain: i64) -> Result<Self, PedalError> {
        Knobs::try_from(RawKnobs {
            mode: mode.parse()?,
            tone: tone.parse()?,
            gain,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tone(&self) -> Tone {
        self.tone
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }

    /// `mode/tone/g<gain>` label used in summaries and logs.
    pub fn label(&self) -> String {
        format!("{}/{}/g{}", self.mode, self.tone, self.gain)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": self.mode.as_str(),
            "tone": self.tone.as_str(),
            "gain": self.gain,
        })
    }
}

// =============================================================================
// Signal
// =============================================================================

/// A unit of captured input text with source, time and tag metadata.
///
/// Signals are never edited in place; enrichment builds a new `Signal` that
/// keeps the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub content: String,
    /// Origin tag, e.g. `screenpipe://window/Chrome`.
    pub source: String,
    /// ISO-8601 UTC capture time.
    pub captured_at: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Signal {
    /// New signal with a random identifier captured now.
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            source: source.into(),
            captured_at: Utc::now().to_rfc3339(),
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// =============================================================================
// Prompt / AgentOutput
// =============================================================================

/// System + user text with sampling parameters, derived from a Signal + Knobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub metadata: Metadata,
}

/// One sampler invocation's result; the unit of archival storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub knobs: Knobs,
    pub signal_id: String,
    /// Generated text, or an inline `[Error: ...]` marker when sampling failed.
    pub response: String,
    /// Label such as `invert_er/satirical`; not chain-of-thought.
    pub reasoning_style: String,
    pub model_info: Metadata,
    pub created_at: DateTime<Utc>,
    pub provenance: Metadata,
}

impl AgentOutput {
    pub fn is_error(&self) -> bool {
        self.response.starts_with("[Error:")
    }
}
