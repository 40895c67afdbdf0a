//! The distortion pedal: gain → sampling parameters, and Signal + Knobs → Prompt.
//!
//! Pure, provider-agnostic prompt construction. Every mode and tone has
//! exactly one instruction string in a fixed-size table sized by the
//! enumeration, so adding a variant without a table row fails to compile.

use serde::{Deserialize, Serialize};

use crate::types::{Knobs, Metadata, Mode, Prompt, Signal, Tone, GAIN_MAX, GAIN_MIN};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PedalError {
    #[error("invalid knobs: {0}")]
    InvalidKnobs(String),
    #[error("missing {table} table entry for '{key}'")]
    MissingTableEntry { table: &'static str, key: String },
}

// =============================================================================
// Parameter mapper
// =============================================================================

/// Inclusive `[min, max]` interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T> Range<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

/// Configured ranges the gain knob interpolates across.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingRanges {
    pub temperature: Range<f64>,
    pub top_k: Range<u32>,
    pub top_p: Range<f64>,
    pub gain: Range<u8>,
}

impl Default for SamplingRanges {
    fn default() -> Self {
        Self {
            temperature: Range::new(0.1, 2.0),
            top_k: Range::new(5, 120),
            top_p: Range::new(0.50, 0.98),
            gain: Range::new(GAIN_MIN, GAIN_MAX),
        }
    }
}

impl SamplingRanges {
    /// Reject inverted or empty ranges.
    pub fn validate(&self) -> Result<(), PedalError> {
        if self.gain.max <= self.gain.min {
            return Err(PedalError::InvalidKnobs(format!(
                "gain range [{}, {}] is empty",
                self.gain.min, self.gain.max
            )));
        }
        if self.gain.min < GAIN_MIN || self.gain.max > GAIN_MAX {
            return Err(PedalError::InvalidKnobs(format!(
                "gain range must lie within [{GAIN_MIN}, {GAIN_MAX}]"
            )));
        }
        if self.temperature.max < self.temperature.min
            || self.top_k.max < self.top_k.min
            || self.top_p.max < self.top_p.min
        {
            return Err(PedalError::InvalidKnobs(
                "sampling range has max below min".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gain_to_temperature(&self, gain: u8) -> Result<f64, PedalError> {
        let t = self.interpolate(self.temperature.min, self.temperature.max, gain)?;
        Ok(round2(t))
    }

    pub fn gain_to_top_k(&self, gain: u8) -> Result<u32, PedalError> {
        let k = self.interpolate(f64::from(self.top_k.min), f64::from(self.top_k.max), gain)?;
        Ok(k.round() as u32)
    }

    pub fn gain_to_top_p(&self, gain: u8) -> Result<f64, PedalError> {
        let p = self.interpolate(self.top_p.min, self.top_p.max, gain)?;
        Ok(round2(p))
    }

    fn interpolate(&self, low: f64, high: f64, gain: u8) -> Result<f64, PedalError> {
        if gain < self.gain.min || gain > self.gain.max {
            return Err(PedalError::InvalidKnobs(format!(
                "gain {gain} outside [{}, {}]",
                self.gain.min, self.gain.max
            )));
        }
        let span = f64::from(self.gain.max - self.gain.min);
        if span == 0.0 {
            return Err(PedalError::InvalidKnobs("gain range is empty".to_string()));
        }
        let steps = f64::from(gain - self.gain.min);
        Ok(low + (high - low) / span * steps)
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// =============================================================================
// Instruction tables
// =============================================================================

pub const MODE_INSTRUCTIONS: [(Mode, &str); Mode::COUNT] = [
    (
        Mode::InvertEr,
        "Act like a nay-sayer. Flip the polarity. Negate user claims, point out missing information, \
         and provide counterarguments without hedging. Challenge assumptions directly and state objections plainly.",
    ),
    (
        Mode::SoWhatEr,
        "Ask 'so what?'. Interrogate the signal. Explore implications, consequences, \
         and downstream effects. Focus on impact and trade-offs. Don't just describe; provoke and probe.",
    ),
    (
        Mode::EchoEr,
        "Act like an amplifier with reverb. Exaggerate, highlight strengths, \
         and build momentum around the signal. Be boldly enthusiastic. Dismiss doubts.",
    ),
    (
        Mode::WhatIfEr,
        "Ask 'what if?'. Hypothesize new ideas. Explore alternative scenarios, contingencies, and imaginative possibilities. \
         Encourage speculative branching. Venture beyond obvious alternatives.",
    ),
    (
        Mode::CucumbEr,
        "Act like a cucumber. Stay cool, detached, logical, and analytical. Provide structured, balanced, and evidence-oriented commentary. \
         Avoid emotional language or exaggeration.",
    ),
    (
        Mode::ArchivEr,
        "Act like a librarian. Bring historical context and prior works into the analysis. Compare the signal to past events, \
         literature, or inventions. Highlight parallels and lessons from history. Cite specific events, figures, or works by name.",
    ),
];

pub const TONE_STYLES: [(Tone, &str); Tone::COUNT] = [
    (
        Tone::Neutral,
        "Use clear, standard English. Be concise, balanced, and accessible. \
         Avoid jargon or excessive flourish.",
    ),
    (
        Tone::Technical,
        "Use precise, jargon-heavy language. Adopt a scientific or engineering register. \
         Focus on definitions, mechanisms, and structured analysis. Avoid layman explanations.",
    ),
    (
        Tone::Primal,
        "Use short, punchy, aggressive words. Keep sentences tight and visceral. \
         Deliver raw impact with minimal polish. No complete sentences if fragments work.",
    ),
    (
        Tone::Poetic,
        "Use lyrical, metaphor-rich, and mystical language. Employ rhythm, imagery, and symbolic phrasing. \
         Convey ideas as visions or allegories.",
    ),
    (
        Tone::Satirical,
        "Use witty, ironic, and humorous language. Employ exaggeration, parody, or playful mockery. \
         Highlight absurdities and contradictions with levity. Think late-night monologue or The Onion.",
    ),
];

const ROLE_FRAMING: &str =
    "You are a distortion pedal that transforms signals using explicit rhetorical operations.";

const CLOSING_GUIDANCE: &str = "- Never restate the same conclusion twice. Eliminate redundancy.\n\
- Produce 1-2 tight paragraphs or 3-5 bullet points max, whichever is sharper.\n\
- Keep facts grounded in the input signal unless hypothetical is requested by operation.";

const TASK_FRAMING: &str = "Task:\nApply the operation and style above to this signal. \
If the signal is ambiguous, state the most probable interpretation, then proceed.";

pub fn mode_instruction(mode: Mode) -> Result<&'static str, PedalError> {
    MODE_INSTRUCTIONS
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, text)| *text)
        .ok_or_else(|| PedalError::MissingTableEntry {
            table: "mode",
            key: mode.to_string(),
        })
}

pub fn tone_style(tone: Tone) -> Result<&'static str, PedalError> {
    TONE_STYLES
        .iter()
        .find(|(t, _)| *t == tone)
        .map(|(_, text)| *text)
        .ok_or_else(|| PedalError::MissingTableEntry {
            table: "tone",
            key: tone.to_string(),
        })
}

// =============================================================================
// Prompt builder
// =============================================================================

/// Builds prompts from signals. Holds the configured sampling ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pedal {
    ranges: SamplingRanges,
}

impl Pedal {
    pub fn new(ranges: SamplingRanges) -> Result<Self, PedalError> {
        ranges.validate()?;
        Ok(Self { ranges })
    }

    pub fn ranges(&self) -> &SamplingRanges {
        &self.ranges
    }

    /// Render the system prompt for a knob setting (mode + tone + fixed guidance).
    pub fn system_prompt(&self, knobs: &Knobs) -> Result<String, PedalError> {
        let mode_text = mode_instruction(knobs.mode())?;
        let tone_text = tone_style(knobs.tone())?;
        Ok(format!(
            "{ROLE_FRAMING}\nOperation: {}\nStyle: {}\nGuidance:\n- {mode_text}\n- {tone_text}\n{CLOSING_GUIDANCE}",
            knobs.mode(),
            knobs.tone(),
        ))
    }

    /// Build the full prompt for one signal under one knob setting.
    ///
    /// Deterministic: the same signal and knobs always render the same prompt.
    pub fn distort(&self, signal: &Signal, knobs: &Knobs) -> Result<Prompt, PedalError> {
        let system = self.system_prompt(knobs)?;
        let user = format!("Signal:\n{}\n\n{TASK_FRAMING}", signal.content);

        let gain = knobs.gain();
        let temperature = self.ranges.gain_to_temperature(gain)?;
        let top_k = self.ranges.gain_to_top_k(gain)?;
        let top_p = self.ranges.gain_to_top_p(gain)?;

        let mut metadata = Metadata::new();
        metadata.insert("signal_id".into(), signal.id.clone().into());
        metadata.insert("source".into(), signal.source.clone().into());
        metadata.insert("captured_at".into(), signal.captured_at.clone().into());
        metadata.insert("tags".into(), serde_json::json!(signal.tags));
        metadata.insert("knobs".into(), knobs.to_json());

        Ok(Prompt {
            system,
            user,
            temperature,
            top_k,
            top_p,
            metadata,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
