//! Chat context builder: session history plus a new message as one prompt.
//!
//! Pure text assembly; no I/O. Token counts come from a pluggable estimator
//! and are approximate with the default estimator (4 characters per token).

use tiktoken_rs::CoreBPE;

use super::{ChatSession, Role};
use crate::pedal::{Pedal, PedalError};
use crate::types::{Metadata, Prompt, Signal};

pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 30_000;
pub const DEFAULT_MIN_KEPT_LINES: usize = 6;

const CONTINUE_FRAMING: &str = "Continue the conversation by responding to the most recent user message. Maintain consistency with the conversation history and your assigned rhetorical mode.";

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `chars / ratio`, rounded down.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count() / self.chars_per_token
    }
}

#[derive(Debug, thiserror::Error)]
#[error("tokenizer unavailable: {0}")]
pub struct TokenizerError(String);

/// cl100k_base token counts.
pub struct TiktokenEstimator {
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    pub fn cl100k() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| TokenizerError(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Token ceiling for system prompt plus conversation, and the number of
/// most recent lines that survive truncation regardless of the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub min_kept_lines: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            min_kept_lines: DEFAULT_MIN_KEPT_LINES,
        }
    }
}

/// Build the prompt for the next turn of `session`.
///
/// The system text and sampling parameters come from the prompt builder run
/// over a throwaway signal; the user text is the rendered conversation.
pub fn build_chat_prompt(
    pedal: &Pedal,
    session: &ChatSession,
    new_message: &str,
    budget: &ContextBudget,
    estimator: &dyn TokenEstimator,
) -> Result<Prompt, PedalError> {
    let scratch = Signal {
        id: "chat-context".into(),
        content: new_message.to_string(),
        source: "chat".into(),
        captured_at: String::new(),
        tags: Vec::new(),
        metadata: Metadata::new(),
    };
    let base = pedal.distort(&scratch, session.knobs())?;

    let mut lines: Vec<String> = session
        .messages()
        .iter()
        .map(|m| render_line(m.role, &m.content))
        .collect();
    lines.push(render_line(Role::User, new_message));

    let mut conversation = lines.join("\n\n");
    if estimator.estimate(&base.system) + estimator.estimate(&conversation) > budget.max_tokens {
        conversation = truncate_conversation(&lines, &base.system, budget, estimator);
    }

    let mut metadata = Metadata::new();
    metadata.insert("session_id".into(), session.session_id().into());
    metadata.insert("turn_count".into(), session.turn_count().into());

    Ok(Prompt {
        system: base.system,
        user: format!("Previous conversation:\n\n{conversation}\n\n{CONTINUE_FRAMING}"),
        temperature: base.temperature,
        top_k: base.top_k,
        top_p: base.top_p,
        metadata,
    })
}

fn render_line(role: Role, content: &str) -> String {
    match role {
        Role::User => format!("User: {content}"),
        Role::Assistant => format!("Assistant: {content}"),
    }
}

/// Keep the newest lines that fit the budget, never fewer than
/// `min_kept_lines`, and note how many were dropped.
fn truncate_conversation(
    lines: &[String],
    system: &str,
    budget: &ContextBudget,
    estimator: &dyn TokenEstimator,
) -> String {
    let available = budget.max_tokens.saturating_sub(estimator.estimate(system));
    let min_keep = budget.min_kept_lines.min(lines.len());

    let mut kept = 0usize;
    let mut used = 0usize;
    for line in lines.iter().rev() {
        let cost = estimator.estimate(line);
        if used + cost > available && kept >= min_keep {
            break;
        }
        kept += 1;
        used += cost;
    }

    let dropped = lines.len() - kept;
    let mut out: Vec<String> = Vec::with_capacity(kept + 1);
    if dropped > 0 {
        out.push(format!(
            "[... {dropped} earlier messages truncated for context limit ...]"
        ));
    }
    out.extend(lines[dropped..].iter().cloned());
    out.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Knobs, Mode, Tone};
    use chrono::Utc;

    fn session_with(turns: usize) -> ChatSession {
        let knobs = Knobs::new(Mode::WhatIfEr, Tone::Primal, 6).unwrap();
        let mut s = ChatSession::new(knobs, "m", None, Utc::now());
        for i in 0..turns {
            s.add_message(Role::User, format!("question {i}"));
            s.add_message(Role::Assistant, format!("answer {i}"));
        }
        s
    }

    #[test]
    fn renders_history_in_order_with_new_message_last() {
        let s = session_with(1);
        let p = build_chat_prompt(
            &Pedal::default(),
            &s,
            "next?",
            &ContextBudget::default(),
            &CharRatioEstimator::default(),
        )
        .unwrap();

        assert!(p.user.starts_with(
            "Previous conversation:\n\nUser: question 0\n\nAssistant: answer 0\n\nUser: next?\n\n"
        ));
        assert!(p.user.ends_with(CONTINUE_FRAMING));
        assert!(!p.user.contains("truncated"));
        assert_eq!(p.metadata["turn_count"], 2);
        assert_eq!(p.metadata["session_id"], s.session_id());
    }

    #[test]
    fn reuses_builder_system_text_and_sampling() {
        let pedal = Pedal::default();
        let s = session_with(0);
        let p = build_chat_prompt(
            &pedal,
            &s,
            "hi",
            &ContextBudget::default(),
            &CharRatioEstimator::default(),
        )
        .unwrap();
        let direct = pedal.distort(&Signal::new("hi", "x"), s.knobs()).unwrap();
        assert_eq!(p.system, direct.system);
        assert_eq!(p.temperature, direct.temperature);
        assert_eq!(p.top_k, direct.top_k);
        assert_eq!(p.top_p, direct.top_p);
    }

    #[test]
    fn tiny_budget_keeps_last_six_lines_and_notes_drop() {
        let s = session_with(10); // 20 lines + the new one
        let budget = ContextBudget {
            max_tokens: 1,
            min_kept_lines: 6,
        };
        let p = build_chat_prompt(&Pedal::default(), &s, "latest", &budget, &CharRatioEstimator::default())
            .unwrap();

        assert!(p
            .user
            .contains("[... 15 earlier messages truncated for context limit ...]"));
        assert!(p.user.contains("Assistant: answer 7"));
        assert!(!p.user.contains("User: question 7"));
        assert!(p.user.contains("User: latest"));
    }

    #[test]
    fn short_history_under_tiny_budget_is_kept_whole() {
        let s = session_with(1); // 2 lines + new = 3 <= 6
        let budget = ContextBudget {
            max_tokens: 1,
            min_kept_lines: 6,
        };
        let p = build_chat_prompt(&Pedal::default(), &s, "latest", &budget, &CharRatioEstimator::default())
            .unwrap();
        assert!(!p.user.contains("truncated"));
        assert!(p.user.contains("User: question 0"));
    }

    #[test]
    fn truncation_keeps_what_fits_beyond_minimum() {
        let lines: Vec<String> = (0..10).map(|i| format!("User: {i:0>7}")).collect(); // 13 chars -> 3 tokens
        let budget = ContextBudget {
            max_tokens: 24,
            min_kept_lines: 2,
        };
        let text = truncate_conversation(&lines, "", &budget, &CharRatioEstimator::default());
        assert!(text.starts_with("[... 2 earlier messages truncated for context limit ...]"));
        assert!(text.ends_with("User: 0000009"));
    }

    #[test]
    fn char_ratio_counts_chars_not_bytes() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate("ééééé"), 1);
        assert_eq!(est.estimate("abcdefgh"), 2);
    }
}
