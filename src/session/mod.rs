//! Multi-turn chat sessions bound to one knob setting.

pub mod context;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Knobs;

pub use context::{
    build_chat_prompt, CharRatioEstimator, ContextBudget, TiktokenEstimator, TokenEstimator,
};
pub use store::{
    JsonDirSessionBackend, SessionBackend, SessionError, SessionStore, SqliteSessionBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation under fixed knobs. History is append-only; the store is the
/// only place sessions are created, forked or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    session_id: String,
    knobs: Knobs,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    parent_signal_id: Option<String>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    model_name: String,
}

impl ChatSession {
    pub(crate) fn new(
        knobs: Knobs,
        model_name: impl Into<String>,
        parent_signal_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            knobs,
            messages: Vec::new(),
            parent_signal_id,
            created_at: now,
            last_active: now,
            model_name: model_name.into(),
        }
    }

    /// New session carrying a copy of this one's history under new knobs.
    pub(crate) fn fork(&self, knobs: Knobs, now: DateTime<Utc>) -> Self {
        let mut forked = Self::new(
            knobs,
            self.model_name.clone(),
            self.parent_signal_id.clone(),
            now,
        );
        forked.messages = self.messages.clone();
        forked
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn knobs(&self) -> &Knobs {
        &self.knobs
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn parent_signal_id(&self) -> Option<&str> {
        self.parent_signal_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn turn_count(&self) -> usize {
        self.messages.len()
    }

    /// Append a message stamped now.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.add_message_at(role, content, Utc::now());
    }

    /// Append a message stamped `at`; `last_active` moves to `at`.
    pub fn add_message_at(&mut self, role: Role, content: impl Into<String>, at: DateTime<Utc>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
            timestamp: at,
        });
        self.last_active = at;
    }

    /// Idle longer than `idle_timeout` as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now - self.last_active > idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mode, Tone};

    fn knobs() -> Knobs {
        Knobs::new(Mode::SoWhatEr, Tone::Neutral, 3).unwrap()
    }

    #[test]
    fn add_message_updates_last_active() {
        let t0 = Utc::now() - chrono::Duration::hours(1);
        let mut s = ChatSession::new(knobs(), "m", None, t0);
        let t1 = t0 + chrono::Duration::minutes(5);
        s.add_message_at(Role::User, "hi", t1);
        assert_eq!(s.last_active(), t1);
        assert_eq!(s.created_at(), t0);
        assert_eq!(s.messages()[0].role, Role::User);
    }

    #[test]
    fn fork_copies_history_not_identity() {
        let now = Utc::now();
        let mut s = ChatSession::new(knobs(), "m", Some("sig".into()), now);
        s.add_message_at(Role::User, "a", now);
        let other = Knobs::new(Mode::InvertEr, Tone::Satirical, 9).unwrap();
        let mut f = s.fork(other, now);

        assert_ne!(f.session_id(), s.session_id());
        assert_eq!(f.messages(), s.messages());
        assert_eq!(f.parent_signal_id(), Some("sig"));
        assert_eq!(f.knobs(), &other);

        f.add_message_at(Role::Assistant, "b", now);
        assert_eq!(s.messages().len(), 1);
    }

    #[test]
    fn expiry_is_strictly_greater_than_window() {
        let now = Utc::now();
        let s = ChatSession::new(knobs(), "m", None, now);
        let window = chrono::Duration::hours(2);
        assert!(!s.is_expired(now + window, window));
        assert!(s.is_expired(now + window + chrono::Duration::seconds(1), window));
    }

    #[test]
    fn serializes_role_lowercase() {
        let now = Utc::now();
        let mut s = ChatSession::new(knobs(), "m", None, now);
        s.add_message_at(Role::Assistant, "x", now);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["messages"][0]["role"], "assistant");
        assert_eq!(v["knobs"]["mode"], "so_what_er");
        let back: ChatSession = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
    }
}
