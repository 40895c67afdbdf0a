//! Chat turns: session store + context builder + sampler.

use std::sync::Arc;

use serde::Serialize;

use crate::agent::Agent;
use crate::gateway::Sampler;
use crate::pedal::{Pedal, PedalError};
use crate::session::{
    build_chat_prompt, CharRatioEstimator, ChatMessage, ChatSession, ContextBudget, Role,
    SessionError, SessionStore, TokenEstimator,
};
use crate::types::{Knobs, Signal};

/// Source tag of the signal built from a session's opening message.
pub const CHAT_SESSION_SOURCE: &str = "chat-session";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Pedal(#[from] PedalError),
    #[error("task join error: {0}")]
    Join(String),
}

/// A session after a turn, plus the reply produced by that turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub session: ChatSession,
    pub response: Option<String>,
}

#[derive(Clone)]
pub struct ChatService {
    store: SessionStore,
    pedal: Pedal,
    sampler: Arc<dyn Sampler>,
    budget: ContextBudget,
    estimator: Arc<dyn TokenEstimator>,
    agent_id: String,
}

impl ChatService {
    pub fn new(store: SessionStore, pedal: Pedal, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            store,
            pedal,
            sampler,
            budget: ContextBudget::default(),
            estimator: Arc::new(CharRatioEstimator::default()),
            agent_id: "twistedpair".into(),
        }
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn agent_for(&self, session: &ChatSession) -> Agent {
        Agent::new(
            self.agent_id.clone(),
            session.model_name(),
            self.pedal,
            self.sampler.clone(),
        )
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&SessionStore) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ChatError::Join(e.to_string()))?
            .map_err(ChatError::from)
    }

    /// Create a session. With an opening message, the message is distorted
    /// as a plain signal (no history yet) and both sides are recorded.
    pub async fn start(
        &self,
        knobs: Knobs,
        model_name: &str,
        parent_signal_id: Option<String>,
        initial_message: Option<&str>,
    ) -> Result<ChatTurn, ChatError> {
        let model = model_name.to_string();
        let session = self
            .with_store(move |s| s.create(knobs, model, parent_signal_id))
            .await?;

        let Some(message) = initial_message.filter(|m| !m.trim().is_empty()) else {
            return Ok(ChatTurn {
                session,
                response: None,
            });
        };

        let lock = self.store.turn_lock(session.session_id())?;
        let _turn = lock.lock().await;

        let signal = Signal::new(message, CHAT_SESSION_SOURCE)
            .with_metadata("session_id", session.session_id().into());
        let output = self.agent_for(&session).run(&signal, &knobs).await?;

        let id = session.session_id().to_string();
        let user = message.to_string();
        let reply = output.response.clone();
        let session = self
            .with_store(move |s| {
                s.append_messages(
                    &id,
                    &[(Role::User, user.as_str()), (Role::Assistant, reply.as_str())],
                )
            })
            .await?;

        Ok(ChatTurn {
            session,
            response: Some(output.response),
        })
    }

    /// Continue a session. Turns on one session run one at a time.
    pub async fn follow_up(&self, session_id: &str, message: &str) -> Result<ChatTurn, ChatError> {
        let lock = self.store.turn_lock(session_id)?;
        let _turn = lock.lock().await;

        let id = session_id.to_string();
        let session = self.with_store(move |s| s.require(&id)).await?;

        let prompt = build_chat_prompt(
            &self.pedal,
            &session,
            message,
            &self.budget,
            self.estimator.as_ref(),
        )?;
        let response = self
            .agent_for(&session)
            .sample_text(&prompt, "chat::follow_up")
            .await;

        let id = session_id.to_string();
        let user = message.to_string();
        let reply = response.clone();
        let session = self
            .with_store(move |s| {
                s.append_messages(
                    &id,
                    &[(Role::User, user.as_str()), (Role::Assistant, reply.as_str())],
                )
            })
            .await?;

        tracing::debug!(session_id, turns = session.turn_count(), "chat turn complete");
        Ok(ChatTurn {
            session,
            response: Some(response),
        })
    }

    pub async fn fork(&self, session_id: &str, knobs: Knobs) -> Result<ChatSession, ChatError> {
        let id = session_id.to_string();
        self.with_store(move |s| s.fork(&id, knobs)).await
    }

    pub async fn session(&self, session_id: &str) -> Result<ChatSession, ChatError> {
        let id = session_id.to_string();
        self.with_store(move |s| s.require(&id)).await
    }

    /// Message list for display.
    pub async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        Ok(self.session(session_id).await?.messages().to_vec())
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), ChatError> {
        let id = session_id.to_string();
        self.with_store(move |s| s.delete(&id)).await
    }

    pub async fn cleanup_expired(&self) -> Result<usize, ChatError> {
        self.with_store(|s| s.cleanup_expired()).await
    }

    /// Sessions held in memory.
    pub fn active_sessions(&self) -> usize {
        self.store.len()
    }
}
