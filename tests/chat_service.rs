use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use twistedpair::chat::{ChatError, ChatService, CHAT_SESSION_SOURCE};
use twistedpair::gateway::{ProviderError, SampleRequest, SampleResponse, Sampler};
use twistedpair::session::{ContextBudget, Role, SessionError, SessionStore};
use twistedpair::types::{Knobs, Mode, Tone};
use twistedpair::Pedal;

/// Records every request and answers with a running counter.
#[derive(Default)]
struct RecordingSampler {
    requests: Mutex<Vec<SampleRequest>>,
}

#[async_trait]
impl Sampler for RecordingSampler {
    async fn sample(&self, req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(req.clone());
            requests.len()
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(SampleResponse {
            content: format!("reply {n}"),
            input_tokens: None,
            output_tokens: None,
            latency: Duration::from_millis(5),
        })
    }
}

struct Down;

#[async_trait]
impl Sampler for Down {
    async fn sample(&self, _req: &SampleRequest) -> Result<SampleResponse, ProviderError> {
        Err(ProviderError::Timeout(Duration::from_secs(120)))
    }
}

fn knobs() -> Knobs {
    Knobs::new(Mode::WhatIfEr, Tone::Primal, 6).unwrap()
}

fn service(dir: &std::path::Path, sampler: Arc<dyn Sampler>) -> ChatService {
    let store = SessionStore::open_json_dir(dir, chrono::Duration::hours(2)).unwrap();
    ChatService::new(store, Pedal::default(), sampler)
}

#[tokio::test]
async fn start_without_message_creates_empty_session() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler.clone());

    let turn = chat.start(knobs(), "gemma3:4b", Some("sig-1".into()), None).await.unwrap();

    assert!(turn.response.is_none());
    assert_eq!(turn.session.turn_count(), 0);
    assert_eq!(turn.session.model_name(), "gemma3:4b");
    assert!(sampler.requests.lock().unwrap().is_empty());
    assert_eq!(chat.active_sessions(), 1);
}

#[tokio::test]
async fn opening_message_is_distorted_as_a_plain_signal() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler.clone());

    let turn = chat
        .start(knobs(), "gemma3:4b", None, Some("What if cities banned cars?"))
        .await
        .unwrap();

    assert_eq!(turn.response.as_deref(), Some("reply 1"));
    let messages = turn.session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "What if cities banned cars?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "reply 1");

    let requests = sampler.requests.lock().unwrap();
    assert_eq!(requests[0].model, "gemma3:4b");
    assert!(requests[0].user.starts_with("Signal:\nWhat if cities banned cars?"));
    assert!(!requests[0].user.contains("Previous conversation"));
    assert_eq!(CHAT_SESSION_SOURCE, "chat-session");
}

#[tokio::test]
async fn follow_up_sends_history_and_persists_both_sides() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler.clone());

    let start = chat
        .start(knobs(), "m", None, Some("first question"))
        .await
        .unwrap();
    let id = start.session.session_id().to_string();

    let turn = chat.follow_up(&id, "second question").await.unwrap();
    assert_eq!(turn.response.as_deref(), Some("reply 2"));
    assert_eq!(turn.session.turn_count(), 4);

    let req = sampler.requests.lock().unwrap()[1].clone();
    assert!(req.user.starts_with(
        "Previous conversation:\n\nUser: first question\n\nAssistant: reply 1\n\nUser: second question"
    ));
    assert_eq!(req.temperature, 1.16);

    let reopened = service(dir.path(), sampler.clone());
    let history = reopened.history(&id).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[3].content, "reply 2");
}

#[tokio::test]
async fn concurrent_follow_ups_on_one_session_do_not_lose_turns() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler);

    let id = chat
        .start(knobs(), "m", None, None)
        .await
        .unwrap()
        .session
        .session_id()
        .to_string();

    let mut handles = Vec::new();
    for i in 0..5 {
        let chat = chat.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            chat.follow_up(&id, &format!("message {i}")).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let history = chat.history(&id).await.unwrap();
    assert_eq!(history.len(), 10);
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

#[tokio::test]
async fn follow_up_on_unknown_session_is_not_found() {
    let dir = tempdir().unwrap();
    let chat = service(dir.path(), Arc::new(RecordingSampler::default()));

    let err = chat.follow_up("no-such-session", "hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Session(SessionError::NotFound(_))));
    assert_eq!(chat.active_sessions(), 0);
    assert_eq!(chat.store().turn_lock_count(), 0);
}

#[tokio::test]
async fn sampler_failure_is_recorded_as_error_text() {
    let dir = tempdir().unwrap();
    let chat = service(dir.path(), Arc::new(Down));

    let id = chat
        .start(knobs(), "m", None, None)
        .await
        .unwrap()
        .session
        .session_id()
        .to_string();
    let turn = chat.follow_up(&id, "anyone there?").await.unwrap();

    let reply = turn.response.unwrap();
    assert!(reply.starts_with("[Error: "));
    assert_eq!(turn.session.messages()[1].content, reply);
}

#[tokio::test]
async fn forked_session_continues_independently() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler.clone());

    let source = chat
        .start(knobs(), "m", None, Some("opening"))
        .await
        .unwrap()
        .session;
    let other = Knobs::new(Mode::CucumbEr, Tone::Technical, 2).unwrap();
    let fork = chat.fork(source.session_id(), other).await.unwrap();
    assert_eq!(fork.messages(), source.messages());

    chat.follow_up(fork.session_id(), "in the fork").await.unwrap();

    assert_eq!(chat.history(source.session_id()).await.unwrap().len(), 2);
    assert_eq!(chat.history(fork.session_id()).await.unwrap().len(), 4);

    let last = sampler.requests.lock().unwrap().last().cloned().unwrap();
    assert!(last.system.contains("Operation: cucumb_er"));
}

#[tokio::test]
async fn small_budget_truncates_history_in_prompt_only() {
    let dir = tempdir().unwrap();
    let sampler = Arc::new(RecordingSampler::default());
    let chat = service(dir.path(), sampler.clone()).with_budget(ContextBudget {
        max_tokens: 1,
        min_kept_lines: 2,
    });

    let id = chat
        .start(knobs(), "m", None, Some("turn zero"))
        .await
        .unwrap()
        .session
        .session_id()
        .to_string();
    chat.follow_up(&id, "turn one").await.unwrap();
    chat.follow_up(&id, "turn two").await.unwrap();

    let last = sampler.requests.lock().unwrap().last().cloned().unwrap();
    assert!(last
        .user
        .contains("[... 3 earlier messages truncated for context limit ...]"));
    assert!(last.user.contains("User: turn two"));
    assert!(!last.user.contains("turn zero"));

    assert_eq!(chat.history(&id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn delete_and_cleanup() {
    let dir = tempdir().unwrap();
    let chat = service(dir.path(), Arc::new(RecordingSampler::default()));

    let id = chat
        .start(knobs(), "m", None, None)
        .await
        .unwrap()
        .session
        .session_id()
        .to_string();
    chat.delete(&id).await.unwrap();
    chat.delete(&id).await.unwrap();
    assert!(matches!(
        chat.session(&id).await,
        Err(ChatError::Session(SessionError::NotFound(_)))
    ));
    assert_eq!(chat.cleanup_expired().await.unwrap(), 0);
}
