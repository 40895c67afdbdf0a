//! Session store: in-memory sessions with idle expiry and durable backends.
//!
//! Every mutation writes the durable record first and then the in-memory
//! map, both under the same lock, so memory and storage never disagree about
//! a session after a failed write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{ChatSession, Role};
use crate::types::Knobs;

/// Default idle window before a session expires.
pub const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 2 * 60 * 60;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {session_id}: {given} messages do not extend the {stored} stored")]
    HistoryRewrite {
        session_id: String,
        stored: usize,
        given: usize,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session store lock poisoned")]
    Poisoned,
}

/// Durable storage: one independent record per session id.
pub trait SessionBackend: Send + Sync {
    /// Every readable record. Unreadable records are skipped with a warning.
    fn load_all(&self) -> Result<Vec<ChatSession>, SessionError>;
    fn save(&self, session: &ChatSession) -> Result<(), SessionError>;
    /// Idempotent.
    fn remove(&self, session_id: &str) -> Result<(), SessionError>;
}

// =============================================================================
// SQLite backend
// =============================================================================

#[derive(Clone)]
pub struct SqliteSessionBackend {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS chat_sessions (\
               session_id TEXT PRIMARY KEY,\
               body TEXT NOT NULL,\
               model_name TEXT NOT NULL,\
               created_at TEXT NOT NULL,\
               last_active TEXT NOT NULL,\
               message_count INTEGER NOT NULL\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&Connection) -> Result<R, SessionError>,
    {
        let guard = self.conn.lock().map_err(|_| SessionError::Poisoned)?;
        f(&guard)
    }
}

impl SessionBackend for SqliteSessionBackend {
    fn load_all(&self) -> Result<Vec<ChatSession>, SessionError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT session_id, body FROM chat_sessions")?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let body: String = row.get(1)?;
                match serde_json::from_str::<ChatSession>(&body) {
                    Ok(session) => sessions.push(session),
                    Err(e) => tracing::warn!(session_id = %id, error = %e, "skipping unreadable session"),
                }
            }
            Ok(sessions)
        })
    }

    fn save(&self, session: &ChatSession) -> Result<(), SessionError> {
        let body = serde_json::to_string(session)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (\
                    session_id, body, model_name, created_at, last_active, message_count\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)\
                 ON CONFLICT(session_id) DO UPDATE SET\
                    body = excluded.body,\
                    model_name = excluded.model_name,\
                    last_active = excluded.last_active,\
                    message_count = excluded.message_count",
                params![
                    session.session_id(),
                    body,
                    session.model_name(),
                    session.created_at().to_rfc3339(),
                    session.last_active().to_rfc3339(),
                    session.turn_count() as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM chat_sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
    }
}

// =============================================================================
// JSON directory backend
// =============================================================================

/// One pretty-printed `<session_id>.json` file per session.
#[derive(Debug, Clone)]
pub struct JsonDirSessionBackend {
    dir: PathBuf,
}

impl JsonDirSessionBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SessionError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `None` for ids that could escape the directory.
    fn file_for(&self, session_id: &str) -> Option<PathBuf> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{session_id}.json")))
    }
}

impl SessionBackend for JsonDirSessionBackend {
    fn load_all(&self) -> Result<Vec<ChatSession>, SessionError> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(SessionError::from)
                .and_then(|text| serde_json::from_str::<ChatSession>(&text).map_err(Into::into));
            match parsed {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    fn save(&self, session: &ChatSession) -> Result<(), SessionError> {
        let path = self
            .file_for(session.session_id())
            .ok_or_else(|| SessionError::NotFound(session.session_id().to_string()))?;
        let body = serde_json::to_string_pretty(session)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let Some(path) = self.file_for(session_id) else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

struct StoreInner {
    sessions: Mutex<HashMap<String, ChatSession>>,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    backend: Box<dyn SessionBackend>,
    idle_timeout: chrono::Duration,
    clock: Clock,
}

/// Process-wide session registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Load every durable record; expired ones are deleted from storage.
    pub fn open(
        backend: impl SessionBackend + 'static,
        idle_timeout: chrono::Duration,
    ) -> Result<Self, SessionError> {
        Self::with_clock(backend, idle_timeout, Arc::new(Utc::now))
    }

    pub fn with_clock(
        backend: impl SessionBackend + 'static,
        idle_timeout: chrono::Duration,
        clock: Clock,
    ) -> Result<Self, SessionError> {
        let now = clock();
        let mut sessions = HashMap::new();
        let mut expired = 0usize;
        for session in backend.load_all()? {
            if session.is_expired(now, idle_timeout) {
                backend.remove(session.session_id())?;
                expired += 1;
            } else {
                sessions.insert(session.session_id().to_string(), session);
            }
        }
        tracing::info!(loaded = sessions.len(), expired, "session store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                sessions: Mutex::new(sessions),
                turn_locks: Mutex::new(HashMap::new()),
                backend: Box::new(backend),
                idle_timeout,
                clock,
            }),
        })
    }

    pub fn open_sqlite(
        path: impl AsRef<Path>,
        idle_timeout: chrono::Duration,
    ) -> Result<Self, SessionError> {
        Self::open(SqliteSessionBackend::open(path)?, idle_timeout)
    }

    pub fn open_json_dir(
        dir: impl AsRef<Path>,
        idle_timeout: chrono::Duration,
    ) -> Result<Self, SessionError> {
        Self::open(JsonDirSessionBackend::open(dir)?, idle_timeout)
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        self.inner.idle_timeout
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    fn sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, ChatSession>>, SessionError> {
        self.inner.sessions.lock().map_err(|_| SessionError::Poisoned)
    }

    /// Remove from storage, then memory. Caller holds the map lock.
    fn remove_locked(
        &self,
        map: &mut HashMap<String, ChatSession>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        self.inner.backend.remove(session_id)?;
        map.remove(session_id);
        if let Ok(mut locks) = self.inner.turn_locks.lock() {
            locks.remove(session_id);
        }
        Ok(())
    }

    pub fn create(
        &self,
        knobs: Knobs,
        model_name: impl Into<String>,
        parent_signal_id: Option<String>,
    ) -> Result<ChatSession, SessionError> {
        let session = ChatSession::new(knobs, model_name, parent_signal_id, self.now());
        let mut map = self.sessions()?;
        self.inner.backend.save(&session)?;
        map.insert(session.session_id().to_string(), session.clone());
        tracing::debug!(session_id = %session.session_id(), "session created");
        Ok(session)
    }

    /// The session, unless absent or idle-expired. Expired sessions are
    /// deleted as a side effect.
    pub fn get(&self, session_id: &str) -> Result<Option<ChatSession>, SessionError> {
        let now = self.now();
        let mut map = self.sessions()?;
        let expired = match map.get(session_id) {
            None => return Ok(None),
            Some(s) => s.is_expired(now, self.inner.idle_timeout),
        };
        if expired {
            tracing::info!(session_id, "session expired");
            self.remove_locked(&mut map, session_id)?;
            return Ok(None);
        }
        Ok(map.get(session_id).cloned())
    }

    /// Like `get`, but absence is an error.
    pub fn require(&self, session_id: &str) -> Result<ChatSession, SessionError> {
        self.get(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Overwrite the stored copy. The stored history must be an exact prefix
    /// of the incoming one, so a stale copy cannot replace newer messages.
    pub fn update(&self, session: &ChatSession) -> Result<(), SessionError> {
        let mut map = self.sessions()?;
        let stored = map
            .get(session.session_id())
            .ok_or_else(|| SessionError::NotFound(session.session_id().to_string()))?;
        if !session.messages().starts_with(stored.messages()) {
            return Err(SessionError::HistoryRewrite {
                session_id: session.session_id().to_string(),
                stored: stored.turn_count(),
                given: session.turn_count(),
            });
        }
        self.inner.backend.save(session)?;
        map.insert(session.session_id().to_string(), session.clone());
        Ok(())
    }

    /// Append messages stamped now and persist, as one step.
    pub fn append_messages(
        &self,
        session_id: &str,
        messages: &[(Role, &str)],
    ) -> Result<ChatSession, SessionError> {
        let now = self.now();
        let mut map = self.sessions()?;
        let mut session = match map.get(session_id) {
            Some(s) if !s.is_expired(now, self.inner.idle_timeout) => s.clone(),
            Some(_) => {
                self.remove_locked(&mut map, session_id)?;
                return Err(SessionError::NotFound(session_id.to_string()));
            }
            None => return Err(SessionError::NotFound(session_id.to_string())),
        };
        for (role, content) in messages {
            session.add_message_at(*role, *content, now);
        }
        self.inner.backend.save(&session)?;
        map.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Remove from memory and storage. No error if already gone.
    pub fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let mut map = self.sessions()?;
        self.remove_locked(&mut map, session_id)
    }

    /// Delete every idle-expired session; returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let now = self.now();
        let mut map = self.sessions()?;
        let expired: Vec<String> = map
            .values()
            .filter(|s| s.is_expired(now, self.inner.idle_timeout))
            .map(|s| s.session_id().to_string())
            .collect();
        for id in &expired {
            self.remove_locked(&mut map, id)?;
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired sessions cleaned up");
        }
        Ok(expired.len())
    }

    /// New session with a copy of `session_id`'s history under `knobs`.
    pub fn fork(&self, session_id: &str, knobs: Knobs) -> Result<ChatSession, SessionError> {
        let source = self.require(session_id)?;
        let forked = source.fork(knobs, self.now());
        let mut map = self.sessions()?;
        self.inner.backend.save(&forked)?;
        map.insert(forked.session_id().to_string(), forked.clone());
        tracing::debug!(from = session_id, to = %forked.session_id(), "session forked");
        Ok(forked)
    }

    /// Lock serialising read-modify-write turns on one session. Only live
    /// sessions get a lock.
    pub fn turn_lock(&self, session_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, SessionError> {
        let map = self.sessions()?;
        if !map.contains_key(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let mut locks = self
            .inner
            .turn_locks
            .lock()
            .map_err(|_| SessionError::Poisoned)?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Number of per-session turn locks held.
    pub fn turn_lock_count(&self) -> usize {
        self.inner.turn_locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Live sessions, most recently active first.
    pub fn list(&self) -> Result<Vec<ChatSession>, SessionError> {
        let map = self.sessions()?;
        let mut sessions: Vec<ChatSession> = map.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_active().cmp(&a.last_active()));
        Ok(sessions)
    }

    /// Sessions currently held in memory (expired ones included until swept).
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .map(|m| m.contains_key(session_id))
            .unwrap_or(false)
    }
}
