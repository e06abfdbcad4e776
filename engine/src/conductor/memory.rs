//! Session Memory
//!
//! Keyed store of conversations. Each session holds its turns and the most
//! recent tabular result, which the planner uses to resolve referential
//! phrases ("export those"). Access to one session is serialized through a
//! per-session mutex; sessions never contend with each other. A session
//! belongs to the first user who speaks in it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sdk::errors::EngineError;
use sdk::types::Table;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub owner: Option<String>,
    pub turns: Vec<Turn>,
    pub last_result: Option<Table>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: None,
            turns: Vec::new(),
            last_result: None,
            created_at: now,
            last_active: now,
        }
    }

    /// Bind an unowned session to `user_id`; false if someone else owns it
    pub fn claim(&mut self, user_id: &str) -> bool {
        match &self.owner {
            Some(owner) => owner == user_id,
            None => {
                self.owner = Some(user_id.to_string());
                true
            }
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner.as_deref() == Some(user_id)
    }

    pub fn append(&mut self, role: TurnRole, text: impl Into<String>) {
        let now = Utc::now();
        self.turns.push(Turn {
            role,
            text: text.into(),
            timestamp: now,
        });
        self.last_active = now;
    }

    pub fn set_last_result(&mut self, table: Table) {
        self.last_result = Some(table);
        self.last_active = Utc::now();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            user_id: self.owner.clone(),
            turns: self.turns.len(),
            created_at: self.created_at,
            last_active: self.last_active,
            has_last_result: self.last_result.is_some(),
            last_result_rows: self.last_result.as_ref().map(Table::len),
        }
    }
}

/// Summary exposed to session-management callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub turns: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub has_last_result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result_rows: Option<usize>,
}

/// session_id -> Session, one lock per entry
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<Session>> {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("Creating session {}", session_id);
                Arc::new(Mutex::new(Session::new(session_id)))
            });
        Arc::clone(entry.value())
    }

    /// Exclusive access to a session, created on demand.
    ///
    /// The guard is held for a whole exchange so a second message on the same
    /// session waits until the first has stored its result.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Session> {
        // The DashMap shard lock is released before awaiting the session lock
        let session = self.entry(session_id);
        session.lock_owned().await
    }

    /// Turns and last result; unknown ids yield an empty session
    pub async fn get(&self, session_id: &str) -> (Vec<Turn>, Option<Table>) {
        let session = self.lock(session_id).await;
        (session.turns.clone(), session.last_result.clone())
    }

    pub async fn append(&self, session_id: &str, role: TurnRole, text: &str) {
        self.lock(session_id).await.append(role, text);
    }

    pub async fn set_last_result(&self, session_id: &str, table: Table) {
        self.lock(session_id).await.set_last_result(table);
    }

    /// Turns and last result without creating the session. A session that
    /// belongs to someone other than `user_id` is refused.
    pub async fn peek(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<(Vec<Turn>, Option<Table>), EngineError> {
        let Some(session) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) else {
            return Ok((Vec::new(), None));
        };
        let guard = session.lock().await;
        if guard.owner.as_deref().is_some_and(|owner| owner != user_id) {
            return Err(EngineError::SessionAccess {
                session: session_id.to_string(),
            });
        }
        Ok((guard.turns.clone(), guard.last_result.clone()))
    }

    /// Summary without creating the session
    pub async fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.get(session_id).map(|e| Arc::clone(e.value()))?;
        let guard = session.lock().await;
        Some(guard.info())
    }

    /// Sessions `user_id` has spoken in, most recently active first
    pub async fn list_owned(&self, user_id: &str) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Mutex<Session>>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        let mut owned = Vec::new();
        for session in sessions {
            let guard = session.lock().await;
            if guard.is_owned_by(user_id) && !guard.turns.is_empty() {
                owned.push(guard.info());
            }
        }
        owned.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        owned
    }

    /// Drop a session; returns whether it existed
    pub fn evict(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            debug!("Evicted session {}", session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
