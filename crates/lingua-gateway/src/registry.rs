//! Bounded registry of live relay sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use lingua_core::error::{RelayError, Result};
use lingua_core::session::{Session, SessionConfig, SessionState};

/// Tracks every open session and enforces the concurrency cap.
pub struct SessionRegistry {
    max_sessions: usize,
    sessions: Mutex<HashMap<String, Session>>,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a new session, or fail with `CapacityExceeded` when full.
    /// The entry lives as long as the returned guard.
    pub fn try_register(self: &Arc<Self>, id: &str) -> Result<SessionGuard> {
        let mut map = self.lock();
        if map.len() >= self.max_sessions {
            warn!(active = map.len(), max = self.max_sessions, "Session limit reached");
            return Err(RelayError::CapacityExceeded {
                active: map.len(),
                max: self.max_sessions,
            });
        }
        map.insert(id.to_string(), Session::new(id));
        debug!(session_id = id, active = map.len(), "Session registered");

        Ok(SessionGuard {
            id: id.to_string(),
            registry: Arc::clone(self),
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .lock()
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                state: s.state(),
                started_at: s.started_at,
                language: s.config.as_ref().map(|c| c.language.clone()),
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

/// Handle to one registered session. Dropping it frees the slot.
pub struct SessionGuard {
    id: String,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Option<SessionState> {
        self.registry.lock().get(&self.id).map(Session::state)
    }

    pub fn transition(&self, next: SessionState) -> bool {
        self.registry
            .lock()
            .get_mut(&self.id)
            .is_some_and(|s| s.transition(next))
    }

    pub fn set_config(&self, config: SessionConfig) {
        if let Some(session) = self.registry.lock().get_mut(&self.id) {
            session.config = Some(config);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut map = self.registry.lock();
        map.remove(&self.id);
        debug!(session_id = %self.id, active = map.len(), "Session released");
    }
}
