//! Process-wide session registry.
//!
//! Every live bridge session registers a handle here so shutdown can cancel
//! them all and the health endpoint can report a count. Explicitly owned by
//! [`crate::state::AppState`], never a global.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle to a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub started_at: Instant,
    /// Cancelling this token tears the session's tasks down.
    pub cancel: CancellationToken,
}

/// Registry of live sessions keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session and return its cancellation token.
    pub fn register(&self, id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.sessions.insert(
            id.to_string(),
            SessionHandle {
                id: id.to_string(),
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        info!(session_id = %id, live = self.sessions.len(), "session registered");
        cancel
    }

    /// Remove a finished session. Removing twice is harmless.
    pub fn deregister(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            info!(session_id = %id, live = self.sessions.len(), "session deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Cancel every live session. Used on graceful shutdown.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}
