//! Per-session idle/active tracking.
//!
//! Each session id maps to a [`SessionState`]. Entries are created lazily and
//! dropped again when a session returns to idle, since the default state is
//! what a missing entry reads as.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Timing state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    start_time: Option<DateTime<Utc>>,
    is_idle: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            start_time: None,
            is_idle: true,
        }
    }
}

impl SessionState {
    /// When the current active period began. `Some` only while active.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    #[allow(dead_code)]
    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Whether a new start should be recorded on the next message.
    fn needs_start(&self) -> bool {
        self.is_idle || self.start_time.is_none()
    }
}

/// Owned map of session id to state. Not shared across threads; the event
/// handler holds it exclusively.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `session_id`, or the idle default if never seen.
    pub fn get(&self, session_id: &str) -> SessionState {
        self.sessions.get(session_id).copied().unwrap_or_default()
    }

    /// Mark the session active starting at `now`.
    ///
    /// Returns `true` if a start was recorded, `false` if the session was
    /// already active (its original start time is kept).
    pub fn record_start(&mut self, session_id: &str, now: DateTime<Utc>) -> bool {
        let state = self.sessions.entry(session_id.to_string()).or_default();
        if !state.needs_start() {
            return false;
        }
        *state = SessionState {
            start_time: Some(now),
            is_idle: false,
        };
        true
    }

    /// Return the session to idle and clear its start time.
    pub fn reset_to_idle(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Number of sessions currently tracked (active ones).
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
