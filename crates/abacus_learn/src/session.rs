//! Transient per-session state.
//!
//! Sessions are process-local: nothing here touches the store, and a restart
//! forgets them. A session moves NEW → ACTIVE on its first observed call,
//! advances on every completed call, and FINALIZED on explicit finalize.
//! Finalized entries linger for a grace period before cleanup may drop them,
//! so late feedback still finds the session's shape.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Finalized,
}

/// Everything the encoder and episode logger need to know about a session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub user_query: String,
    pub tool_sequence: Vec<String>,
    pub previous_tool: Option<String>,
    pub session_length: u32,
    pub accumulated_reward: f64,
    pub phase: SessionPhase,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_query: String::new(),
            tool_sequence: Vec::new(),
            previous_tool: None,
            session_length: 0,
            accumulated_reward: 0.0,
            phase: SessionPhase::Active,
            finalized_at: None,
        }
    }
}

/// Registry of live sessions behind a single lock. The caller is expected to
/// serialize calls within one session; the lock makes accidental concurrent
/// calls safe rather than relying on that convention.
pub struct SessionTracker {
    grace: Duration,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionTracker {
    pub fn new(grace_secs: i64) -> Self {
        Self {
            grace: Duration::seconds(grace_secs.max(0)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot a session's state as of *before* the next tool call,
    /// creating the session if this is its first observed call. A finalized
    /// session reached again under the same id starts over.
    pub fn begin_call(&self, session_id: &str) -> SessionState {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id));
        if state.phase == SessionPhase::Finalized {
            *state = SessionState::new(session_id);
        }
        state.clone()
    }

    /// Remember the query driving this session; feeds the context hash.
    pub fn set_query(&self, session_id: &str, user_query: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id));
        if state.phase == SessionPhase::Finalized {
            *state = SessionState::new(session_id);
        }
        state.user_query = user_query.to_string();
    }

    /// Advance a session after a completed tool call.
    pub fn complete_call(&self, session_id: &str, tool_name: &str, reward: f64) {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id));
        state.tool_sequence.push(tool_name.to_string());
        state.previous_tool = Some(tool_name.to_string());
        state.session_length += 1;
        state.accumulated_reward += reward;
    }

    /// Current state of a session, if it exists.
    pub fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Mark a session finalized and return its final state, or None for an
    /// unknown or already-finalized session.
    pub fn finalize(&self, session_id: &str) -> Option<SessionState> {
        let mut sessions = self.sessions.lock();
        let state = sessions.get_mut(session_id)?;
        if state.phase == SessionPhase::Finalized {
            return None;
        }
        state.phase = SessionPhase::Finalized;
        state.finalized_at = Some(Utc::now());
        Some(state.clone())
    }

    /// Drop finalized sessions whose grace period has expired. Returns how
    /// many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        let grace = self.grace;
        sessions.retain(|_, state| match (state.phase, state.finalized_at) {
            (SessionPhase::Finalized, Some(at)) => now - at < grace,
            _ => true,
        });
        before - sessions.len()
    }

    /// Number of tracked sessions (any phase).
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
