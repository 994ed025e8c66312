//! Session identity tracking
//!
//! Holds which remote conversation the persistent connection is attached
//! to, and the two one-shot flags that describe how that attachment went
//! wrong: the remote handed back a different id (context lost, history
//! must be rebuilt) or the remote said the session no longer exists.

use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionTracker {
    session_id: Option<String>,
    pending_model: Option<String>,
    committed_model: Option<String>,
    was_interrupted: bool,
    needs_history_rebuild: bool,
    invalidated: bool,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn committed_model(&self) -> Option<&str> {
        self.committed_model.as_deref()
    }

    pub fn pending_model(&self) -> Option<&str> {
        self.pending_model.as_deref()
    }

    /// Record a session the agent established or resumed.
    pub fn capture_session(&mut self, session_id: &str, model: Option<&str>) {
        if let Some(previous) = self.session_id.as_deref() {
            if previous != session_id {
                info!(
                    component = "session",
                    event = "session.mismatch",
                    expected = %previous,
                    received = %session_id,
                    "Agent returned a different session; history will be rebuilt"
                );
                self.needs_history_rebuild = true;
            }
        }
        self.session_id = Some(session_id.to_string());
        if let Some(model) = model.or(self.pending_model.as_deref()) {
            self.committed_model = Some(model.to_string());
        }
        self.pending_model = None;
        self.invalidated = false;
    }

    /// The agent reported the session is gone.
    pub fn invalidate_session(&mut self) {
        debug!(
            component = "session",
            event = "session.invalidated",
            session_id = ?self.session_id,
        );
        self.session_id = None;
        self.committed_model = None;
        self.invalidated = true;
    }

    /// One-shot read of the invalidation flag.
    pub fn consume_invalidation(&mut self) -> bool {
        std::mem::take(&mut self.invalidated)
    }

    pub fn needs_history_rebuild(&self) -> bool {
        self.needs_history_rebuild
    }

    pub fn clear_history_rebuild(&mut self) {
        self.needs_history_rebuild = false;
    }

    /// Attach to an explicit conversation. Flags from the previous
    /// attachment do not carry over.
    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
        self.committed_model = None;
        self.needs_history_rebuild = false;
        self.invalidated = false;
        self.was_interrupted = false;
    }

    pub fn set_pending_model(&mut self, model: Option<String>) {
        self.pending_model = model;
    }

    pub fn mark_interrupted(&mut self) {
        self.was_interrupted = true;
    }

    /// Read and clear the interrupted flag.
    pub fn take_interrupted(&mut self) -> bool {
        std::mem::take(&mut self.was_interrupted)
    }

    pub fn was_interrupted(&self) -> bool {
        self.was_interrupted
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_session_requests_rebuild() {
        let mut tracker = SessionTracker::new();
        tracker.capture_session("X", None);
        assert!(!tracker.needs_history_rebuild());
        tracker.capture_session("Y", None);
        assert!(tracker.needs_history_rebuild());
        assert_eq!(tracker.session_id(), Some("Y"));

        tracker.clear_history_rebuild();
        assert!(!tracker.needs_history_rebuild());
    }

    #[test]
    fn same_session_twice_is_not_a_mismatch() {
        let mut tracker = SessionTracker::new();
        tracker.capture_session("X", None);
        tracker.capture_session("X", None);
        assert!(!tracker.needs_history_rebuild());
    }

    #[test]
    fn invalidation_is_consumed_once() {
        let mut tracker = SessionTracker::new();
        tracker.capture_session("X", Some("sonnet"));
        tracker.invalidate_session();

        assert_eq!(tracker.session_id(), None);
        assert_eq!(tracker.committed_model(), None);
        assert!(tracker.consume_invalidation());
        assert!(!tracker.consume_invalidation());
    }

    #[test]
    fn capture_clears_invalidation_without_mismatch() {
        let mut tracker = SessionTracker::new();
        tracker.capture_session("X", None);
        tracker.invalidate_session();
        tracker.capture_session("Z", None);
        // The invalidated session left no id behind to mismatch against
        assert!(!tracker.needs_history_rebuild());
        assert!(!tracker.consume_invalidation());
    }

    #[test]
    fn explicit_switch_clears_flags() {
        let mut tracker = SessionTracker::new();
        tracker.capture_session("X", None);
        tracker.capture_session("Y", None);
        tracker.invalidate_session();

        tracker.set_session_id(Some("chosen".into()));
        assert!(!tracker.needs_history_rebuild());
        assert!(!tracker.consume_invalidation());
        assert_eq!(tracker.session_id(), Some("chosen"));
    }

    #[test]
    fn pending_model_commits_on_capture() {
        let mut tracker = SessionTracker::new();
        tracker.set_pending_model(Some("opus".into()));
        tracker.capture_session("X", None);
        assert_eq!(tracker.committed_model(), Some("opus"));
        assert_eq!(tracker.pending_model(), None);

        tracker.capture_session("X", Some("haiku"));
        assert_eq!(tracker.committed_model(), Some("haiku"));
    }
}
