//! Session registry
//!
//! Process-wide map from call id to session, shared by the visitor and
//! resident legs. Map operations are O(1) and never touch external I/O
//! while the lock is held; the per-session dialog lock lives inside the
//! session itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use porteiro_audiosocket::CallId;

use crate::session::{Session, SessionState};

/// Grace between the last reference going away and the session's removal.
pub const CLEANUP_GRACE: Duration = Duration::from_secs(1);

/// Registry statistics for the management API.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RegistryStats {
    pub total_created: u64,
    pub total_completed: u64,
}

/// Snapshot of one session for status listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub state: SessionState,
    pub age_seconds: u64,
    pub resident_attached: bool,
}

/// Concurrent call-id → session map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<CallId, Arc<Session>>>,
    stats: RwLock<RegistryStats>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the session for `call_id`, creating it on first use. Returns
    /// the handle and whether this call created it.
    ///
    /// The resident leg connecting with the visitor's call id lands on the
    /// existing session here; that is the whole correlation mechanism.
    pub fn get_or_create(&self, call_id: CallId) -> (Arc<Session>, bool) {
        if let Some(existing) = self.sessions.read().get(&call_id) {
            return (Arc::clone(existing), false);
        }
        let mut sessions = self.sessions.write();
        // Double-checked: another leg may have won the race.
        if let Some(existing) = sessions.get(&call_id) {
            return (Arc::clone(existing), false);
        }
        let session = Arc::new(Session::new(call_id));
        sessions.insert(call_id, Arc::clone(&session));
        self.stats.write().total_created += 1;
        debug!(%call_id, "session created");
        (session, true)
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Session>> {
        self.sessions.read().get(call_id).cloned()
    }

    /// Latch termination for both legs and return immediately. Safe to
    /// call from any path, any number of times.
    pub fn end(&self, call_id: &CallId) {
        if let Some(session) = self.get(call_id) {
            session.signal_termination();
            info!(%call_id, "session termination signalled");
        }
    }

    /// Final removal, called by the last handler to exit. Idempotent:
    /// the second of two racing closers finds nothing to remove.
    pub fn complete(&self, call_id: &CallId) -> bool {
        let removed = self.sessions.write().remove(call_id).is_some();
        if removed {
            self.stats.write().total_completed += 1;
            info!(%call_id, "session removed");
        }
        removed
    }

    /// Snapshots for the management API.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read();
        sessions
            .values()
            .map(|session| {
                let state = session
                    .dialog
                    .try_lock()
                    .map(|d| d.state)
                    .unwrap_or(SessionState::Collecting);
                SessionSnapshot {
                    call_id: session.call_id,
                    state,
                    age_seconds: session.created_at.elapsed().as_secs(),
                    resident_attached: session.resident_is_attached(),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        *self.stats.read()
    }

    /// Drop one live reference to a session. When the last reference goes
    /// away the session is removed after [`CLEANUP_GRACE`], unless a new
    /// leg attaches in the meantime.
    pub fn release_reference(self: &Arc<Self>, session: &Arc<Session>) {
        if session.release_ref() > 0 {
            return;
        }
        let registry = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_GRACE).await;
            if session.ref_count() == 0 {
                registry.complete(&session.call_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallRole;

    #[test]
    fn both_legs_share_one_session() {
        let registry = SessionRegistry::new();
        let call_id = CallId::generate();

        let (visitor, created) = registry.get_or_create(call_id);
        assert!(created);
        let (resident, created) = registry.get_or_create(call_id);
        assert!(!created);
        assert!(Arc::ptr_eq(&visitor, &resident));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_call_ids_never_share() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.get_or_create(CallId::generate());
        let (b, _) = registry.get_or_create(CallId::generate());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn end_latches_both_legs() {
        let registry = SessionRegistry::new();
        let call_id = CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        registry.end(&call_id);
        assert!(session.latches.is_set(CallRole::Visitor));
        assert!(session.latches.is_set(CallRole::Resident));
        // Ending again is a no-op, not an error.
        registry.end(&call_id);
    }

    #[test]
    fn complete_removes_once() {
        let registry = SessionRegistry::new();
        let call_id = CallId::generate();
        registry.get_or_create(call_id);

        assert!(registry.complete(&call_id));
        assert!(!registry.complete(&call_id));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_completed, 1);
    }
}
