//! Session data model
//!
//! A session is shared by at most two leg handlers and the dialog engine.
//! Dialog state (stage, intent, history) is owned by the state machine and
//! guarded by an async mutex held only across one event step. Outbound
//! message queues have their own short-lived locks so a slow capability
//! call never stalls a leg's send loop. Termination latches are set-once
//! atomics observed with plain loads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use porteiro_audiosocket::CallId;

use crate::error::{EngineError, Result};

/// Which side of the conversation an event or message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Visitor,
    Resident,
    System,
}

impl std::fmt::Display for CallRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallRole::Visitor => write!(f, "visitor"),
            CallRole::Resident => write!(f, "resident"),
            CallRole::System => write!(f, "system"),
        }
    }
}

/// Dialog stage. Advances forward only, with an abort path to `Finished`
/// from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Collecting,
    Validated,
    Calling,
    CallInProgress,
    WaitingResident,
    Finished,
}

impl SessionState {
    pub(crate) fn rank(self) -> u8 {
        match self {
            SessionState::Collecting => 0,
            SessionState::Validated => 1,
            SessionState::Calling => 2,
            SessionState::CallInProgress => 3,
            SessionState::WaitingResident => 4,
            SessionState::Finished => 5,
        }
    }

    /// Forward transitions and aborts to `Finished` are permitted.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next == SessionState::Finished || next.rank() >= self.rank()
    }

    pub(crate) fn from_rank(rank: u8) -> SessionState {
        match rank {
            0 => SessionState::Collecting,
            1 => SessionState::Validated,
            2 => SessionState::Calling,
            3 => SessionState::CallInProgress,
            4 => SessionState::WaitingResident,
            _ => SessionState::Finished,
        }
    }
}

/// Resident decision, set at most once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationResult {
    Authorized,
    Denied,
}

/// Progressively filled visit intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitIntent {
    pub intent_type: Option<String>,
    pub visitor_name: Option<String>,
    pub apartment: Option<String>,
    pub resident_name: Option<String>,
    pub resident_voip_number: Option<String>,
    pub authorization: Option<AuthorizationResult>,
}

impl VisitIntent {
    /// All four collected fields are present.
    pub fn is_complete(&self) -> bool {
        self.intent_type.is_some()
            && self.visitor_name.is_some()
            && self.apartment.is_some()
            && self.resident_name.is_some()
    }
}

/// Why a message is being spoken; the send loop uses this to pick the
/// farewell during termination drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakPurpose {
    Greeting,
    Clarification,
    Wait,
    Context,
    Confirmation,
    Apology,
    Farewell,
}

/// One outbound text queued on a leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    pub role: CallRole,
    pub purpose: SpeakPurpose,
}

/// One turn of recorded conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: CallRole,
    pub text: String,
}

/// Set-once termination latches, one per leg.
#[derive(Debug, Default)]
pub struct TerminationLatches {
    visitor: AtomicBool,
    resident: AtomicBool,
}

impl TerminationLatches {
    pub fn set(&self, role: CallRole) {
        match role {
            CallRole::Visitor => self.visitor.store(true, Ordering::SeqCst),
            CallRole::Resident => self.resident.store(true, Ordering::SeqCst),
            CallRole::System => {
                self.visitor.store(true, Ordering::SeqCst);
                self.resident.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn set_both(&self) {
        self.set(CallRole::System);
    }

    pub fn is_set(&self, role: CallRole) -> bool {
        match role {
            CallRole::Visitor => self.visitor.load(Ordering::SeqCst),
            CallRole::Resident => self.resident.load(Ordering::SeqCst),
            CallRole::System => {
                self.visitor.load(Ordering::SeqCst) && self.resident.load(Ordering::SeqCst)
            }
        }
    }
}

/// Mutable dialog state owned by the state machine.
#[derive(Debug)]
pub struct DialogState {
    pub state: SessionState,
    pub intent: VisitIntent,
    pub history: Vec<Turn>,
    /// Number of outbound-call attempts already launched.
    pub call_attempts: u32,
}

impl Default for DialogState {
    fn default() -> Self {
        Self {
            state: SessionState::Collecting,
            intent: VisitIntent::default(),
            history: Vec::new(),
            call_attempts: 0,
        }
    }
}

impl DialogState {
    /// Advance the stage, rejecting backward transitions.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(EngineError::InternalInvariant(format!(
                "illegal transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record the resident decision; a second decision is an invariant
    /// violation and fatal for the session.
    pub fn set_authorization(&mut self, result: AuthorizationResult) -> Result<()> {
        if self.intent.authorization.is_some() {
            return Err(EngineError::InternalInvariant(
                "authorization result set twice".to_string(),
            ));
        }
        self.intent.authorization = Some(result);
        Ok(())
    }

    pub fn record(&mut self, role: CallRole, text: impl Into<String>) {
        self.history.push(Turn {
            role,
            text: text.into(),
        });
    }
}

/// Shared per-session handle.
pub struct Session {
    pub call_id: CallId,
    pub latches: TerminationLatches,
    pub dialog: tokio::sync::Mutex<DialogState>,
    visitor_queue: Mutex<VecDeque<SpeakRequest>>,
    resident_queue: Mutex<VecDeque<SpeakRequest>>,
    /// Wakes the corresponding send loop on enqueue or latch set.
    pub visitor_signal: Notify,
    pub resident_signal: Notify,
    /// Fires when the resident leg attaches; the orchestrator waits on it.
    pub resident_attached: Notify,
    resident_is_attached: AtomicBool,
    /// Cheap mirror of the dialog stage for leg-side timeout decisions,
    /// readable without touching the dialog lock.
    state_hint: std::sync::atomic::AtomicU8,
    /// Building the visitor's listener belongs to, for directory lookups.
    building_id: Mutex<Option<i64>>,
    /// Live references: attached legs plus pending orchestrator runs.
    refs: AtomicUsize,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(call_id: CallId) -> Self {
        let now = Instant::now();
        Self {
            call_id,
            latches: TerminationLatches::default(),
            dialog: tokio::sync::Mutex::new(DialogState::default()),
            visitor_queue: Mutex::new(VecDeque::new()),
            resident_queue: Mutex::new(VecDeque::new()),
            visitor_signal: Notify::new(),
            resident_signal: Notify::new(),
            resident_attached: Notify::new(),
            resident_is_attached: AtomicBool::new(false),
            state_hint: std::sync::atomic::AtomicU8::new(0),
            building_id: Mutex::new(None),
            refs: AtomicUsize::new(0),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Queue a message on the target leg and wake its send loop.
    pub fn enqueue(&self, request: SpeakRequest) {
        match request.role {
            CallRole::Visitor => {
                self.visitor_queue.lock().push_back(request);
                self.visitor_signal.notify_one();
            }
            CallRole::Resident => {
                self.resident_queue.lock().push_back(request);
                self.resident_signal.notify_one();
            }
            CallRole::System => {}
        }
    }

    /// Pop the next message for a leg.
    pub fn dequeue(&self, role: CallRole) -> Option<SpeakRequest> {
        match role {
            CallRole::Visitor => self.visitor_queue.lock().pop_front(),
            CallRole::Resident => self.resident_queue.lock().pop_front(),
            CallRole::System => None,
        }
    }

    /// Pull one farewell for the termination drain, discarding anything
    /// queued before it.
    pub fn take_farewell(&self, role: CallRole) -> Option<SpeakRequest> {
        let queue = match role {
            CallRole::Visitor => &self.visitor_queue,
            CallRole::Resident => &self.resident_queue,
            CallRole::System => return None,
        };
        let mut queue = queue.lock();
        while let Some(request) = queue.pop_front() {
            if request.purpose == SpeakPurpose::Farewell {
                return Some(request);
            }
        }
        None
    }

    pub fn queue_len(&self, role: CallRole) -> usize {
        match role {
            CallRole::Visitor => self.visitor_queue.lock().len(),
            CallRole::Resident => self.resident_queue.lock().len(),
            CallRole::System => 0,
        }
    }

    /// Latch termination for both legs and wake their send loops.
    pub fn signal_termination(&self) {
        self.latches.set_both();
        self.visitor_signal.notify_one();
        self.resident_signal.notify_one();
    }

    pub fn mark_resident_attached(&self) {
        self.resident_is_attached.store(true, Ordering::SeqCst);
        self.resident_attached.notify_waiters();
    }

    pub fn resident_is_attached(&self) -> bool {
        self.resident_is_attached.load(Ordering::SeqCst)
    }

    pub fn set_state_hint(&self, state: SessionState) {
        self.state_hint.store(state.rank(), Ordering::SeqCst);
    }

    pub fn state_hint(&self) -> SessionState {
        SessionState::from_rank(self.state_hint.load(Ordering::SeqCst))
    }

    pub fn set_building(&self, building_id: Option<i64>) {
        *self.building_id.lock() = building_id;
    }

    pub fn building_id(&self) -> Option<i64> {
        *self.building_id.lock()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Register a live reference (leg handler or orchestrator run).
    pub fn acquire_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop a live reference; returns the remaining count.
    pub fn release_ref(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        prev.saturating_sub(1)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}
