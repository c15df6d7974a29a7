//! Outbound call orchestrator
//!
//! Publishes click-to-call requests toward the resident and waits for the
//! returned leg to attach under the session's call id. Runs on its own
//! task so bus I/O never stalls the state machine; termination latches are
//! observed at every poll tick so an aborting session releases it within
//! the poll interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::capabilities::{ClickToCallPublisher, ClickToCallRequest};
use crate::config::AppConfig;
use crate::dialog::{DialogEngine, DialogEvent};
use crate::session::{CallRole, Session};

/// Latch observation cadence while waiting for the resident leg.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Outcome {
    Connected,
    Exhausted,
    BusFailed,
    Aborted,
}

/// Drive the outbound-call attempts for one session. The caller has
/// already taken a session reference; it is released here on every path.
pub async fn run(
    engine: Arc<DialogEngine>,
    publisher: Arc<dyn ClickToCallPublisher>,
    session: Arc<Session>,
    config: Arc<AppConfig>,
    origin: String,
) {
    let call_id = session.call_id;
    let request = ClickToCallRequest {
        // The guid must be the call id verbatim so the resident leg
        // attaches to this session.
        guid: call_id.to_string(),
        origin,
        license: config.bus.license.clone(),
    };

    let max_attempts = config.orchestrator.max_attempts;
    let attempt_timeout = config.orchestrator.attempt_timeout();
    let mut attempt = 0u32;

    let outcome = loop {
        if session.latches.is_set(CallRole::Visitor) {
            break Outcome::Aborted;
        }
        if session.resident_is_attached() {
            break Outcome::Connected;
        }
        if attempt >= max_attempts {
            break Outcome::Exhausted;
        }
        attempt += 1;
        {
            let mut dialog = session.dialog.lock().await;
            dialog.call_attempts = attempt;
        }
        info!(%call_id, attempt, max_attempts, "publishing click-to-call");

        if let Err(error) = publisher.publish(&request).await {
            warn!(%call_id, %error, "click-to-call publish failed");
            break Outcome::BusFailed;
        }

        if wait_for_resident(&session, attempt_timeout).await {
            break Outcome::Connected;
        }
        info!(%call_id, attempt, "no resident connection within attempt timeout");
    };

    match outcome {
        Outcome::Connected => {
            info!(%call_id, "resident leg attached");
        }
        Outcome::Exhausted => {
            engine.dispatch(call_id, DialogEvent::OutboundExhausted).await;
        }
        Outcome::BusFailed => {
            engine.dispatch(call_id, DialogEvent::BusFailed).await;
        }
        Outcome::Aborted => {
            info!(%call_id, "outbound call aborted by session termination");
        }
    }

    engine.registry().release_reference(&session);
}

/// Wait for the resident leg, polling the termination latch.
async fn wait_for_resident(session: &Arc<Session>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if session.resident_is_attached() {
            return true;
        }
        if session.latches.is_set(CallRole::Visitor) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wait = POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = session.resident_attached.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
