//! Dialog engine
//!
//! Maps leg-level events onto the pure state machine. Capability I/O
//! (intent extraction, directory validation) runs here, before the event
//! reaches [`machine::step`]; the per-session dialog lock is held across
//! the whole pass so events are processed one at a time per session, and
//! the leg queues stay independently lockable throughout.

pub mod machine;
pub mod policy;

use std::sync::Arc;

use tracing::{error, info, warn};

use porteiro_audiosocket::CallId;

use crate::capabilities::{
    ClickToCallPublisher, DirectoryStore, ExtractionStage, IntentExtractor,
};
use crate::config::AppConfig;
use crate::dialog::machine::{step, CollectOutcome, Effect, StepEvent};
use crate::dialog::policy::DialogPolicy;
use crate::error::{EngineError, Result};
use crate::matching;
use crate::orchestrator;
use crate::registry::SessionRegistry;
use crate::session::{CallRole, DialogState, Session};

/// Events emitted by leg handlers and the orchestrator.
#[derive(Debug, Clone)]
pub enum DialogEvent {
    VisitorText(String),
    ResidentText(String),
    ResidentConnected,
    ResidentAudioReady,
    LegTimeout(CallRole),
    LegHangup(CallRole),
    OutboundExhausted,
    BusFailed,
    /// A capability serving this leg failed after its internal retries.
    CapabilityFailed(CallRole),
}

pub struct DialogEngine {
    registry: Arc<SessionRegistry>,
    extractor: Arc<dyn IntentExtractor>,
    directory: Arc<dyn DirectoryStore>,
    publisher: Arc<dyn ClickToCallPublisher>,
    policy: DialogPolicy,
    config: Arc<AppConfig>,
}

impl DialogEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        extractor: Arc<dyn IntentExtractor>,
        directory: Arc<dyn DirectoryStore>,
        publisher: Arc<dyn ClickToCallPublisher>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            extractor,
            directory,
            publisher,
            policy: DialogPolicy::from_config(&config),
            config,
        })
    }

    pub fn policy(&self) -> &DialogPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Feed one event into a session's dialog. Unknown call ids are
    /// tolerated: a late event after removal has nothing left to do.
    pub async fn dispatch(self: &Arc<Self>, call_id: CallId, event: DialogEvent) {
        let Some(session) = self.registry.get(&call_id) else {
            return;
        };
        session.touch();

        let mut dialog = session.dialog.lock().await;
        let result = self.handle(&session, &mut dialog, event).await;
        if let Ok(effects) = &result {
            // Everything we are about to say becomes part of the history
            // the intent extractor sees on later turns.
            for effect in effects {
                if let Effect::Speak(request) = effect {
                    dialog.record(CallRole::System, &request.text);
                }
            }
        }
        session.set_state_hint(dialog.state);
        drop(dialog);

        match result {
            Ok(effects) => self.apply(&session, effects),
            Err(error) => {
                // Invariant violations are fatal for the session.
                error!(%call_id, %error, "dialog step failed, aborting session");
                session.enqueue(crate::session::SpeakRequest {
                    text: self.policy.apology_message.clone(),
                    role: CallRole::Visitor,
                    purpose: crate::session::SpeakPurpose::Farewell,
                });
                self.registry.end(&call_id);
            }
        }
    }

    async fn handle(
        self: &Arc<Self>,
        session: &Arc<Session>,
        dialog: &mut DialogState,
        event: DialogEvent,
    ) -> Result<Vec<Effect>> {
        let step_event = match event {
            DialogEvent::VisitorText(text) => {
                dialog.record(CallRole::Visitor, &text);
                if dialog.state != crate::session::SessionState::Collecting {
                    // History only outside the collection stage.
                    return Ok(Vec::new());
                }
                match self.collect(dialog, session.building_id()).await {
                    Ok(outcome) => StepEvent::VisitorCollected(outcome),
                    Err(
                        EngineError::CapabilityTransient(reason)
                        | EngineError::DirectoryUnavailable(reason),
                    ) => {
                        warn!(call_id = %session.call_id, %reason, "collection pass failed");
                        StepEvent::CapabilityFailed(CallRole::Visitor)
                    }
                    Err(other) => return Err(other),
                }
            }
            DialogEvent::ResidentText(text) => {
                dialog.record(CallRole::Resident, &text);
                StepEvent::ResidentText(text)
            }
            DialogEvent::ResidentConnected => StepEvent::ResidentConnected,
            DialogEvent::ResidentAudioReady => StepEvent::ResidentAudioReady,
            DialogEvent::LegTimeout(role) => StepEvent::LegTimeout(role),
            DialogEvent::LegHangup(role) => StepEvent::LegHangup(role),
            DialogEvent::OutboundExhausted => StepEvent::OutboundExhausted,
            DialogEvent::BusFailed => StepEvent::BusFailed,
            DialogEvent::CapabilityFailed(role) => StepEvent::CapabilityFailed(role),
        };

        step(dialog, step_event, &self.policy)
    }

    /// Run the extraction stages for still-empty fields, then validate the
    /// completed intent against the directory.
    async fn collect(
        &self,
        dialog: &mut DialogState,
        building_id: Option<i64>,
    ) -> Result<CollectOutcome> {
        for stage in [
            ExtractionStage::IntentType,
            ExtractionStage::VisitorName,
            ExtractionStage::ApartmentResident,
        ] {
            if !stage_missing(stage, dialog) {
                continue;
            }
            let outcome = self
                .extractor
                .extract(stage, &dialog.history, &dialog.intent)
                .await?;

            let intent = &mut dialog.intent;
            let patch = outcome.patch;
            if intent.intent_type.is_none() {
                intent.intent_type = patch.intent_type;
            }
            if intent.visitor_name.is_none() {
                intent.visitor_name = patch.visitor_name;
            }
            if intent.apartment.is_none() {
                intent.apartment = patch.apartment;
            }
            if intent.resident_name.is_none() {
                intent.resident_name = patch.resident_name;
            }

            if stage_missing(stage, dialog) {
                let clarify = outcome
                    .clarify
                    .unwrap_or_else(|| self.policy.stage_question(stage).to_string());
                return Ok(CollectOutcome::NeedMore { clarify });
            }
        }

        // All four fields are present: fuzzy-validate against the
        // directory and resolve the resident's dialable number.
        let apartment = dialog.intent.apartment.clone().unwrap_or_default();
        let provided = dialog.intent.resident_name.clone().unwrap_or_default();

        match self
            .directory
            .find_apartment(building_id, &apartment)
            .await?
        {
            None => {
                // Re-collect the apartment on the next utterance.
                dialog.intent.apartment = None;
                Ok(CollectOutcome::ApartmentNotFound { apartment })
            }
            Some(entry) => match matching::best_match(&provided, &entry.residents) {
                Some((matched, score)) if matching::is_match(score) => {
                    info!(
                        apartment = %entry.apartment,
                        resident = %matched,
                        score,
                        "intent validated against directory"
                    );
                    Ok(CollectOutcome::Validated {
                        origin: matching::normalize_voip_number(&entry.voip_number),
                    })
                }
                best => {
                    let score = best.map(|(_, s)| s).unwrap_or(0);
                    info!(apartment = %apartment, score, "resident name did not match");
                    dialog.intent.resident_name = None;
                    Ok(CollectOutcome::ResidentNotMatched { apartment })
                }
            },
        }
    }

    /// Run the effects of one step.
    fn apply(self: &Arc<Self>, session: &Arc<Session>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Speak(request) => session.enqueue(request),
                Effect::StartOutboundCall { origin } => {
                    let engine = Arc::clone(self);
                    let session = Arc::clone(session);
                    let config = Arc::clone(&self.config);
                    let publisher = Arc::clone(&self.publisher);
                    session.acquire_ref();
                    tokio::spawn(async move {
                        orchestrator::run(engine, publisher, session, config, origin).await;
                    });
                }
                Effect::Terminate => {
                    self.registry.end(&session.call_id);
                }
            }
        }
    }
}

fn stage_missing(stage: ExtractionStage, dialog: &DialogState) -> bool {
    match stage {
        ExtractionStage::IntentType => dialog.intent.intent_type.is_none(),
        ExtractionStage::VisitorName => dialog.intent.visitor_name.is_none(),
        ExtractionStage::ApartmentResident => {
            dialog.intent.apartment.is_none() || dialog.intent.resident_name.is_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::stubs::{
        RecordingPublisher, ScriptedExtractor, StaticDirectory,
    };
    use crate::capabilities::{DirectoryEntry, ExtractionOutcome, IntentPatch};
    use crate::session::{SessionState, SpeakPurpose};

    fn directory_with_501() -> StaticDirectory {
        StaticDirectory::new(
            Vec::new(),
            vec![DirectoryEntry {
                apartment: "501".to_string(),
                residents: vec!["Daniel dos Reis".to_string()],
                voip_number: "sip:1003021@pbx.local".to_string(),
            }],
        )
    }

    fn engine_with(
        extractor: ScriptedExtractor,
        directory: StaticDirectory,
    ) -> (Arc<DialogEngine>, Arc<SessionRegistry>, Arc<RecordingPublisher>) {
        let registry = Arc::new(SessionRegistry::new());
        let publisher = RecordingPublisher::new();
        let engine = DialogEngine::new(
            Arc::clone(&registry),
            Arc::new(extractor),
            Arc::new(directory),
            publisher.clone(),
            Arc::new(AppConfig::default()),
        );
        (engine, registry, publisher)
    }

    fn full_patch() -> ExtractionOutcome {
        ExtractionOutcome {
            patch: IntentPatch {
                intent_type: Some("delivery".to_string()),
                visitor_name: Some("Pedro".to_string()),
                apartment: Some("501".to_string()),
                resident_name: Some("Daniel".to_string()),
            },
            clarify: None,
        }
    }

    #[tokio::test]
    async fn clarification_is_queued_while_fields_are_missing() {
        let extractor = ScriptedExtractor::new(vec![ExtractionOutcome {
            patch: IntentPatch {
                intent_type: Some("delivery".to_string()),
                ..IntentPatch::default()
            },
            clarify: Some("What is your name?".to_string()),
        }]);
        let (engine, registry, _) = engine_with(extractor, directory_with_501());
        let call_id = porteiro_audiosocket::CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        engine
            .dispatch(call_id, DialogEvent::VisitorText("Delivery for 501".to_string()))
            .await;

        let queued = session.dequeue(CallRole::Visitor).unwrap();
        assert_eq!(queued.purpose, SpeakPurpose::Clarification);
        assert_eq!(queued.text, "What is your name?");
        assert_eq!(session.dialog.lock().await.state, SessionState::Collecting);
    }

    #[tokio::test]
    async fn completed_intent_validates_and_starts_the_call() {
        let extractor = ScriptedExtractor::new(vec![full_patch()]);
        let (engine, registry, publisher) = engine_with(extractor, directory_with_501());
        let call_id = porteiro_audiosocket::CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        engine
            .dispatch(
                call_id,
                DialogEvent::VisitorText("Delivery for apartment 501, Daniel.".to_string()),
            )
            .await;

        {
            let dialog = session.dialog.lock().await;
            assert_eq!(dialog.state, SessionState::Calling);
            assert_eq!(
                dialog.intent.resident_voip_number.as_deref(),
                Some("1003021")
            );
        }
        // The wait prompt is queued for the visitor.
        let queued = session.dequeue(CallRole::Visitor).unwrap();
        assert_eq!(queued.purpose, SpeakPurpose::Wait);

        // The orchestrator publishes with guid == call id.
        let mut waited = 0;
        while publisher.published().is_empty() && waited < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].guid, call_id.to_string());
        assert_eq!(published[0].origin, "1003021");
    }

    #[tokio::test]
    async fn mismatched_resident_clears_the_name_for_recollection() {
        let extractor = ScriptedExtractor::new(vec![ExtractionOutcome {
            patch: IntentPatch {
                intent_type: Some("visit".to_string()),
                visitor_name: Some("Ana".to_string()),
                apartment: Some("501".to_string()),
                resident_name: Some("Zezé".to_string()),
            },
            clarify: None,
        }]);
        let (engine, registry, publisher) = engine_with(extractor, directory_with_501());
        let call_id = porteiro_audiosocket::CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        engine
            .dispatch(
                call_id,
                DialogEvent::VisitorText("apartment 501, Zezé".to_string()),
            )
            .await;

        let dialog = session.dialog.lock().await;
        assert_eq!(dialog.state, SessionState::Collecting);
        assert!(dialog.intent.resident_name.is_none());
        assert!(publisher.published().is_empty());
        drop(dialog);
        let queued = session.dequeue(CallRole::Visitor).unwrap();
        assert!(queued.text.contains("did not match"));
    }

    #[tokio::test]
    async fn capability_failure_queues_an_apology() {
        // Empty script: the first extraction call fails terminally.
        let extractor = ScriptedExtractor::default();
        let (engine, registry, _) = engine_with(extractor, directory_with_501());
        let call_id = porteiro_audiosocket::CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        engine
            .dispatch(call_id, DialogEvent::VisitorText("hello".to_string()))
            .await;

        let queued = session.dequeue(CallRole::Visitor).unwrap();
        assert_eq!(queued.purpose, SpeakPurpose::Apology);
        // Not terminal: the session keeps collecting.
        assert_eq!(session.dialog.lock().await.state, SessionState::Collecting);
        assert!(!session.latches.is_set(CallRole::Visitor));
    }

    #[tokio::test]
    async fn history_records_ignored_input() {
        let extractor = ScriptedExtractor::new(vec![full_patch()]);
        let (engine, registry, _) = engine_with(extractor, directory_with_501());
        let call_id = porteiro_audiosocket::CallId::generate();
        let (session, _) = registry.get_or_create(call_id);

        engine
            .dispatch(call_id, DialogEvent::VisitorText("Delivery".to_string()))
            .await;
        // Now in Calling; further visitor text is history only.
        engine
            .dispatch(call_id, DialogEvent::VisitorText("hello?".to_string()))
            .await;

        let dialog = session.dialog.lock().await;
        assert_eq!(dialog.state, SessionState::Calling);
        // Visitor turn, the system wait prompt, then the ignored turn.
        assert_eq!(dialog.history.len(), 3);
        assert_eq!(dialog.history[0].role, CallRole::Visitor);
        assert_eq!(dialog.history[2].text, "hello?");
    }
}
