//! Dialog state machine
//!
//! One tagged-state `step` function per session: it receives an event,
//! mutates the dialog state, and returns the effects to run. All I/O
//! (extraction, directory lookups) happens before the event reaches this
//! point, so every transition is synchronous and directly testable.

use tracing::debug;

use crate::dialog::policy::{DialogPolicy, ResidentReply};
use crate::error::Result;
use crate::session::{
    AuthorizationResult, CallRole, DialogState, SessionState, SpeakPurpose, SpeakRequest,
};

/// Outcome of the data-collection pass over a visitor utterance.
#[derive(Debug, Clone)]
pub enum CollectOutcome {
    /// A field is still missing; ask the clarifying question.
    NeedMore { clarify: String },
    /// The apartment is not in the directory.
    ApartmentNotFound { apartment: String },
    /// No resident of the apartment matched the provided name.
    ResidentNotMatched { apartment: String },
    /// Validation passed; `origin` is the resident's dialable number.
    Validated { origin: String },
}

/// Events driving one session's dialog.
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Visitor text finished the extraction/validation pass.
    VisitorCollected(CollectOutcome),
    /// The resident leg attached to the session.
    ResidentConnected,
    /// The resident leg's audio path is up.
    ResidentAudioReady,
    /// Transcribed resident speech.
    ResidentText(String),
    /// Silence or transaction budget exceeded on a leg.
    LegTimeout(CallRole),
    /// A leg hung up or its connection failed.
    LegHangup(CallRole),
    /// Every outbound-call attempt timed out.
    OutboundExhausted,
    /// The click-to-call bus failed; terminal by design.
    BusFailed,
    /// A capability failed terminally while serving a leg.
    CapabilityFailed(CallRole),
}

/// Effects the engine runs after a step.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Queue a message on a leg.
    Speak(SpeakRequest),
    /// Launch the outbound-call orchestrator toward `origin`.
    StartOutboundCall { origin: String },
    /// Latch termination for both legs.
    Terminate,
}

fn speak(role: CallRole, purpose: SpeakPurpose, text: impl Into<String>) -> Effect {
    Effect::Speak(SpeakRequest {
        text: text.into(),
        role,
        purpose,
    })
}

/// Farewells for both legs plus the termination latch.
fn finalize(dialog: &mut DialogState, policy: &DialogPolicy) -> Result<Vec<Effect>> {
    dialog.advance(SessionState::Finished)?;
    let outcome = dialog.intent.authorization;
    Ok(vec![
        speak(
            CallRole::Visitor,
            SpeakPurpose::Farewell,
            policy.goodbye.visitor.for_outcome(outcome),
        ),
        speak(
            CallRole::Resident,
            SpeakPurpose::Farewell,
            policy.goodbye.resident.for_outcome(outcome),
        ),
        Effect::Terminate,
    ])
}

/// Advance one session by one event.
pub fn step(
    dialog: &mut DialogState,
    event: StepEvent,
    policy: &DialogPolicy,
) -> Result<Vec<Effect>> {
    // A finished session absorbs everything; handlers are already draining.
    if dialog.state == SessionState::Finished {
        return Ok(Vec::new());
    }

    match event {
        StepEvent::VisitorCollected(outcome) => {
            if dialog.state != SessionState::Collecting {
                // Visitor input during later stages is history only.
                return Ok(Vec::new());
            }
            match outcome {
                CollectOutcome::NeedMore { clarify } => Ok(vec![speak(
                    CallRole::Visitor,
                    SpeakPurpose::Clarification,
                    clarify,
                )]),
                CollectOutcome::ApartmentNotFound { apartment } => Ok(vec![speak(
                    CallRole::Visitor,
                    SpeakPurpose::Clarification,
                    policy.apartment_not_found(&apartment),
                )]),
                CollectOutcome::ResidentNotMatched { apartment } => Ok(vec![speak(
                    CallRole::Visitor,
                    SpeakPurpose::Clarification,
                    policy.resident_not_matched(&apartment),
                )]),
                CollectOutcome::Validated { origin } => {
                    dialog.intent.resident_voip_number = Some(origin.clone());
                    dialog.advance(SessionState::Validated)?;
                    dialog.advance(SessionState::Calling)?;
                    debug!("intent validated, dispatching outbound call");
                    Ok(vec![
                        speak(CallRole::Visitor, SpeakPurpose::Wait, policy.wait_message.as_str()),
                        Effect::StartOutboundCall { origin },
                    ])
                }
            }
        }

        StepEvent::ResidentConnected => {
            if matches!(
                dialog.state,
                SessionState::Validated | SessionState::Calling
            ) {
                dialog.advance(SessionState::CallInProgress)?;
            }
            Ok(Vec::new())
        }

        StepEvent::ResidentAudioReady => {
            if matches!(
                dialog.state,
                SessionState::Calling | SessionState::CallInProgress
            ) {
                dialog.advance(SessionState::WaitingResident)?;
                return Ok(vec![speak(
                    CallRole::Resident,
                    SpeakPurpose::Context,
                    policy.context_prompt(&dialog.intent),
                )]);
            }
            Ok(Vec::new())
        }

        StepEvent::ResidentText(text) => {
            // Both orders of resident-connects and resident-speaks are
            // handled: a first utterance arriving before the audio-ready
            // event still moves the session forward.
            if matches!(
                dialog.state,
                SessionState::Calling | SessionState::CallInProgress
            ) {
                dialog.advance(SessionState::WaitingResident)?;
                return Ok(vec![speak(
                    CallRole::Resident,
                    SpeakPurpose::Context,
                    policy.context_prompt(&dialog.intent),
                )]);
            }
            if dialog.state != SessionState::WaitingResident {
                return Ok(Vec::new());
            }
            match policy.classify(&text) {
                ResidentReply::Inquiry => Ok(vec![speak(
                    CallRole::Resident,
                    SpeakPurpose::Context,
                    policy.context_detail(&dialog.intent),
                )]),
                ResidentReply::Affirmative => {
                    dialog.set_authorization(AuthorizationResult::Authorized)?;
                    finalize(dialog, policy)
                }
                ResidentReply::Negative => {
                    dialog.set_authorization(AuthorizationResult::Denied)?;
                    finalize(dialog, policy)
                }
                ResidentReply::Ambiguous => Ok(vec![speak(
                    CallRole::Resident,
                    SpeakPurpose::Context,
                    policy.reask(),
                )]),
            }
        }

        StepEvent::LegTimeout(role) => {
            debug!(%role, "leg timed out");
            let mut effects = finalize(dialog, policy)?;
            // The timed-out leg hears the no-response farewell instead.
            effects.insert(
                0,
                speak(role, SpeakPurpose::Farewell, policy.no_response_message.as_str()),
            );
            Ok(effects)
        }

        StepEvent::LegHangup(role) => {
            debug!(%role, "leg hung up");
            finalize(dialog, policy)
        }

        StepEvent::OutboundExhausted => {
            let mut effects = finalize(dialog, policy)?;
            effects.insert(
                0,
                speak(
                    CallRole::Visitor,
                    SpeakPurpose::Farewell,
                    policy.unreachable_message.as_str(),
                ),
            );
            Ok(effects)
        }

        StepEvent::BusFailed => {
            let mut effects = finalize(dialog, policy)?;
            effects.insert(
                0,
                speak(
                    CallRole::Visitor,
                    SpeakPurpose::Farewell,
                    policy.apology_message.as_str(),
                ),
            );
            Ok(effects)
        }

        StepEvent::CapabilityFailed(role) => Ok(vec![speak(
            role,
            SpeakPurpose::Apology,
            policy.apology_message.as_str(),
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::VisitIntent;

    fn policy() -> DialogPolicy {
        DialogPolicy::from_config(&AppConfig::default())
    }

    fn validated_dialog() -> DialogState {
        let mut dialog = DialogState::default();
        dialog.intent = VisitIntent {
            intent_type: Some("delivery".to_string()),
            visitor_name: Some("Pedro".to_string()),
            apartment: Some("501".to_string()),
            resident_name: Some("Daniel".to_string()),
            resident_voip_number: None,
            authorization: None,
        };
        dialog
    }

    fn texts(effects: &[Effect]) -> Vec<(CallRole, String)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Speak(req) => Some((req.role, req.text.clone())),
                _ => None,
            })
            .collect()
    }

    fn has_terminate(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Terminate))
    }

    #[test]
    fn validation_success_dispatches_the_call() {
        let mut dialog = validated_dialog();
        let effects = step(
            &mut dialog,
            StepEvent::VisitorCollected(CollectOutcome::Validated {
                origin: "1003021".to_string(),
            }),
            &policy(),
        )
        .unwrap();

        assert_eq!(dialog.state, SessionState::Calling);
        assert_eq!(
            dialog.intent.resident_voip_number.as_deref(),
            Some("1003021")
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartOutboundCall { origin } if origin == "1003021"
        )));
        let spoken = texts(&effects);
        assert!(spoken.iter().any(|(role, text)| {
            *role == CallRole::Visitor && text.contains("wait")
        }));
    }

    #[test]
    fn fuzzy_mismatch_stays_collecting() {
        let mut dialog = validated_dialog();
        let effects = step(
            &mut dialog,
            StepEvent::VisitorCollected(CollectOutcome::ResidentNotMatched {
                apartment: "501".to_string(),
            }),
            &policy(),
        )
        .unwrap();

        assert_eq!(dialog.state, SessionState::Collecting);
        assert!(!has_terminate(&effects));
        let spoken = texts(&effects);
        assert!(spoken[0].1.contains("not"));
    }

    #[test]
    fn resident_yes_authorizes_and_finishes() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::WaitingResident;

        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("Yes, let him in.".to_string()),
            &policy(),
        )
        .unwrap();

        assert_eq!(dialog.state, SessionState::Finished);
        assert_eq!(
            dialog.intent.authorization,
            Some(AuthorizationResult::Authorized)
        );
        assert!(has_terminate(&effects));
        let spoken = texts(&effects);
        assert!(spoken
            .iter()
            .any(|(role, text)| *role == CallRole::Visitor && text.contains("authorized")));
    }

    #[test]
    fn resident_no_denies() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::WaitingResident;

        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("No.".to_string()),
            &policy(),
        )
        .unwrap();

        assert_eq!(
            dialog.intent.authorization,
            Some(AuthorizationResult::Denied)
        );
        assert!(has_terminate(&effects));
        let spoken = texts(&effects);
        assert!(spoken
            .iter()
            .any(|(role, text)| *role == CallRole::Visitor && text.contains("not authorized")));
    }

    #[test]
    fn resident_inquiry_stays_waiting() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::WaitingResident;

        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("Who is it?".to_string()),
            &policy(),
        )
        .unwrap();

        assert_eq!(dialog.state, SessionState::WaitingResident);
        assert!(dialog.intent.authorization.is_none());
        assert!(!has_terminate(&effects));
    }

    #[test]
    fn ambiguous_reply_is_reasked() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::WaitingResident;

        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("hmm maybe later".to_string()),
            &policy(),
        )
        .unwrap();

        assert_eq!(dialog.state, SessionState::WaitingResident);
        assert!(!has_terminate(&effects));
        assert_eq!(texts(&effects)[0].0, CallRole::Resident);
    }

    #[test]
    fn resident_text_promotes_from_calling_in_either_order() {
        // Text arrives before the audio-ready event was processed.
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Calling;
        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("hello".to_string()),
            &policy(),
        )
        .unwrap();
        assert_eq!(dialog.state, SessionState::WaitingResident);
        // The first utterance is consumed as the trigger: the context
        // prompt goes out, no decision is parsed.
        assert!(dialog.intent.authorization.is_none());
        assert_eq!(texts(&effects)[0].0, CallRole::Resident);

        // The late audio-ready event is then a no-op.
        let effects = step(&mut dialog, StepEvent::ResidentAudioReady, &policy()).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn audio_ready_prompts_without_resident_speech() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Calling;
        step(&mut dialog, StepEvent::ResidentConnected, &policy()).unwrap();
        assert_eq!(dialog.state, SessionState::CallInProgress);

        let effects = step(&mut dialog, StepEvent::ResidentAudioReady, &policy()).unwrap();
        assert_eq!(dialog.state, SessionState::WaitingResident);
        let spoken = texts(&effects);
        assert!(spoken[0].1.contains("501"));
        assert!(spoken[0].1.contains("Pedro"));
    }

    #[test]
    fn outbound_exhausted_tells_the_visitor() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Calling;

        let effects = step(&mut dialog, StepEvent::OutboundExhausted, &policy()).unwrap();
        assert_eq!(dialog.state, SessionState::Finished);
        assert!(has_terminate(&effects));
        let spoken = texts(&effects);
        assert!(spoken[0].1.contains("unable to reach"));
    }

    #[test]
    fn bus_failure_aborts_with_apology() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Calling;

        let effects = step(&mut dialog, StepEvent::BusFailed, &policy()).unwrap();
        assert_eq!(dialog.state, SessionState::Finished);
        assert!(has_terminate(&effects));
        assert!(texts(&effects)[0].1.contains("Sorry"));
    }

    #[test]
    fn finished_sessions_absorb_events() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Finished;

        let effects = step(
            &mut dialog,
            StepEvent::ResidentText("yes".to_string()),
            &policy(),
        )
        .unwrap();
        assert!(effects.is_empty());
        assert!(dialog.intent.authorization.is_none());
    }

    #[test]
    fn visitor_input_during_calling_is_ignored() {
        let mut dialog = validated_dialog();
        dialog.state = SessionState::Calling;

        let effects = step(
            &mut dialog,
            StepEvent::VisitorCollected(CollectOutcome::NeedMore {
                clarify: "say again?".to_string(),
            }),
            &policy(),
        )
        .unwrap();
        assert!(effects.is_empty());
        assert_eq!(dialog.state, SessionState::Calling);
    }

    #[test]
    fn timeout_finalizes_with_no_response_farewell() {
        let mut dialog = validated_dialog();
        let effects = step(
            &mut dialog,
            StepEvent::LegTimeout(CallRole::Visitor),
            &policy(),
        )
        .unwrap();
        assert_eq!(dialog.state, SessionState::Finished);
        assert!(has_terminate(&effects));
        assert!(texts(&effects)[0].1.contains("No response"));
    }

    #[test]
    fn capability_failure_is_not_terminal() {
        let mut dialog = validated_dialog();
        let effects = step(
            &mut dialog,
            StepEvent::CapabilityFailed(CallRole::Visitor),
            &policy(),
        )
        .unwrap();
        assert!(!has_terminate(&effects));
        assert_eq!(dialog.state, SessionState::Collecting);
    }
}
