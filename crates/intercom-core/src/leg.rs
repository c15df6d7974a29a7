//! Leg handler
//!
//! One handler per accepted TCP connection: a receive subtask that reads
//! frames, feeds the utterance collector and hands transcripts to the
//! dialog engine, and a send subtask that drains the leg's message queue
//! into paced SLIN frames. Both observe the termination latch at the poll
//! interval, so a latched session closes its legs within half a second of
//! the current I/O completing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use porteiro_audiosocket::{split, Frame, FrameSink, FrameStream, SLIN_FRAME_BYTES};
use porteiro_intercom_media::{
    build_detector, DetectorKind, EnergyVadConfig, PhraseCache, Utterance, UtteranceCollector,
    UtteranceFilters,
};

use crate::capabilities::{Extension, Synthesizer, Transcriber, TranscribeHints};
use crate::config::AppConfig;
use crate::dialog::{DialogEngine, DialogEvent};
use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::resources::ResourceManager;
use crate::session::{CallRole, Session, SessionState, SpeakPurpose, SpeakRequest};

/// Cadence at which both subtasks observe the termination latch.
const TERMINATE_POLL: Duration = Duration::from_millis(500);

/// Budget for the opening ID frame.
const ID_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a leg needs from the engine.
#[derive(Clone)]
pub struct LegDeps {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub resources: Arc<ResourceManager>,
    pub dialog: Arc<DialogEngine>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub cache: PhraseCache,
}

/// State shared between the receive and send subtasks of one leg.
struct LegShared {
    collector: UtteranceCollector,
    /// Inbound frames still to drop after our own audio (echo tail).
    discard_remaining: usize,
    /// The send subtask is currently emitting audio.
    sending: bool,
    last_outbound_done: Option<Instant>,
}

/// Handle one accepted connection until it closes.
pub async fn run(deps: LegDeps, role: CallRole, stream: TcpStream, extension: Arc<Extension>) {
    let local_port = match role {
        CallRole::Resident => extension.return_port,
        _ => extension.ia_port,
    };
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut rx, tx) = split(stream);

    // The first frame must announce the call id.
    let call_id = match tokio::time::timeout(ID_FRAME_TIMEOUT, rx.read_frame()).await {
        Ok(Ok(Frame::Id(call_id))) => call_id,
        Ok(Ok(other)) => {
            warn!(%role, %peer, kind = other.kind(), "expected ID frame, closing");
            return;
        }
        Ok(Err(error)) => {
            warn!(%role, %peer, %error, "failed reading opening frame");
            return;
        }
        Err(_) => {
            warn!(%role, %peer, "no ID frame within budget, closing");
            return;
        }
    };

    let (session, created) = deps.registry.get_or_create(call_id);
    session.acquire_ref();
    info!(%call_id, %role, %peer, created, "leg attached");

    if role == CallRole::Visitor {
        session.set_building(extension.building_id);
    }

    let collector = match build_collector(&deps.config, role) {
        Ok(collector) => collector,
        Err(error) => {
            warn!(%call_id, %error, "detector configuration invalid, closing leg");
            deps.registry.release_reference(&session);
            return;
        }
    };
    let shared = Arc::new(Mutex::new(LegShared {
        collector,
        discard_remaining: 0,
        sending: false,
        last_outbound_done: None,
    }));

    let tx = Arc::new(tokio::sync::Mutex::new(tx));
    deps.resources
        .register_connection(call_id, role, &tx, local_port);

    if role == CallRole::Visitor {
        schedule_greeting(&deps, &session);
    } else if role == CallRole::Resident {
        // No greeting on the resident leg; the context prompt comes from
        // the state machine once the audio path is up.
        session.mark_resident_attached();
        deps.dialog.dispatch(call_id, DialogEvent::ResidentConnected).await;
        deps.dialog
            .dispatch(call_id, DialogEvent::ResidentAudioReady)
            .await;
    }

    let send_task = tokio::spawn(send_loop(
        deps.clone(),
        Arc::clone(&session),
        Arc::clone(&shared),
        Arc::clone(&tx),
        role,
    ));

    recv_loop(&deps, &session, &shared, &mut rx, role).await;

    if let Err(error) = send_task.await {
        warn!(%call_id, %role, %error, "send subtask panicked");
    }

    deps.resources.unregister_connection(call_id, role);
    deps.registry.release_reference(&session);
    info!(%call_id, %role, "leg closed");
}

fn build_collector(config: &AppConfig, role: CallRole) -> Result<UtteranceCollector> {
    let kind = DetectorKind::parse(&config.system.voice_detection_type)?;
    let detector = build_detector(
        kind,
        EnergyVadConfig::default(),
        config.system.azure_speech_segment_timeout_ms,
    )?;
    let filters = UtteranceFilters {
        anti_echo_guard: config.system.anti_echo_guard(),
        // Short utterances survive on the resident leg: "yes" and "no"
        // are the whole point of that conversation.
        retain_short: role == CallRole::Resident,
        ..UtteranceFilters::default()
    };
    Ok(UtteranceCollector::new(detector, filters))
}

fn schedule_greeting(deps: &LegDeps, session: &Arc<Session>) {
    let session = Arc::clone(session);
    let greeting = deps.config.greeting.clone();
    tokio::spawn(async move {
        tokio::time::sleep(greeting.delay()).await;
        if !session.latches.is_set(CallRole::Visitor) {
            session.enqueue(SpeakRequest {
                text: greeting.message,
                role: CallRole::Visitor,
                purpose: SpeakPurpose::Greeting,
            });
        }
    });
}

async fn recv_loop(
    deps: &LegDeps,
    session: &Arc<Session>,
    shared: &Arc<Mutex<LegShared>>,
    rx: &mut FrameStream,
    role: CallRole,
) {
    let call_id = session.call_id;
    let leg_started = Instant::now();
    let mut last_speech_activity = leg_started;
    let mut timeout_reported = false;

    loop {
        match tokio::time::timeout(TERMINATE_POLL, rx.read_frame()).await {
            Err(_elapsed) => {}
            Ok(Err(error)) => {
                if error.is_expected_reset() {
                    info!(%call_id, %role, "peer closed the stream");
                } else {
                    warn!(%call_id, %role, %error, "frame read failed");
                }
                deps.dialog.dispatch(call_id, DialogEvent::LegHangup(role)).await;
                break;
            }
            Ok(Ok(frame)) => match frame {
                Frame::Hangup => {
                    info!(%call_id, %role, "hangup frame received");
                    deps.dialog.dispatch(call_id, DialogEvent::LegHangup(role)).await;
                    break;
                }
                Frame::Error { code, .. } => {
                    warn!(%call_id, %role, code, "error frame received");
                    deps.dialog.dispatch(call_id, DialogEvent::LegHangup(role)).await;
                    break;
                }
                // A repeated ID frame is tolerated as a no-op.
                Frame::Id(_) => {}
                Frame::Audio(pcm) => {
                    session.touch();
                    let now = Instant::now();
                    let utterance = {
                        let mut shared = shared.lock();
                        if shared.discard_remaining > 0 {
                            shared.discard_remaining -= 1;
                            None
                        } else {
                            let utterance = shared.collector.push_frame(&pcm, now);
                            if shared.collector.speech_in_progress() {
                                last_speech_activity = now;
                            }
                            utterance
                        }
                    };
                    if let Some(utterance) = utterance {
                        last_speech_activity = now;
                        handle_utterance(deps, session, role, utterance).await;
                    }
                }
            },
        }

        let now = Instant::now();
        if session.latches.is_set(role) {
            debug!(%call_id, %role, "termination latch observed, receive loop exiting");
            break;
        }

        // Deadlock watchdog: a speech start with no end gets force-closed
        // from the collected audio.
        let forced = {
            let mut shared = shared.lock();
            if shared.collector.watchdog_expired(now) {
                warn!(%call_id, %role, "speech watchdog expired, force-closing utterance");
                shared.collector.force_close()
            } else {
                None
            }
        };
        if let Some(utterance) = forced {
            last_speech_activity = now;
            handle_utterance(deps, session, role, utterance).await;
        }

        if !timeout_reported
            && now.duration_since(leg_started) > deps.config.system.max_transaction_time()
        {
            info!(%call_id, %role, "transaction time budget exceeded");
            timeout_reported = true;
            deps.dialog.dispatch(call_id, DialogEvent::LegTimeout(role)).await;
            continue;
        }

        if !timeout_reported {
            if let Some(budget) = silence_budget(deps, session, role) {
                let (sending, outbound_done) = {
                    let shared = shared.lock();
                    (shared.sending, shared.last_outbound_done)
                };
                let speech_pending = shared.lock().collector.speech_in_progress();
                let waiting_on_us = sending || session.queue_len(role) > 0 || speech_pending;
                let anchor = outbound_done
                    .unwrap_or(leg_started)
                    .max(last_speech_activity);
                if !waiting_on_us && now.duration_since(anchor) > budget {
                    info!(%call_id, %role, "silence budget exceeded");
                    timeout_reported = true;
                    deps.dialog.dispatch(call_id, DialogEvent::LegTimeout(role)).await;
                }
            }
        }
    }
}

/// The silence budget applies only while the dialog is waiting on this
/// leg to speak: the visitor during collection, the resident while their
/// decision is pending.
fn silence_budget(deps: &LegDeps, session: &Arc<Session>, role: CallRole) -> Option<Duration> {
    match (role, session.state_hint()) {
        (CallRole::Visitor, SessionState::Collecting) => {
            Some(deps.config.system.silence_threshold())
        }
        (CallRole::Resident, SessionState::WaitingResident) => {
            Some(deps.config.system.resident_max_silence())
        }
        _ => None,
    }
}

async fn handle_utterance(
    deps: &LegDeps,
    session: &Arc<Session>,
    role: CallRole,
    utterance: Utterance,
) {
    let call_id = session.call_id;
    let _permit = deps.resources.acquire_transcription().await;
    if session.latches.is_set(role) {
        return;
    }

    let hints = TranscribeHints {
        language: deps.config.speech.language.clone(),
        segment_timeout: (role == CallRole::Resident).then(|| {
            Duration::from_millis(deps.config.speech.resident_segment_timeout_ms)
        }),
        expect_short: role == CallRole::Resident,
    };

    match deps.transcriber.transcribe(&utterance.pcm, &hints).await {
        Ok(text) => {
            let text = text.trim().to_string();
            if text.is_empty() {
                debug!(%call_id, %role, "empty transcription, ignoring");
                return;
            }
            debug!(%call_id, %role, frames = utterance.frames, %text, "utterance transcribed");
            let event = match role {
                CallRole::Visitor => DialogEvent::VisitorText(text),
                CallRole::Resident => DialogEvent::ResidentText(text),
                CallRole::System => return,
            };
            deps.dialog.dispatch(call_id, event).await;
        }
        Err(error) => {
            warn!(%call_id, %role, %error, "transcription failed terminally");
            deps.dialog
                .dispatch(call_id, DialogEvent::CapabilityFailed(role))
                .await;
        }
    }
}

async fn send_loop(
    deps: LegDeps,
    session: Arc<Session>,
    shared: Arc<Mutex<LegShared>>,
    tx: Arc<tokio::sync::Mutex<FrameSink>>,
    role: CallRole,
) {
    let call_id = session.call_id;
    loop {
        if session.latches.is_set(role) {
            // Drain at most one farewell, then hang up.
            if let Some(farewell) = session.take_farewell(role) {
                if let Err(error) = speak(&deps, &shared, &tx, &farewell).await {
                    if error.is_expected_reset() {
                        info!(%call_id, %role, "peer reset during farewell");
                    } else {
                        warn!(%call_id, %role, %error, "farewell delivery failed");
                    }
                }
            }
            tokio::time::sleep(deps.config.system.goodbye_delay()).await;
            let mut sink = tx.lock().await;
            match sink.send_hangup().await {
                Ok(()) => debug!(%call_id, %role, "hangup frame sent"),
                Err(error) if error.is_expected_reset() => {
                    info!(%call_id, %role, "peer reset before hangup")
                }
                Err(error) => warn!(%call_id, %role, %error, "hangup write failed"),
            }
            if let Err(error) = sink.close().await {
                if error.is_expected_reset() {
                    info!(%call_id, %role, "peer reset during close");
                } else {
                    warn!(%call_id, %role, %error, "close failed");
                }
            }
            break;
        }

        match session.dequeue(role) {
            Some(request) => {
                debug!(%call_id, %role, purpose = ?request.purpose, "speaking queued message");
                if let Err(error) = speak(&deps, &shared, &tx, &request).await {
                    if error.is_expected_reset() {
                        info!(%call_id, %role, "peer reset during audio");
                    } else {
                        warn!(%call_id, %role, %error, "audio write failed");
                    }
                    deps.dialog.dispatch(call_id, DialogEvent::LegHangup(role)).await;
                    break;
                }
            }
            None => {
                let signal = match role {
                    CallRole::Visitor => &session.visitor_signal,
                    _ => &session.resident_signal,
                };
                // Wake on enqueue or latch, or poll after the interval.
                let _ = tokio::time::timeout(TERMINATE_POLL, signal.notified()).await;
            }
        }
    }
}

/// Synthesize (through the cache) and emit one message as paced SLIN
/// frames, then run the echo-suppression tail.
async fn speak(
    deps: &LegDeps,
    shared: &Arc<Mutex<LegShared>>,
    tx: &Arc<tokio::sync::Mutex<FrameSink>>,
    request: &SpeakRequest,
) -> Result<()> {
    let voice = &deps.config.speech.voice;
    let pcm = match deps.cache.get(voice, &request.text).await {
        Some(pcm) => {
            deps.resources.record_cache_hit();
            pcm
        }
        None => {
            let _permit = deps.resources.acquire_synthesis().await;
            match deps.synthesizer.synthesize(&request.text, voice).await {
                Ok(pcm) => {
                    if let Err(error) = deps.cache.put(voice, &request.text, &pcm).await {
                        warn!(%error, "phrase cache write failed");
                    }
                    pcm
                }
                Err(error) => {
                    // The message is lost but the leg stays usable.
                    warn!(%error, "synthesis failed terminally, skipping message");
                    return Ok(());
                }
            }
        }
    };

    shared.lock().sending = true;
    let result = emit_paced(deps, tx, &pcm).await;
    tokio::time::sleep(deps.config.audio.post_audio_delay()).await;
    {
        let now = Instant::now();
        let mut shared = shared.lock();
        shared.sending = false;
        shared.discard_remaining = deps.config.audio.discard_buffer_frames;
        shared.last_outbound_done = Some(now);
        shared.collector.note_outbound_complete(now);
        shared.collector.reset();
    }
    result
}

async fn emit_paced(
    deps: &LegDeps,
    tx: &Arc<tokio::sync::Mutex<FrameSink>>,
    pcm: &Bytes,
) -> Result<()> {
    let mut offset = 0;
    while offset < pcm.len() {
        let end = (offset + SLIN_FRAME_BYTES).min(pcm.len());
        let frame = Frame::Audio(pcm.slice(offset..end));
        // Lock per frame so a targeted hangup can interleave.
        tx.lock().await.write_frame(&frame).await?;
        offset = end;
        // Pacing is re-read every frame: the throttle may engage mid-message.
        tokio::time::sleep(deps.resources.transmission_delay()).await;
    }
    Ok(())
}
