//! Voice Activity Detection
//!
//! Two interchangeable detectors satisfy [`VoiceDetector`]; selection comes
//! from configuration (`system.voice_detection_type`).
//!
//! - [`EnergyVad`] (`basic-vad`) opens an utterance when frame energy rises
//!   above the start threshold and closes it after a run of quiet frames.
//! - [`SegmentVad`] (`streaming-recognizer`) models an external streaming
//!   recognizer that only reports end-of-segment after its silence timeout;
//!   it never emits a start, which is what the collector's pre-buffer is
//!   there to compensate for.

use tracing::trace;

use crate::error::{MediaError, Result};

/// Event emitted for a single 20 ms frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Nothing changed.
    None,
    /// Speech onset detected at this frame.
    SpeechStart,
    /// The utterance in progress ended before this frame.
    SpeechEnd,
}

/// Per-frame speech/silence classifier.
///
/// Implementations receive each SLIN frame together with its RMS energy
/// (computed once by the caller) and keep whatever running state they need.
pub trait VoiceDetector: Send {
    fn process_frame(&mut self, pcm: &[u8], energy: f32) -> VadEvent;

    /// Clear all running state, as if no audio had been seen.
    fn reset(&mut self);
}

/// Detector selection, parsed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    BasicVad,
    StreamingRecognizer,
}

impl DetectorKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "basic-vad" => Ok(DetectorKind::BasicVad),
            "streaming-recognizer" => Ok(DetectorKind::StreamingRecognizer),
            other => Err(MediaError::UnknownDetector(other.to_string())),
        }
    }
}

/// Configuration for [`EnergyVad`].
#[derive(Debug, Clone)]
pub struct EnergyVadConfig {
    /// Energy that opens an utterance.
    pub start_energy: f32,
    /// Frames below this confirm end of speech.
    pub end_energy: f32,
    /// Consecutive quiet frames that close an utterance.
    pub end_silence_frames: usize,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            start_energy: 600.0,
            end_energy: 800.0,
            end_silence_frames: 25,
        }
    }
}

/// Energy-threshold detector with a silence-run close.
pub struct EnergyVad {
    config: EnergyVadConfig,
    in_speech: bool,
    silence_run: usize,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Result<Self> {
        if config.start_energy < 0.0 || config.end_energy < 0.0 {
            return Err(MediaError::InvalidConfig(
                "energy thresholds must be non-negative".to_string(),
            ));
        }
        if config.end_silence_frames == 0 {
            return Err(MediaError::InvalidConfig(
                "end_silence_frames must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            in_speech: false,
            silence_run: 0,
        })
    }
}

impl VoiceDetector for EnergyVad {
    fn process_frame(&mut self, _pcm: &[u8], energy: f32) -> VadEvent {
        if !self.in_speech {
            if energy >= self.config.start_energy {
                self.in_speech = true;
                self.silence_run = 0;
                trace!(energy, "speech start");
                return VadEvent::SpeechStart;
            }
            return VadEvent::None;
        }

        if energy < self.config.end_energy {
            self.silence_run += 1;
            if self.silence_run >= self.config.end_silence_frames {
                self.in_speech = false;
                self.silence_run = 0;
                trace!("speech end");
                return VadEvent::SpeechEnd;
            }
        } else {
            self.silence_run = 0;
        }
        VadEvent::None
    }

    fn reset(&mut self) {
        self.in_speech = false;
        self.silence_run = 0;
    }
}

/// End-of-segment detector modelled on a streaming recognizer.
///
/// Reports only `SpeechEnd`, once the configured segment timeout of quiet
/// frames has elapsed after any energetic audio.
pub struct SegmentVad {
    activity_energy: f32,
    timeout_frames: usize,
    speech_seen: bool,
    silence_run: usize,
}

impl SegmentVad {
    pub fn new(activity_energy: f32, segment_timeout_ms: u64) -> Self {
        // One frame per 20 ms; at least one frame of timeout.
        let timeout_frames = ((segment_timeout_ms + 19) / 20).max(1) as usize;
        Self {
            activity_energy,
            timeout_frames,
            speech_seen: false,
            silence_run: 0,
        }
    }
}

impl VoiceDetector for SegmentVad {
    fn process_frame(&mut self, _pcm: &[u8], energy: f32) -> VadEvent {
        if energy >= self.activity_energy {
            self.speech_seen = true;
            self.silence_run = 0;
            return VadEvent::None;
        }
        if self.speech_seen {
            self.silence_run += 1;
            if self.silence_run >= self.timeout_frames {
                self.speech_seen = false;
                self.silence_run = 0;
                return VadEvent::SpeechEnd;
            }
        }
        VadEvent::None
    }

    fn reset(&mut self) {
        self.speech_seen = false;
        self.silence_run = 0;
    }
}

/// Build the configured detector.
pub fn build_detector(
    kind: DetectorKind,
    energy: EnergyVadConfig,
    segment_timeout_ms: u64,
) -> Result<Box<dyn VoiceDetector>> {
    match kind {
        DetectorKind::BasicVad => Ok(Box::new(EnergyVad::new(energy)?)),
        DetectorKind::StreamingRecognizer => Ok(Box::new(SegmentVad::new(
            energy.start_energy,
            segment_timeout_ms,
        ))),
    }
}
