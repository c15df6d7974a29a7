//! Utterance collection
//!
//! Sits between the detector and transcription. Buffers speech audio,
//! applies the cooperative false-positive filters to every end-of-speech,
//! and keeps a rolling pre-buffer so detectors that only report segment
//! ends still yield usable audio.
//!
//! Filters, in order:
//! 1. anti-echo guard after our own outbound audio,
//! 2. bare end without any observed speech start,
//! 3. minimum utterance length (waived where short replies matter),
//! 4. minimum average energy over the trailing speech frames.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::energy::frame_energy;
use crate::vad::{VadEvent, VoiceDetector};

/// Frames seeded from the pre-buffer at speech onset, to keep the word
/// attack that precedes the detector's trigger frame.
const ONSET_SEED_FRAMES: usize = 10;

/// A completed utterance ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Collected SLIN audio, onset seed included.
    pub pcm: Vec<u8>,
    /// Frames observed while speech was in progress.
    pub frames: usize,
    /// Set when the watchdog force-closed the utterance.
    pub forced: bool,
}

/// Filter thresholds applied at end-of-speech.
#[derive(Debug, Clone)]
pub struct UtteranceFilters {
    /// Drop ends arriving this soon after our own audio finished.
    pub anti_echo_guard: Duration,
    /// Minimum utterance length in frames.
    pub min_frames: usize,
    /// Keep utterances below `min_frames` (resident leg, yes/no replies).
    pub retain_short: bool,
    /// Minimum average energy of the trailing speech frames.
    pub admit_energy: f32,
    /// Rolling pre-buffer capacity in frames (2 s at 20 ms).
    pub pre_buffer_frames: usize,
    /// Force-close an utterance whose start never ends.
    pub watchdog: Duration,
}

impl Default for UtteranceFilters {
    fn default() -> Self {
        Self {
            anti_echo_guard: Duration::from_millis(1500),
            min_frames: 15,
            retain_short: false,
            admit_energy: 600.0,
            pre_buffer_frames: 100,
            watchdog: Duration::from_secs(10),
        }
    }
}

/// Per-leg utterance collector.
pub struct UtteranceCollector {
    detector: Box<dyn VoiceDetector>,
    filters: UtteranceFilters,
    pre_buffer: VecDeque<Vec<u8>>,
    collected: Vec<u8>,
    collected_frames: usize,
    energies: Vec<f32>,
    speech_started: bool,
    started_at: Option<Instant>,
    last_outbound_done: Option<Instant>,
}

impl UtteranceCollector {
    pub fn new(detector: Box<dyn VoiceDetector>, filters: UtteranceFilters) -> Self {
        Self {
            detector,
            filters,
            pre_buffer: VecDeque::new(),
            collected: Vec::new(),
            collected_frames: 0,
            energies: Vec::new(),
            speech_started: false,
            started_at: None,
            last_outbound_done: None,
        }
    }

    /// Feed one inbound SLIN frame. Returns a completed utterance once an
    /// end-of-speech survives every filter.
    pub fn push_frame(&mut self, pcm: &[u8], now: Instant) -> Option<Utterance> {
        let energy = frame_energy(pcm);

        // Detectors that never report a start (streaming recognizers) still
        // need collection to begin; an energetic frame opens it ourselves.
        if !self.speech_started && energy >= self.filters.admit_energy {
            self.begin_speech(now);
        }

        self.pre_buffer.push_back(pcm.to_vec());
        while self.pre_buffer.len() > self.filters.pre_buffer_frames {
            self.pre_buffer.pop_front();
        }

        if self.speech_started {
            self.collected.extend_from_slice(pcm);
            self.collected_frames += 1;
            self.energies.push(energy);
        }

        match self.detector.process_frame(pcm, energy) {
            VadEvent::None => None,
            VadEvent::SpeechStart => {
                if !self.speech_started {
                    self.begin_speech(now);
                }
                None
            }
            VadEvent::SpeechEnd => self.finish_speech(now),
        }
    }

    fn begin_speech(&mut self, now: Instant) {
        self.speech_started = true;
        self.started_at = Some(now);
        self.collected.clear();
        self.collected_frames = 0;
        self.energies.clear();
        // Seed the attack from the residual pre-buffer; seeded frames do
        // not count toward the minimum-length filter.
        let seed_from = self.pre_buffer.len().saturating_sub(ONSET_SEED_FRAMES);
        for frame in self.pre_buffer.iter().skip(seed_from) {
            self.collected.extend_from_slice(frame);
        }
        trace!("utterance collection started");
    }

    fn finish_speech(&mut self, now: Instant) -> Option<Utterance> {
        if let Some(done) = self.last_outbound_done {
            if now.duration_since(done) < self.filters.anti_echo_guard {
                debug!("dropping speech end inside anti-echo guard period");
                self.clear_collection();
                return None;
            }
        }

        if !self.speech_started {
            debug!("dropping bare speech end without a start");
            self.clear_collection();
            return None;
        }

        // Effective length stops at the last energetic frame: the closing
        // silence run never counts toward the minimum.
        let speech_frames = self
            .energies
            .iter()
            .rposition(|&e| e >= self.filters.admit_energy)
            .map(|i| i + 1)
            .unwrap_or(0);

        if speech_frames < self.filters.min_frames && !self.filters.retain_short {
            debug!(frames = speech_frames, "dropping utterance below minimum length");
            self.clear_collection();
            return None;
        }

        if self.trailing_energy(speech_frames) < self.filters.admit_energy {
            debug!("dropping utterance below energy threshold");
            self.clear_collection();
            return None;
        }

        let utterance = Utterance {
            pcm: std::mem::take(&mut self.collected),
            frames: speech_frames,
            forced: false,
        };
        self.clear_collection();
        Some(utterance)
    }

    /// Average energy over the final speech frames, with the closing
    /// silence run trimmed so the tail of an utterance does not dilute it.
    fn trailing_energy(&self, speech_frames: usize) -> f32 {
        if speech_frames == 0 || speech_frames > self.energies.len() {
            return 0.0;
        }
        let window = self.filters.min_frames.max(1).min(speech_frames);
        let tail = &self.energies[speech_frames - window..speech_frames];
        tail.iter().sum::<f32>() / tail.len() as f32
    }

    /// True while a speech start is pending its end.
    pub fn speech_in_progress(&self) -> bool {
        self.speech_started
    }

    /// True when a start has gone unanswered past the watchdog budget.
    pub fn watchdog_expired(&self, now: Instant) -> bool {
        match self.started_at {
            Some(started) if self.speech_started => {
                now.duration_since(started) > self.filters.watchdog
            }
            _ => false,
        }
    }

    /// Force-close the utterance in progress using the pre-buffered and
    /// collected audio. Length and energy filters do not apply.
    pub fn force_close(&mut self) -> Option<Utterance> {
        if !self.speech_started || self.collected.is_empty() {
            self.clear_collection();
            return None;
        }
        let utterance = Utterance {
            pcm: std::mem::take(&mut self.collected),
            frames: self.collected_frames,
            forced: true,
        };
        self.clear_collection();
        self.detector.reset();
        Some(utterance)
    }

    /// Record that our own outbound audio just finished; end-of-speech
    /// events inside the guard period from this instant are echoes.
    pub fn note_outbound_complete(&mut self, now: Instant) {
        self.last_outbound_done = Some(now);
    }

    /// Clear the in-progress flag, the pre-buffer and the collected audio.
    /// The anti-echo timestamp survives; the guard applies across resets.
    pub fn reset(&mut self) {
        self.clear_collection();
        self.pre_buffer.clear();
        self.detector.reset();
    }

    fn clear_collection(&mut self) {
        self.collected.clear();
        self.collected_frames = 0;
        self.energies.clear();
        self.speech_started = false;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::{EnergyVad, EnergyVadConfig};

    /// Scripted detector for exercising filter paths directly.
    struct Scripted {
        events: VecDeque<VadEvent>,
    }

    impl Scripted {
        fn new(events: Vec<VadEvent>) -> Box<dyn VoiceDetector> {
            Box::new(Self {
                events: events.into(),
            })
        }
    }

    impl VoiceDetector for Scripted {
        fn process_frame(&mut self, _pcm: &[u8], _energy: f32) -> VadEvent {
            self.events.pop_front().unwrap_or(VadEvent::None)
        }

        fn reset(&mut self) {}
    }

    fn tone_frame(amplitude: i16) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(320);
        for i in 0..160 {
            let value = if i % 2 == 0 { amplitude } else { -amplitude };
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        pcm
    }

    fn energy_collector(filters: UtteranceFilters) -> UtteranceCollector {
        let vad = EnergyVad::new(EnergyVadConfig {
            start_energy: 600.0,
            end_energy: 800.0,
            end_silence_frames: 5,
        })
        .unwrap();
        UtteranceCollector::new(Box::new(vad), filters)
    }

    fn run_utterance(
        collector: &mut UtteranceCollector,
        amplitude: i16,
        speech_frames: usize,
        now: Instant,
    ) -> Option<Utterance> {
        let speech = tone_frame(amplitude);
        let silence = tone_frame(0);
        for _ in 0..speech_frames {
            if let Some(u) = collector.push_frame(&speech, now) {
                return Some(u);
            }
        }
        for _ in 0..10 {
            if let Some(u) = collector.push_frame(&silence, now) {
                return Some(u);
            }
        }
        None
    }

    #[test]
    fn long_loud_utterance_is_admitted() {
        let mut collector = energy_collector(UtteranceFilters::default());
        let utterance = run_utterance(&mut collector, 3000, 20, Instant::now()).unwrap();
        assert!(utterance.frames >= 20);
        assert!(!utterance.pcm.is_empty());
        assert!(!utterance.forced);
    }

    #[test]
    fn short_utterance_dropped_unless_retained() {
        let now = Instant::now();
        let mut visitor = energy_collector(UtteranceFilters::default());
        assert!(run_utterance(&mut visitor, 3000, 9, now).is_none());

        let mut resident = energy_collector(UtteranceFilters {
            retain_short: true,
            ..UtteranceFilters::default()
        });
        let short = run_utterance(&mut resident, 3000, 9, now).unwrap();
        assert!(short.frames < 15);
    }

    #[test]
    fn energy_boundary_is_strict() {
        let now = Instant::now();
        // Square wave RMS equals its amplitude: 600 passes, 599 does not.
        let mut at_threshold = energy_collector(UtteranceFilters::default());
        assert!(run_utterance(&mut at_threshold, 600, 20, now).is_some());

        // Detector opens at 500 so only the admission filter rejects 599.
        let below_vad = EnergyVad::new(EnergyVadConfig {
            start_energy: 500.0,
            end_energy: 800.0,
            end_silence_frames: 5,
        })
        .unwrap();
        let mut below =
            UtteranceCollector::new(Box::new(below_vad), UtteranceFilters::default());
        assert!(run_utterance(&mut below, 599, 20, now).is_none());
    }

    #[test]
    fn anti_echo_guard_drops_ends_inside_window() {
        let t0 = Instant::now();
        let mut collector = energy_collector(UtteranceFilters::default());
        collector.note_outbound_complete(t0);

        // End lands 1 s after outbound completion: inside the 1.5 s guard.
        assert!(run_utterance(&mut collector, 3000, 20, t0 + Duration::from_secs(1)).is_none());
        // Same shape at 2 s is admitted.
        assert!(run_utterance(&mut collector, 3000, 20, t0 + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn bare_speech_end_is_dropped() {
        let mut collector = UtteranceCollector::new(
            Scripted::new(vec![VadEvent::SpeechEnd]),
            UtteranceFilters::default(),
        );
        // Silent frame: no internal start, scripted end arrives bare.
        assert!(collector.push_frame(&tone_frame(0), Instant::now()).is_none());
    }

    #[test]
    fn segment_only_detector_still_yields_audio() {
        // Detector emits just an end; the energetic frames opened
        // collection internally and the pre-buffer covered the onset.
        let mut events = vec![VadEvent::None; 20];
        events.push(VadEvent::SpeechEnd);
        let mut collector = UtteranceCollector::new(
            Scripted::new(events),
            UtteranceFilters::default(),
        );
        let speech = tone_frame(3000);
        let now = Instant::now();
        let mut result = None;
        for _ in 0..21 {
            if let Some(u) = collector.push_frame(&speech, now) {
                result = Some(u);
            }
        }
        let utterance = result.expect("utterance should be admitted");
        assert!(utterance.frames >= 15);
    }

    #[test]
    fn watchdog_force_closes_a_stuck_utterance() {
        let t0 = Instant::now();
        let mut collector = energy_collector(UtteranceFilters::default());
        let speech = tone_frame(3000);
        for _ in 0..5 {
            assert!(collector.push_frame(&speech, t0).is_none());
        }
        assert!(collector.speech_in_progress());
        assert!(!collector.watchdog_expired(t0 + Duration::from_secs(9)));
        assert!(collector.watchdog_expired(t0 + Duration::from_secs(11)));

        let utterance = collector.force_close().unwrap();
        assert!(utterance.forced);
        assert!(!collector.speech_in_progress());
    }

    #[test]
    fn reset_clears_buffers_but_not_echo_guard() {
        let t0 = Instant::now();
        let mut collector = energy_collector(UtteranceFilters::default());
        collector.note_outbound_complete(t0);
        let speech = tone_frame(3000);
        for _ in 0..5 {
            collector.push_frame(&speech, t0);
        }
        collector.reset();
        assert!(!collector.speech_in_progress());
        // The guard still applies after the reset.
        assert!(run_utterance(&mut collector, 3000, 20, t0 + Duration::from_secs(1)).is_none());
    }
}
