//! Audio-side building blocks for the intercom service
//!
//! This crate owns everything between raw SLIN frames and transcription
//! requests: voice activity detection (two interchangeable detectors),
//! utterance collection with the cooperative false-positive filters, and
//! the content-addressed cache of synthesized phrases.
//!
//! Audio payloads are opaque signed 16-bit little-endian PCM at 8 kHz mono;
//! no codec work happens here.

pub mod cache;
mod energy;
mod error;
pub mod utterance;
pub mod vad;

pub use cache::PhraseCache;
pub use energy::frame_energy;
pub use error::{MediaError, Result};
pub use utterance::{Utterance, UtteranceCollector, UtteranceFilters};
pub use vad::{build_detector, DetectorKind, EnergyVad, EnergyVadConfig, SegmentVad, VadEvent, VoiceDetector};
