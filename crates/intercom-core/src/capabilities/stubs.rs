//! In-memory capability implementations
//!
//! Deterministic stand-ins used by the test suites to drive full
//! conversations without external services. These are never wired up as
//! runtime fallbacks; the real providers fail loudly instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::capabilities::{
    ClickToCallPublisher, ClickToCallRequest, DirectoryChange, DirectoryEntry, DirectoryStore,
    DirectoryWatcher, ExtractionOutcome, ExtractionStage, Extension, IntentExtractor, Synthesizer,
    Transcriber, TranscribeHints,
};
use crate::error::{EngineError, Result};
use crate::session::{Turn, VisitIntent};

/// Transcriber that replays a scripted sequence of texts.
#[derive(Default)]
pub struct ScriptedTranscriber {
    texts: Mutex<VecDeque<String>>,
}

impl ScriptedTranscriber {
    pub fn new(texts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            texts: Mutex::new(texts.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        self.texts.lock().push_back(text.into());
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio: &[u8], _hints: &TranscribeHints) -> Result<String> {
        self.texts
            .lock()
            .pop_front()
            .ok_or_else(|| EngineError::CapabilityTransient("transcript script exhausted".into()))
    }
}

/// Synthesizer returning a fixed number of constant-amplitude frames.
pub struct TextLengthSynthesizer {
    frames_per_message: usize,
}

impl TextLengthSynthesizer {
    pub fn new(frames_per_message: usize) -> Self {
        Self { frames_per_message }
    }
}

impl Default for TextLengthSynthesizer {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl Synthesizer for TextLengthSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Bytes> {
        let mut pcm = Vec::with_capacity(self.frames_per_message * 320);
        for _ in 0..self.frames_per_message * 160 {
            pcm.extend_from_slice(&500i16.to_le_bytes());
        }
        Ok(Bytes::from(pcm))
    }
}

/// Extractor replaying scripted stage outcomes in call order.
#[derive(Default)]
pub struct ScriptedExtractor {
    outcomes: Mutex<VecDeque<ExtractionOutcome>>,
}

impl ScriptedExtractor {
    pub fn new(outcomes: impl IntoIterator<Item = ExtractionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

#[async_trait]
impl IntentExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        _stage: ExtractionStage,
        _history: &[Turn],
        _partial: &VisitIntent,
    ) -> Result<ExtractionOutcome> {
        self.outcomes
            .lock()
            .pop_front()
            .ok_or_else(|| EngineError::CapabilityTransient("extraction script exhausted".into()))
    }
}

/// Publisher that records requests and wakes waiters.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<ClickToCallRequest>>,
    pub notify: Notify,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<ClickToCallRequest> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl ClickToCallPublisher for RecordingPublisher {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<()> {
        self.published.lock().push(request.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Publisher that always fails with a bus transport error.
#[derive(Default)]
pub struct FailingPublisher;

#[async_trait]
impl ClickToCallPublisher for FailingPublisher {
    async fn publish(&self, _request: &ClickToCallRequest) -> Result<()> {
        Err(EngineError::BusFatal("connection refused".into()))
    }
}

/// Fixed in-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    extensions: Vec<Extension>,
    apartments: HashMap<String, DirectoryEntry>,
    fail: bool,
}

impl StaticDirectory {
    pub fn new(extensions: Vec<Extension>, entries: Vec<DirectoryEntry>) -> Self {
        let apartments = entries
            .into_iter()
            .map(|entry| (entry.apartment.clone(), entry))
            .collect();
        Self {
            extensions,
            apartments,
            fail: false,
        }
    }

    /// A directory that errors on every call, for snapshot-fallback tests.
    pub fn unavailable() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DirectoryStore for StaticDirectory {
    async fn active_extensions(&self) -> Result<Vec<Extension>> {
        if self.fail {
            return Err(EngineError::DirectoryUnavailable("store offline".into()));
        }
        Ok(self.extensions.clone())
    }

    async fn find_apartment(
        &self,
        _building_id: Option<i64>,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>> {
        if self.fail {
            return Err(EngineError::DirectoryUnavailable("store offline".into()));
        }
        Ok(self.apartments.get(apartment).cloned())
    }
}

/// Watcher fed from an mpsc channel.
pub struct ChannelWatcher {
    rx: tokio::sync::mpsc::UnboundedReceiver<DirectoryChange>,
}

impl ChannelWatcher {
    pub fn new() -> (tokio::sync::mpsc::UnboundedSender<DirectoryChange>, Self) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl DirectoryWatcher for ChannelWatcher {
    async fn next_change(&mut self) -> Result<DirectoryChange> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| EngineError::DirectoryUnavailable("watcher channel closed".into()))
    }
}
