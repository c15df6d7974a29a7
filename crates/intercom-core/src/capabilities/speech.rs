//! HTTP speech providers
//!
//! Thin reqwest clients for the external STT and TTS services. Transient
//! failures (5xx, transport) are retried here; what escapes is terminal
//! and reaches the dialog as the apology path.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::capabilities::{retry_transient, Synthesizer, Transcriber, TranscribeHints};
use crate::config::SpeechConfig;
use crate::error::{EngineError, Result};

/// POST-audio-get-text transcriber.
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

impl HttpTranscriber {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("stt client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.stt_endpoint.clone(),
        })
    }

    async fn request(&self, audio: &[u8], hints: &TranscribeHints) -> Result<String> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/octet-stream")
            .query(&[("language", hints.language.as_str())])
            .body(audio.to_vec());
        if let Some(timeout) = hints.segment_timeout {
            request = request.query(&[("segmentTimeoutMs", timeout.as_millis().to_string())]);
        }
        if hints.expect_short {
            request = request.query(&[("expectShort", "true")]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("stt request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::CapabilityTransient(format!(
                "stt returned {status}"
            )));
        }
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("stt body: {e}")))?;
        Ok(body.text)
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8], hints: &TranscribeHints) -> Result<String> {
        let text = retry_transient("transcribe", || self.request(audio, hints)).await?;
        debug!(chars = text.len(), "transcription complete");
        Ok(text)
    }
}

/// POST-text-get-audio synthesizer; the response body is SLIN PCM.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("tts client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.tts_endpoint.clone(),
        })
    }

    async fn request(&self, text: &str, voice: &str) -> Result<Bytes> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text, "voice": voice }))
            .send()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("tts request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::CapabilityTransient(format!(
                "tts returned {status}"
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("tts body: {e}")))
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes> {
        let pcm = retry_transient("synthesize", || self.request(text, voice)).await?;
        debug!(bytes = pcm.len(), "synthesis complete");
        Ok(pcm)
    }
}
