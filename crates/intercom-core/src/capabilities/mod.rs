//! External capability interfaces
//!
//! The speech, intent, bus and directory collaborators are expressed as
//! object-safe async traits so the engine never depends on a concrete
//! transport. Default providers live in the submodules: HTTP for STT, TTS
//! and intent extraction, NATS for the click-to-call bus, Postgres (with
//! LISTEN/NOTIFY) for the extension directory. `stubs` holds in-memory
//! implementations used by the integration tests.

pub mod bus;
pub mod directory;
pub mod intent;
pub mod speech;
pub mod stubs;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::session::{Turn, VisitIntent};

/// One configured intercom extension: a pair of listener ports plus the
/// PBX numbers behind them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: i64,
    pub ia_number: String,
    pub return_number: String,
    pub bind_ip: String,
    pub ia_port: u16,
    pub return_port: u16,
    pub building_id: Option<i64>,
}

/// One apartment row of the resident directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub apartment: String,
    pub residents: Vec<String>,
    pub voip_number: String,
}

/// Directory change kinds delivered by the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// One change notification, carrying the affected row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryChange {
    pub action: ChangeAction,
    pub data: Extension,
}

/// Per-request transcription hints. The resident leg uses a shorter
/// segment timeout because single-word replies are expected there.
#[derive(Debug, Clone)]
pub struct TranscribeHints {
    pub language: String,
    pub segment_timeout: Option<Duration>,
    pub expect_short: bool,
}

/// The three extraction stages of the data-collection dialog. A stage runs
/// only while its fields are still empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStage {
    IntentType,
    VisitorName,
    ApartmentResident,
}

/// Fields an extraction stage managed to fill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntentPatch {
    pub intent_type: Option<String>,
    pub visitor_name: Option<String>,
    pub apartment: Option<String>,
    pub resident_name: Option<String>,
}

/// Result of one extraction stage: a partial intent plus an optional
/// clarifying utterance for the visitor.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub patch: IntentPatch,
    pub clarify: Option<String>,
}

/// Click-to-call request published on the bus. The guid is the session's
/// call id verbatim; the returned resident leg is correlated through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickToCallRequest {
    pub guid: String,
    pub origin: String,
    pub license: String,
}

impl ClickToCallRequest {
    /// Bus payload in the agreed wire shape.
    pub fn payload(&self, timestamp: chrono::DateTime<chrono::Utc>) -> serde_json::Value {
        serde_json::json!({
            "data": {
                "destiny": "IA",
                "guid": self.guid,
                "license": self.license,
                "origin": self.origin,
            },
            "timestamp": timestamp.to_rfc3339(),
        })
    }
}

/// Speech-to-text provider.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], hints: &TranscribeHints) -> Result<String>;
}

/// Text-to-speech provider; output is SLIN PCM.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes>;
}

/// LLM-backed intent extraction.
#[async_trait]
pub trait IntentExtractor: Send + Sync {
    async fn extract(
        &self,
        stage: ExtractionStage,
        history: &[Turn],
        partial: &VisitIntent,
    ) -> Result<ExtractionOutcome>;
}

/// Outbound-call-request bus.
#[async_trait]
pub trait ClickToCallPublisher: Send + Sync {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<()>;
}

/// Extension directory queries.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn active_extensions(&self) -> Result<Vec<Extension>>;

    async fn find_apartment(
        &self,
        building_id: Option<i64>,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>>;
}

/// Directory change-notification stream.
#[async_trait]
pub trait DirectoryWatcher: Send {
    async fn next_change(&mut self) -> Result<DirectoryChange>;
}

/// Retry policy shared by the capability providers: two retries with
/// exponential backoff, then the error surfaces as terminal.
pub(crate) async fn retry_transient<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const MAX_RETRIES: u32 = 2;
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(%operation, %error, attempt, "capability call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_to_call_payload_shape() {
        let request = ClickToCallRequest {
            guid: "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa".to_string(),
            origin: "1003021".to_string(),
            license: "lic-1".to_string(),
        };
        let timestamp = chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let payload = request.payload(timestamp);
        assert_eq!(payload["data"]["destiny"], "IA");
        assert_eq!(payload["data"]["guid"], "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa");
        assert_eq!(payload["data"]["origin"], "1003021");
        assert_eq!(payload["data"]["license"], "lic-1");
        assert!(payload["timestamp"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
    }

    #[test]
    fn change_payload_round_trips() {
        let raw = r#"{
            "action": "INSERT",
            "data": {
                "id": 7,
                "iaNumber": "9000",
                "returnNumber": "9001",
                "bindIp": "0.0.0.0",
                "iaPort": 9000,
                "returnPort": 9001,
                "buildingId": 3
            }
        }"#;
        let change: DirectoryChange = serde_json::from_str(raw).unwrap();
        assert_eq!(change.action, ChangeAction::Insert);
        assert_eq!(change.data.ia_port, 9000);
        assert_eq!(change.data.building_id, Some(3));
    }

    #[tokio::test]
    async fn retry_gives_up_after_two_retries() {
        let mut calls = 0u32;
        let result: Result<()> = retry_transient("test", || {
            calls += 1;
            async move { Err(crate::error::EngineError::CapabilityTransient("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
