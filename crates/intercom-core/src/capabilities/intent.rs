//! LLM-backed intent extraction
//!
//! Talks to a chat-completions style endpoint. Each extraction stage sends
//! a stage-specific system prompt plus the conversation so far and expects
//! a single JSON object back: the fields the model could fill and a
//! `reply` to speak when something is still missing.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::capabilities::{
    retry_transient, ExtractionOutcome, ExtractionStage, IntentExtractor, IntentPatch,
};
use crate::config::IntentConfig;
use crate::error::{EngineError, Result};
use crate::session::{CallRole, Turn, VisitIntent};

const INTENT_TYPE_PROMPT: &str = "You classify why a visitor is at a residential building gate. \
Reply with one JSON object: {\"intentType\": \"delivery\"|\"visit\"|\"service\"|null, \
\"reply\": string|null}. Set reply to a short clarifying question when the purpose is unclear.";

const VISITOR_NAME_PROMPT: &str = "You extract the visitor's name from the conversation. \
Reply with one JSON object: {\"visitorName\": string|null, \"reply\": string|null}. \
Set reply to a short question asking for the name when it was not given.";

const APARTMENT_RESIDENT_PROMPT: &str = "You extract the apartment number and the resident's \
name the visitor is asking for. Reply with one JSON object: {\"apartment\": string|null, \
\"residentName\": string|null, \"reply\": string|null}. Set reply to a short question asking \
for whatever is missing.";

pub struct HttpIntentExtractor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StagePayload {
    intent_type: Option<String>,
    visitor_name: Option<String>,
    apartment: Option<String>,
    resident_name: Option<String>,
    reply: Option<String>,
}

impl HttpIntentExtractor {
    pub fn new(config: &IntentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("intent client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn system_prompt(stage: ExtractionStage) -> &'static str {
        match stage {
            ExtractionStage::IntentType => INTENT_TYPE_PROMPT,
            ExtractionStage::VisitorName => VISITOR_NAME_PROMPT,
            ExtractionStage::ApartmentResident => APARTMENT_RESIDENT_PROMPT,
        }
    }

    fn render_conversation(history: &[Turn], partial: &VisitIntent) -> String {
        let mut lines = Vec::with_capacity(history.len() + 1);
        for turn in history {
            let speaker = match turn.role {
                CallRole::Visitor => "Visitor",
                CallRole::Resident => "Resident",
                CallRole::System => "System",
            };
            lines.push(format!("{speaker}: {}", turn.text));
        }
        lines.push(format!(
            "Known so far: {}",
            serde_json::to_string(partial).unwrap_or_default()
        ));
        lines.join("\n")
    }

    async fn request(
        &self,
        stage: ExtractionStage,
        history: &[Turn],
        partial: &VisitIntent,
    ) -> Result<StagePayload> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": Self::system_prompt(stage) },
                { "role": "user", "content": Self::render_conversation(history, partial) },
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("intent request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::CapabilityTransient(format!(
                "intent extractor returned {status}"
            )));
        }
        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::CapabilityTransient(format!("intent body: {e}")))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        serde_json::from_str(strip_fences(content))
            .map_err(|e| EngineError::CapabilityTransient(format!("intent payload: {e}")))
    }
}

/// Models often wrap JSON in markdown fences; tolerate that.
fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[async_trait]
impl IntentExtractor for HttpIntentExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        history: &[Turn],
        partial: &VisitIntent,
    ) -> Result<ExtractionOutcome> {
        let payload =
            retry_transient("intent", || self.request(stage, history, partial)).await?;
        debug!(?stage, "intent stage complete");
        Ok(ExtractionOutcome {
            patch: IntentPatch {
                intent_type: payload.intent_type,
                visitor_name: payload.visitor_name,
                apartment: payload.apartment,
                resident_name: payload.resident_name,
            },
            clarify: payload.reply.filter(|r| !r.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_tolerated() {
        let fenced = "```json\n{\"apartment\": \"501\", \"reply\": null}\n```";
        let payload: StagePayload = serde_json::from_str(strip_fences(fenced)).unwrap();
        assert_eq!(payload.apartment.as_deref(), Some("501"));
        assert!(payload.reply.is_none());
    }

    #[test]
    fn conversation_rendering_includes_partial_intent() {
        let history = vec![Turn {
            role: CallRole::Visitor,
            text: "Delivery for 501".to_string(),
        }];
        let mut partial = VisitIntent::default();
        partial.apartment = Some("501".to_string());
        let rendered = HttpIntentExtractor::render_conversation(&history, &partial);
        assert!(rendered.contains("Visitor: Delivery for 501"));
        assert!(rendered.contains("\"apartment\":\"501\""));
    }
}
