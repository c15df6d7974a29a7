//! Dialog phrasing and reply classification
//!
//! Token lists come from configuration; the exact affirmative/negative
//! vocabularies are deployment-specific, not hard-coded.

use crate::capabilities::ExtractionStage;
use crate::config::{AppConfig, GoodbyeMessages};
use crate::session::VisitIntent;

/// Classification of a resident reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidentReply {
    /// The resident wants more context before deciding.
    Inquiry,
    Affirmative,
    Negative,
    Ambiguous,
}

/// Message texts and token lists driving the state machine.
#[derive(Debug, Clone)]
pub struct DialogPolicy {
    pub wait_message: String,
    pub unreachable_message: String,
    pub apology_message: String,
    pub no_response_message: String,
    pub goodbye: GoodbyeMessages,
    affirmative_tokens: Vec<String>,
    negative_tokens: Vec<String>,
    inquiry_tokens: Vec<String>,
}

impl DialogPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        let lower = |tokens: &[String]| tokens.iter().map(|t| t.to_lowercase()).collect();
        Self {
            wait_message: config.dialog.wait_message.clone(),
            unreachable_message: config.dialog.unreachable_message.clone(),
            apology_message: config.dialog.apology_message.clone(),
            no_response_message: config.dialog.no_response_message.clone(),
            goodbye: config.call_termination.goodbye_messages.clone(),
            affirmative_tokens: lower(&config.dialog.affirmative_tokens),
            negative_tokens: lower(&config.dialog.negative_tokens),
            inquiry_tokens: lower(&config.dialog.inquiry_tokens),
        }
    }

    /// Classify a resident reply against the configured token lists.
    /// Inquiries are checked first so "who is it?" never reads as a
    /// decision; affirmatives win over negatives when both somehow occur.
    pub fn classify(&self, text: &str) -> ResidentReply {
        let text = text.to_lowercase();
        if text.contains('?') || self.any_token(&text, &self.inquiry_tokens) {
            return ResidentReply::Inquiry;
        }
        if self.any_token(&text, &self.affirmative_tokens) {
            return ResidentReply::Affirmative;
        }
        if self.any_token(&text, &self.negative_tokens) {
            return ResidentReply::Negative;
        }
        ResidentReply::Ambiguous
    }

    /// Word-boundary match for single words, substring for phrases.
    fn any_token(&self, text: &str, tokens: &[String]) -> bool {
        tokens.iter().any(|token| {
            if token.contains(' ') {
                text.contains(token.as_str())
            } else {
                text.split(|c: char| !c.is_alphanumeric())
                    .any(|word| word == token)
            }
        })
    }

    /// Context prompt spoken to the resident once their leg is up.
    pub fn context_prompt(&self, intent: &VisitIntent) -> String {
        format!(
            "Resident of apartment {}: {} is at the gate requesting {}. \
             Do you authorize entry? Please say yes or no.",
            intent.apartment.as_deref().unwrap_or("unknown"),
            intent.visitor_name.as_deref().unwrap_or("a visitor"),
            intent.intent_type.as_deref().unwrap_or("entry"),
        )
    }

    /// Additional detail for an inquiring resident.
    pub fn context_detail(&self, intent: &VisitIntent) -> String {
        format!(
            "{} is asking for {} at apartment {} regarding {}. \
             Say yes to authorize entry or no to deny.",
            intent.visitor_name.as_deref().unwrap_or("The visitor"),
            intent.resident_name.as_deref().unwrap_or("you"),
            intent.apartment.as_deref().unwrap_or("unknown"),
            intent.intent_type.as_deref().unwrap_or("a visit"),
        )
    }

    pub fn reask(&self) -> String {
        "I did not understand. Do you authorize entry? Please say yes or no.".to_string()
    }

    pub fn apartment_not_found(&self, apartment: &str) -> String {
        format!(
            "I could not find apartment {apartment} in this building. \
             Could you repeat the apartment number?"
        )
    }

    pub fn resident_not_matched(&self, apartment: &str) -> String {
        format!(
            "The name you gave did not match a resident of apartment {apartment}. \
             Could you repeat the resident's name?"
        )
    }

    /// Fallback question when an extraction stage returns no clarifying
    /// utterance of its own.
    pub fn stage_question(&self, stage: ExtractionStage) -> &'static str {
        match stage {
            ExtractionStage::IntentType => "How can I help you today?",
            ExtractionStage::VisitorName => "May I have your name, please?",
            ExtractionStage::ApartmentResident => {
                "Which apartment and resident are you looking for?"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DialogPolicy {
        DialogPolicy::from_config(&AppConfig::default())
    }

    #[test]
    fn classification_covers_the_four_classes() {
        let p = policy();
        assert_eq!(p.classify("Who is it?"), ResidentReply::Inquiry);
        assert_eq!(p.classify("quem é"), ResidentReply::Inquiry);
        assert_eq!(p.classify("Yes, let him in."), ResidentReply::Affirmative);
        assert_eq!(p.classify("Sim, pode entrar"), ResidentReply::Affirmative);
        assert_eq!(p.classify("No."), ResidentReply::Negative);
        assert_eq!(p.classify("Não"), ResidentReply::Negative);
        assert_eq!(p.classify("hmm maybe later"), ResidentReply::Ambiguous);
    }

    #[test]
    fn word_boundaries_prevent_substring_hits() {
        let p = policy();
        // "no" inside "nobody" must not read as a denial.
        assert_eq!(p.classify("nobody told me"), ResidentReply::Ambiguous);
        // "sim" inside "simultaneous" must not read as consent.
        assert_eq!(p.classify("simultaneous noise"), ResidentReply::Ambiguous);
    }

    #[test]
    fn context_prompt_names_the_parties() {
        let p = policy();
        let intent = VisitIntent {
            intent_type: Some("delivery".to_string()),
            visitor_name: Some("Pedro".to_string()),
            apartment: Some("501".to_string()),
            resident_name: Some("Daniel".to_string()),
            resident_voip_number: None,
            authorization: None,
        };
        let prompt = p.context_prompt(&intent);
        assert!(prompt.contains("501"));
        assert!(prompt.contains("Pedro"));
        assert!(prompt.contains("delivery"));
    }
}
