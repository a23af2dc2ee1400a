use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

/// A classification verdict for one captured still.
///
/// Field names mirror the classifier service's JSON contract; the tips and
/// facts fields are advisory and may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "Item")]
    pub item: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Recyclable tips", default)]
    pub recyclable_tips: Option<String>,
    #[serde(rename = "Bio degradable facts", default)]
    pub biodegradable_facts: Option<String>,
}

/// External classification collaborator: hand it a JPEG, get a verdict.
pub trait Classifier: Send {
    fn classify(&self, jpeg: &[u8]) -> Result<Classification, ClassifierError>;
}

/// Remove Markdown code fencing a model-backed service may wrap around its
/// JSON body.
fn strip_code_fence(body: &str) -> String {
    body.replace("```json", "").replace("```", "").trim().to_string()
}

/// Parse a classification payload, tolerating code fences around the JSON.
pub fn parse_classification(body: &str) -> Result<Classification, ClassifierError> {
    let cleaned = strip_code_fence(body);
    serde_json::from_str(&cleaned).map_err(|e| ClassifierError::MalformedPayload {
        details: format!("{e}; payload: {cleaned:?}"),
    })
}

/// HTTP classifier client posting stills to a remote service.
pub struct HttpClassifier {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, jpeg: &[u8]) -> Result<Classification, ClassifierError> {
        debug!(endpoint = %self.endpoint, bytes = jpeg.len(), "submitting still for classification");

        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "image/jpeg");
        if !self.api_key.is_empty() {
            request = request.set("Authorization", &format!("Bearer {}", self.api_key));
        }

        let response = request.send_bytes(jpeg).map_err(|e| ClassifierError::Request {
            details: e.to_string(),
        })?;
        let body = response.into_string().map_err(|e| ClassifierError::Request {
            details: format!("failed to read response body: {e}"),
        })?;

        let classification = parse_classification(&body)?;
        info!(item = %classification.item, category = %classification.category, "still classified");
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let body = r#"{"Item": "Banana Peel", "Category": "Bio Degradable and Non Recyclable",
                       "Bio degradable facts": "Composts in weeks"}"#;
        let c = parse_classification(body).unwrap();
        assert_eq!(c.item, "Banana Peel");
        assert_eq!(c.category, "Bio Degradable and Non Recyclable");
        assert_eq!(c.biodegradable_facts.as_deref(), Some("Composts in weeks"));
        assert_eq!(c.recyclable_tips, None);
    }

    #[test]
    fn strips_code_fences() {
        let body = "```json\n{\"Item\": \"Soda Can\", \"Category\": \"Non Bio Degradable and Recyclable\"}\n```";
        let c = parse_classification(body).unwrap();
        assert_eq!(c.item, "Soda Can");
        assert_eq!(c.category, "Non Bio Degradable and Recyclable");
    }

    #[test]
    fn fence_without_language_tag_is_also_stripped() {
        let body = "```\n{\"Item\": \"Jar\", \"Category\": \"Non Bio Degradable and Non Recyclable\"}\n```";
        assert_eq!(parse_classification(body).unwrap().item, "Jar");
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_default() {
        let err = parse_classification("I could not identify the item.").unwrap_err();
        assert!(matches!(err, ClassifierError::MalformedPayload { .. }));

        // Missing required fields fail the same way.
        let err = parse_classification(r#"{"Item": "Mystery"}"#).unwrap_err();
        assert!(matches!(err, ClassifierError::MalformedPayload { .. }));
    }
}
