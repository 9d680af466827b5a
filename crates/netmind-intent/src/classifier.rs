//! Stage-two intent classification through the configured LLM.
//!
//! Consulted only when the rule table is unsure (confidence < 0.8 or no
//! match) and the `llm.use_classifier` flag is on. A hard 2 s timeout
//! keeps the turn responsive; any error falls back to the stage-one
//! result.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use netmind_core::types::{Entities, IntentKind};
use netmind_plugin::{CompletionRequest, LlmClient};

pub const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(2);

/// What the classifier returned for one utterance.
#[derive(Debug, Clone)]
pub struct ClassifierVerdict {
    pub intent: IntentKind,
    pub confidence: f64,
    pub entities: Entities,
}

#[derive(Deserialize)]
struct RawVerdict {
    intent: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    entities: Entities,
}

pub struct Classifier {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            timeout: CLASSIFIER_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Classify an utterance. `hints` pairs plugin ids with their declared
    /// keyword hints. Returns `None` on timeout, transport error, or an
    /// unparseable verdict — the caller falls back to stage one.
    pub async fn classify(
        &self,
        text: &str,
        hints: &[(String, Vec<String>)],
    ) -> Option<ClassifierVerdict> {
        let request = CompletionRequest::new(build_system_prompt(hints), text.to_string());

        let response =
            match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    warn!("classifier request failed: {e}");
                    return None;
                }
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "classifier timed out");
                    return None;
                }
            };

        parse_verdict(&response.content)
    }
}

fn build_system_prompt(hints: &[(String, Vec<String>)]) -> String {
    let mut prompt = String::from(
        "You classify a user utterance for a network-operations assistant.\n\
         Answer with ONLY a JSON object: {\"intent\": \"<tag>\", \"confidence\": 0.0-1.0, \
         \"entities\": {\"ip\": null, \"url\": null, \"port\": null, \"text\": null}}.\n\
         Valid intent tags:\n",
    );
    for kind in IntentKind::ALL {
        prompt.push_str("- ");
        prompt.push_str(kind.as_str());
        prompt.push('\n');
    }
    if !hints.is_empty() {
        prompt.push_str("\nPlugin keyword hints:\n");
        for (plugin, words) in hints {
            if !words.is_empty() {
                prompt.push_str(&format!("- {}: {}\n", plugin, words.join(", ")));
            }
        }
    }
    prompt.push_str("\nUtterances may be Polish or English.");
    prompt
}

/// Parse the model's JSON answer, tolerating a fenced code block.
fn parse_verdict(content: &str) -> Option<ClassifierVerdict> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let raw: RawVerdict = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            warn!("classifier verdict unparseable: {e}");
            return None;
        }
    };

    let intent: IntentKind = match raw.intent.parse() {
        Ok(k) => k,
        Err(_) => {
            warn!(tag = %raw.intent, "classifier produced unknown intent tag");
            return None;
        }
    };

    debug!(intent = %intent, confidence = raw.confidence, "classifier verdict");
    Some(ClassifierVerdict {
        intent,
        confidence: raw.confidence.clamp(0.0, 1.0),
        entities: raw.entities,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use netmind_plugin::{CompletionResponse, LlmError};

    use super::*;

    struct CannedLlm(String);

    #[async_trait]
    impl LlmClient for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                model: "canned".into(),
            })
        }
    }

    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        fn name(&self) -> &str {
            "slow"
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(LlmError::Unavailable("never".into()))
        }
    }

    #[tokio::test]
    async fn parses_well_formed_verdict() {
        let classifier = Classifier::new(Arc::new(CannedLlm(
            r#"{"intent": "network:ping", "confidence": 0.92, "entities": {"ip": "10.0.0.1"}}"#
                .to_string(),
        )));
        let verdict = classifier.classify("czy 10.0.0.1 żyje", &[]).await.unwrap();
        assert_eq!(verdict.intent, IntentKind::NetworkPing);
        assert_eq!(verdict.entities.ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let classifier = Classifier::new(Arc::new(CannedLlm(
            r#"{"intent": "network:warp", "confidence": 0.9}"#.to_string(),
        )));
        assert!(classifier.classify("x", &[]).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back() {
        let classifier = Classifier::with_timeout(Arc::new(SlowLlm), Duration::from_millis(50));
        assert!(classifier.classify("x", &[]).await.is_none());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let verdict = parse_verdict("```json\n{\"intent\": \"browse:url\"}\n```").unwrap();
        assert_eq!(verdict.intent, IntentKind::BrowseUrl);
    }
}
