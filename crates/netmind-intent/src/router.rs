//! Two-stage intent router.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use netmind_core::settings::ConfigStore;
use netmind_core::types::{Entities, IntentKind};
use netmind_plugin::PluginRegistry;

use crate::classifier::Classifier;
use crate::entities;
use crate::rules;

/// Confidence below which stage two is consulted.
const CLASSIFIER_GATE: f64 = 0.8;
/// Confidence attached to the chat fallback when nothing matched.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Routed utterance: intent, confidence and extracted entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: IntentKind,
    pub confidence: f64,
    pub entities: Entities,
    pub raw_text: String,
}

/// Rule table first; LLM classifier second when enabled and stage one is
/// unsure. Deterministic for a fixed configuration snapshot: the rule
/// path is pure, and the classifier is only reachable when the
/// `llm.use_classifier` flag turns it on.
pub struct IntentRouter {
    config: Arc<ConfigStore>,
    registry: Arc<PluginRegistry>,
    classifier: Option<Classifier>,
}

impl IntentRouter {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<PluginRegistry>,
        classifier: Option<Classifier>,
    ) -> Self {
        Self {
            config,
            registry,
            classifier,
        }
    }

    pub async fn route(&self, text: &str) -> Classification {
        let extracted = entities::extract(text);
        let lower = text.to_lowercase();

        let stage_one = rules::first_match(&lower, &extracted);
        if let Some(rule) = stage_one {
            debug!(intent = %rule.intent, confidence = rule.confidence, "rule hit");
        }

        let confident = stage_one.is_some_and(|r| r.confidence >= CLASSIFIER_GATE);
        if !confident && self.classifier_enabled() {
            if let Some(classifier) = &self.classifier {
                let hints = self.registry.keyword_hints();
                if let Some(verdict) = classifier.classify(text, &hints).await {
                    // Concrete extracted entities win over the model's.
                    let mut merged = extracted.clone();
                    merged.merge_missing(verdict.entities);
                    return Classification {
                        intent: verdict.intent,
                        confidence: verdict.confidence,
                        entities: merged,
                        raw_text: text.to_string(),
                    };
                }
            }
        }

        match stage_one {
            Some(rule) => Classification {
                intent: rule.intent,
                confidence: rule.confidence,
                entities: extracted,
                raw_text: text.to_string(),
            },
            None => Classification {
                intent: IntentKind::ChatFallback,
                confidence: FALLBACK_CONFIDENCE,
                entities: extracted,
                raw_text: text.to_string(),
            },
        }
    }

    fn classifier_enabled(&self) -> bool {
        self.classifier.is_some()
            && self
                .config
                .get_bool("llm.use_classifier")
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use netmind_plugin::{CompletionRequest, CompletionResponse, LlmClient, LlmError};

    use super::*;

    fn router() -> IntentRouter {
        IntentRouter::new(
            Arc::new(ConfigStore::in_memory(None)),
            Arc::new(PluginRegistry::new()),
            None,
        )
    }

    #[tokio::test]
    async fn ping_flow_classification() {
        let r = router();
        let c = r.route("ping 192.168.1.1").await;
        assert_eq!(c.intent, IntentKind::NetworkPing);
        assert_eq!(c.entities.ip.as_deref(), Some("192.168.1.1"));
        assert!(c.confidence >= 0.9);
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let r = router();
        for text in ["skanuj sieć", "ping 10.0.0.1", "co słychać", "? pogoda"] {
            let a = r.route(text).await;
            let b = r.route(text).await;
            assert_eq!(a.intent, b.intent, "{text}");
            assert_eq!(a.confidence, b.confidence, "{text}");
            assert_eq!(a.entities, b.entities, "{text}");
        }
    }

    #[tokio::test]
    async fn unmatched_falls_back_to_chat() {
        let r = router();
        let c = r.route("dzień dobry").await;
        assert_eq!(c.intent, IntentKind::ChatFallback);
    }

    struct CannedLlm;

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
                content: r#"{"intent": "camera:describe", "confidence": 0.9, "entities": {}}"#
                    .into(),
                model: "canned".into(),
            })
        }
    }

    #[tokio::test]
    async fn classifier_consulted_only_when_enabled() {
        let config = Arc::new(ConfigStore::in_memory(None));
        let registry = Arc::new(PluginRegistry::new());
        let r = IntentRouter::new(
            Arc::clone(&config),
            registry,
            Some(Classifier::new(Arc::new(CannedLlm))),
        );

        // flag off: low-confidence rule result stands
        let c = r.route("dzień dobry").await;
        assert_eq!(c.intent, IntentKind::ChatFallback);

        // flag on: the classifier refines the weak result
        config.set("llm.use_classifier", true).unwrap();
        let c = r.route("dzień dobry").await;
        assert_eq!(c.intent, IntentKind::CameraDescribe);
        assert!((c.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn confident_rule_skips_classifier() {
        let config = Arc::new(ConfigStore::in_memory(None));
        config.set("llm.use_classifier", true).unwrap();
        let r = IntentRouter::new(
            config,
            Arc::new(PluginRegistry::new()),
            Some(Classifier::new(Arc::new(CannedLlm))),
        );
        let c = r.route("skanuj sieć").await;
        assert_eq!(c.intent, IntentKind::NetworkScan);
    }
}
