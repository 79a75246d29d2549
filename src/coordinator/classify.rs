//! Request classification: mapping a task to a target capability
//!
//! Strategies in priority order: an explicit target in the request bypasses
//! classification entirely (handled by the coordinator), then keyword rules,
//! then embedding similarity when a backend is plugged in, then the kind's
//! default capability. Confidence is recorded with every decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::KeywordRule;
use crate::domain_types::CapabilityName;

use super::TaskRequest;

/// How a classification was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Keyword rule hit
    Keyword,
    /// Embedding similarity backend
    Similarity,
    /// Fell back to the kind's default capability
    KindDefault,
}

/// A capability decision with its confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Chosen capability
    pub capability: CapabilityName,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Strategy that produced the decision
    pub strategy: Strategy,
}

/// Optional embedding-similarity backend
///
/// The default build ships none; deployments plug one in when keyword rules
/// are not enough.
#[async_trait]
pub trait SimilarityClassifier: Send + Sync {
    /// Classifies the request, or declines
    async fn classify(&self, request: &TaskRequest) -> Option<Classification>;
}

/// Rule-driven classifier with an optional similarity fallback
pub struct Classifier {
    rules: Vec<(CapabilityName, Vec<String>)>,
    similarity: Option<Arc<dyn SimilarityClassifier>>,
}

impl Classifier {
    /// Builds a classifier from configured keyword rules
    #[must_use]
    pub fn new(rules: &[KeywordRule], similarity: Option<Arc<dyn SimilarityClassifier>>) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| {
                let capability = CapabilityName::try_new(rule.capability.clone()).ok()?;
                let keywords = rule
                    .keywords
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect::<Vec<_>>();
                Some((capability, keywords))
            })
            .collect();
        Self { rules, similarity }
    }

    /// Classifies a request into a capability
    pub async fn classify(&self, request: &TaskRequest) -> Classification {
        let haystack = payload_text(&request.payload).to_lowercase();

        if !haystack.is_empty() {
            for (capability, keywords) in &self.rules {
                if keywords.iter().any(|k| haystack.contains(k.as_str())) {
                    return Classification {
                        capability: capability.clone(),
                        confidence: 0.9,
                        strategy: Strategy::Keyword,
                    };
                }
            }
        }

        if let Some(similarity) = &self.similarity {
            if let Some(classification) = similarity.classify(request).await {
                return classification;
            }
        }

        Classification {
            capability: request.kind.default_capability(),
            confidence: 0.5,
            strategy: Strategy::KindDefault,
        }
    }
}

/// Pulls classifiable text out of an opaque payload
fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["text", "prompt", "query", "input"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::RequestKind;
    use serde_json::json;

    fn request(kind: RequestKind, payload: Value) -> TaskRequest {
        TaskRequest {
            id: None,
            kind,
            payload,
            priority: None,
            deadline_ms: None,
            trace_id: None,
            target_agent: None,
            backend: None,
            complexity_hint: None,
            source: None,
            affinity: None,
        }
    }

    fn rules() -> Vec<KeywordRule> {
        vec![
            KeywordRule {
                capability: "vision".to_string(),
                keywords: vec!["image".to_string(), "camera".to_string()],
            },
            KeywordRule {
                capability: "tts".to_string(),
                keywords: vec!["speak".to_string()],
            },
        ]
    }

    #[tokio::test]
    async fn keyword_rule_wins() {
        let classifier = Classifier::new(&rules(), None);
        let request = request(RequestKind::Chat, json!({"text": "describe this IMAGE"}));
        let classification = classifier.classify(&request).await;
        assert_eq!(classification.capability.as_str(), "vision");
        assert_eq!(classification.strategy, Strategy::Keyword);
        assert!(classification.confidence > 0.8);
    }

    #[tokio::test]
    async fn falls_back_to_kind_default() {
        let classifier = Classifier::new(&rules(), None);
        let request = request(RequestKind::Stt, json!({"audio_ref": "clip-1"}));
        let classification = classifier.classify(&request).await;
        assert_eq!(classification.capability.as_str(), "stt");
        assert_eq!(classification.strategy, Strategy::KindDefault);
    }

    #[tokio::test]
    async fn similarity_backend_is_consulted_between_rules_and_default() {
        struct Fixed;
        #[async_trait]
        impl SimilarityClassifier for Fixed {
            async fn classify(&self, _request: &TaskRequest) -> Option<Classification> {
                Some(Classification {
                    capability: CapabilityName::try_new("vision".to_string()).unwrap(),
                    confidence: 0.7,
                    strategy: Strategy::Similarity,
                })
            }
        }
        let classifier = Classifier::new(&rules(), Some(Arc::new(Fixed)));
        let request = request(RequestKind::Chat, json!({"text": "no keywords here"}));
        let classification = classifier.classify(&request).await;
        assert_eq!(classification.strategy, Strategy::Similarity);
    }

    #[tokio::test]
    async fn plain_string_payload_is_searched() {
        let classifier = Classifier::new(&rules(), None);
        let request = request(RequestKind::Chat, json!("please speak this aloud"));
        let classification = classifier.classify(&request).await;
        assert_eq!(classification.capability.as_str(), "tts");
    }
}
