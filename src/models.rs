//! Core data models used throughout govkb.
//!
//! These types represent the queries, retrieval results, and evidence links
//! that flow from the backends through the audit trail to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which backend answers a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Similarity search against the vector index.
    Vector,
    /// Free-text question to the hosted document assistant.
    Assistant,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Vector => f.write_str("vector"),
            Mode::Assistant => f.write_str("assistant"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(Mode::Vector),
            "assistant" => Ok(Mode::Assistant),
            other => Err(format!(
                "Unknown mode: {}. Use vector or assistant.",
                other
            )),
        }
    }
}

/// Optional metadata restrictions for a query.
///
/// `framework` and `control_id` are exact-match metadata filters combined
/// with logical AND. `namespace` selects the index partition and is not a
/// metadata field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Filters {
    /// Metadata equality pairs implied by these filters, in a fixed order.
    pub fn metadata_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(ref fw) = self.framework {
            pairs.push(("framework", fw.as_str()));
        }
        if let Some(ref id) = self.control_id {
            pairs.push(("control_id", id.as_str()));
        }
        pairs
    }

    /// True when every metadata filter equals the match's metadata value.
    pub fn matches(&self, m: &Match) -> bool {
        self.metadata_pairs()
            .iter()
            .all(|(field, want)| m.metadata.get(*field).and_then(Value::as_str) == Some(*want))
    }
}

/// A single query as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub mode: Mode,
    #[serde(default)]
    pub filters: Filters,
}

impl Query {
    pub fn new(text: impl Into<String>, mode: Mode) -> Self {
        Self {
            text: text.into(),
            mode,
            filters: Filters::default(),
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }
}

/// One retrieved item, from either backend.
///
/// Assistant citations carry `score: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub score: Option<f64>,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Match {
    pub fn framework(&self) -> Option<&str> {
        self.metadata.get("framework").and_then(Value::as_str)
    }

    /// Control identifier, falling back to `policy_id` for policy documents.
    pub fn control_id(&self) -> Option<&str> {
        self.metadata
            .get("control_id")
            .and_then(Value::as_str)
            .or_else(|| self.metadata.get("policy_id").and_then(Value::as_str))
    }

    /// Label such as `SOC2:CC6.6`; framework defaults to `POL`.
    pub fn control_label(&self) -> String {
        let framework = self.framework().unwrap_or("POL");
        let id = self.control_id().unwrap_or("");
        format!("{}:{}", framework, id)
            .trim_end_matches(':')
            .to_string()
    }

    /// Evidence keys attached to this match's metadata, if any.
    pub fn evidence_keys(&self) -> Vec<String> {
        match self.metadata.get("evidence_keys") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Result of a vector similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorAnswer {
    pub matches: Vec<Match>,
}

/// Narrative answer from the hosted assistant, one match per citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantAnswer {
    pub narrative: String,
    pub matches: Vec<Match>,
}

/// Normalized output of either backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetrievalResult {
    Vector(VectorAnswer),
    Assistant(AssistantAnswer),
}

impl RetrievalResult {
    pub fn mode(&self) -> Mode {
        match self {
            RetrievalResult::Vector(_) => Mode::Vector,
            RetrievalResult::Assistant(_) => Mode::Assistant,
        }
    }

    pub fn matches(&self) -> &[Match] {
        match self {
            RetrievalResult::Vector(v) => &v.matches,
            RetrievalResult::Assistant(a) => &a.matches,
        }
    }

    pub fn narrative(&self) -> Option<&str> {
        match self {
            RetrievalResult::Vector(_) => None,
            RetrievalResult::Assistant(a) => Some(&a.narrative),
        }
    }
}

/// Evidence key → resolved URI.
pub type EvidenceRefs = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(meta: Value) -> Match {
        Match {
            id: "x".into(),
            score: Some(0.5),
            text: "t".into(),
            metadata: serde_json::from_value(meta).unwrap(),
        }
    }

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("vector".parse::<Mode>().unwrap(), Mode::Vector);
        assert_eq!("assistant".parse::<Mode>().unwrap(), Mode::Assistant);
        assert!("hybrid".parse::<Mode>().is_err());
        assert_eq!(Mode::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_filters_and_semantics() {
        let filters = Filters {
            framework: Some("SOC2".into()),
            control_id: Some("CC6.6".into()),
            namespace: Some("tenant-a".into()),
        };
        assert!(filters.matches(&m(json!({"framework": "SOC2", "control_id": "CC6.6"}))));
        assert!(!filters.matches(&m(json!({"framework": "SOC2", "control_id": "CC6.1"}))));
        assert!(!filters.matches(&m(json!({"control_id": "CC6.6"}))));
        assert!(Filters::default().matches(&m(json!({}))));
    }

    #[test]
    fn test_control_label_falls_back_to_policy() {
        assert_eq!(m(json!({"framework": "SOC2", "control_id": "CC6.6"})).control_label(), "SOC2:CC6.6");
        assert_eq!(m(json!({"policy_id": "POL-7"})).control_label(), "POL:POL-7");
        assert_eq!(m(json!({"framework": "ISO27001"})).control_label(), "ISO27001");
    }

    #[test]
    fn test_evidence_keys_accepts_list_or_string() {
        assert_eq!(
            m(json!({"evidence_keys": ["a.pdf", 3, "b.png"]})).evidence_keys(),
            vec!["a.pdf", "b.png"]
        );
        assert_eq!(m(json!({"evidence_keys": "c.pdf"})).evidence_keys(), vec!["c.pdf"]);
        assert!(m(json!({})).evidence_keys().is_empty());
    }

    #[test]
    fn test_retrieval_result_tagging() {
        let r = RetrievalResult::Assistant(AssistantAnswer {
            narrative: "n".into(),
            matches: vec![],
        });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["kind"], "assistant");
        assert_eq!(v["narrative"], "n");
        let back: RetrievalResult = serde_json::from_value(v).unwrap();
        assert_eq!(back.mode(), Mode::Assistant);
    }
}
