//! Grounded answer text for display.
//!
//! Vector mode has no generator behind it, so the answer is the retrieved
//! controls themselves, listed with their framework labels, plus a
//! confidence equal to the mean similarity score. Assistant mode already has
//! a narrative and passes it through.

use serde::{Deserialize, Serialize};

use crate::models::{Match, RetrievalResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Mean similarity, rounded to 3 places. `None` for assistant answers.
    pub confidence: Option<f64>,
}

fn label(m: &Match) -> (String, String) {
    (
        m.framework().unwrap_or("POL").to_string(),
        m.control_id().unwrap_or("").to_string(),
    )
}

pub fn synthesize(query: &str, result: &RetrievalResult) -> Answer {
    match result {
        RetrievalResult::Assistant(a) => Answer {
            text: a.narrative.clone(),
            confidence: None,
        },
        RetrievalResult::Vector(v) => {
            let contexts = v
                .matches
                .iter()
                .map(|m| {
                    let (fw, id) = label(m);
                    format!("- [{}] {}: {}", fw, id, m.text)
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let citations = v
                .matches
                .iter()
                .map(|m| {
                    let (fw, id) = label(m);
                    format!("{}:{}", fw, id)
                })
                .collect::<Vec<_>>()
                .join(", ");

            let text = format!(
                "**Grounded Answer:**\nGiven your question \"{}\", here are relevant controls/policies:\n\n{}\n\nCitations: {}",
                query, contexts, citations
            );
            Answer {
                text,
                confidence: Some(mean_confidence(&v.matches)),
            }
        }
    }
}

/// Mean of the scored matches, rounded to 3 decimals; `0.0` when empty.
pub fn mean_confidence(matches: &[Match]) -> f64 {
    let scores: Vec<f64> = matches.iter().filter_map(|m| m.score).collect();
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    (mean * 1000.0).round() / 1000.0
}
