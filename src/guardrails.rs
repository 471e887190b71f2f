//! Query guardrails: PII redaction and prompt-injection detection.
//!
//! Runs before a query leaves the process. Patterns and deny phrases come
//! from the `[guardrails]` config section:
//!
//! ```toml
//! [guardrails]
//! deny_if_contains = ["ignore previous instructions", "system prompt"]
//! pii_patterns = [
//!   { name = "EMAIL", regex = '[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}' },
//!   { name = "SSN", regex = '\b\d{3}-\d{2}-\d{4}\b' },
//! ]
//! ```
//!
//! Injection hits are reported, not enforced.

use anyhow::{Context, Result};
use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::config::GuardrailsConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiFinding {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "match")]
    pub matched: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionVerdict {
    pub is_injection: bool,
    pub triggers: Vec<String>,
}

/// Outcome of sanitizing one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailReport {
    pub redacted: String,
    pub pii: Vec<PiiFinding>,
    pub injection: InjectionVerdict,
}

/// Compiled guardrail rules.
pub struct Guardrails {
    pii: Vec<(String, Regex)>,
    deny_terms: Vec<String>,
}

impl Guardrails {
    pub fn from_config(config: &GuardrailsConfig) -> Result<Self> {
        let mut pii = Vec::with_capacity(config.pii_patterns.len());
        for p in &config.pii_patterns {
            let rx = RegexBuilder::new(&p.regex)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid PII pattern '{}'", p.name))?;
            pii.push((p.name.clone(), rx));
        }
        Ok(Self {
            pii,
            deny_terms: config
                .deny_if_contains
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
        })
    }

    /// Replace every PII match with `[REDACTED:<name>]`, in pattern order.
    pub fn redact(&self, text: &str) -> (String, Vec<PiiFinding>) {
        let mut masked = text.to_string();
        let mut findings = Vec::new();
        for (name, rx) in &self.pii {
            for m in rx.find_iter(&masked) {
                findings.push(PiiFinding {
                    kind: name.clone(),
                    matched: m.as_str().to_string(),
                });
            }
            let replacement = format!("[REDACTED:{}]", name);
            masked = rx
                .replace_all(&masked, NoExpand(&replacement))
                .into_owned();
        }
        (masked, findings)
    }

    pub fn detect_injection(&self, text: &str) -> InjectionVerdict {
        let lower = text.to_lowercase();
        let triggers: Vec<String> = self
            .deny_terms
            .iter()
            .filter(|t| lower.contains(t.as_str()))
            .cloned()
            .collect();
        InjectionVerdict {
            is_injection: !triggers.is_empty(),
            triggers,
        }
    }

    /// Redact, then check the redacted text for injection phrases.
    pub fn sanitize(&self, query: &str) -> GuardrailReport {
        let (redacted, pii) = self.redact(query);
        let injection = self.detect_injection(&redacted);
        if injection.is_injection {
            tracing::warn!(triggers = ?injection.triggers, "potential prompt injection");
        }
        if !pii.is_empty() {
            tracing::info!(findings = pii.len(), "PII redacted from query");
        }
        GuardrailReport {
            redacted,
            pii,
            injection,
        }
    }
}
