//! Audit record construction and verification.
//!
//! Every answered query produces one [`AuditRecord`]. Its `hash` commits to
//! every other field, and when chaining is on, to the previous record's
//! hash as well, so rewriting any past record breaks every hash after it.
//!
//! # Canonical form
//!
//! The hashed content is the record serialized to JSON without its `hash`
//! field, with object keys sorted (byte order) at every depth and no
//! whitespace. Field order in memory or on disk is irrelevant.
//!
//! ```text
//! hash = hex(SHA-256(prevHash || canonical_json(record - hash)))
//! ```
//!
//! `prevHash` is the empty string when chaining is off. The first record of
//! a chain links to [`GENESIS`].
//!
//! Building a record is pure: the caller supplies the timestamp and the
//! previous hash, and nothing is written anywhere.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;

use crate::answer::Answer;
use crate::guardrails::{GuardrailReport, InjectionVerdict};
use crate::models::{EvidenceRefs, Filters, Mode, Query, RetrievalResult};

/// `prevHash` of the first record in a chain.
pub const GENESIS: &str = "GENESIS";

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Query text after redaction. The raw text is never logged.
    pub query: String,
    pub mode: Mode,
    #[serde(default)]
    pub filters: Filters,
    pub results: RetrievalResult,
    #[serde(default)]
    pub evidence: EvidenceRefs,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub guardrails: GuardrailSummary,
    #[serde(default)]
    pub model: String,
    /// RFC 3339 UTC, millisecond precision.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// What the guardrails did to the query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailSummary {
    /// Kinds of PII that were redacted (never the values).
    pub pii: Vec<String>,
    pub injection: InjectionVerdict,
}

/// Record content before the timestamp and hashes are fixed.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub query: Query,
    pub result: RetrievalResult,
    pub evidence: EvidenceRefs,
    pub answer: String,
    pub confidence: Option<f64>,
    pub guardrails: GuardrailSummary,
    pub model: String,
}

impl RecordDraft {
    pub fn new(query: Query, result: RetrievalResult, evidence: EvidenceRefs) -> Self {
        Self {
            query,
            result,
            evidence,
            answer: String::new(),
            confidence: None,
            guardrails: GuardrailSummary::default(),
            model: String::new(),
        }
    }

    pub fn with_answer(mut self, answer: &Answer) -> Self {
        self.answer = answer.text.clone();
        self.confidence = answer.confidence;
        self
    }

    pub fn with_guardrails(mut self, report: &GuardrailReport) -> Self {
        let kinds: BTreeSet<&str> = report.pii.iter().map(|f| f.kind.as_str()).collect();
        self.guardrails = GuardrailSummary {
            pii: kinds.into_iter().map(str::to_string).collect(),
            injection: report.injection.clone(),
        };
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Assemble and hash a record.
///
/// `prev_hash` is `Some` when chaining: the first record of a chain passes
/// [`GENESIS`].
pub fn build(
    draft: RecordDraft,
    prev_hash: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<AuditRecord> {
    let mut record = AuditRecord {
        query: draft.query.text,
        mode: draft.query.mode,
        filters: draft.query.filters,
        results: draft.result,
        evidence: draft.evidence,
        answer: draft.answer,
        confidence: draft.confidence,
        guardrails: draft.guardrails,
        model: draft.model,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        prev_hash: prev_hash.map(str::to_string),
        hash: String::new(),
    };
    let value = serde_json::to_value(&record).context("Failed to serialize audit record")?;
    record.hash = recompute_hash(&value)?;
    Ok(record)
}

/// Hash of `body` (a record without `hash`) chained onto `prev_hash`.
pub fn content_hash(body: &Value, prev_hash: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(canonical_json(body).as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the hash a stored record should carry, from its raw JSON.
///
/// Works on the parsed line rather than [`AuditRecord`] so that fields
/// added to a line after the fact are still covered.
pub fn recompute_hash(record: &Value) -> Result<String> {
    let Some(obj) = record.as_object() else {
        bail!("audit record is not a JSON object");
    };
    let mut body = obj.clone();
    body.remove("hash");
    let prev = match body.get("prevHash") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => bail!("prevHash must be a string"),
    };
    Ok(content_hash(&Value::Object(body), prev.as_deref()))
}

/// Sorted-key, whitespace-free JSON.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Problem found on one line of an audit log (1-based line number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainProblem {
    pub line: usize,
    pub reason: String,
}

/// Result of checking a whole audit log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub records: usize,
    /// Hash of the last readable record.
    pub head: Option<String>,
    pub problems: Vec<ChainProblem>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check every record's hash and every `prevHash` link.
///
/// Records without `prevHash` were written with chaining off; only their
/// own hash is checked. Blank lines are ignored.
pub fn verify_chain<'a>(lines: impl IntoIterator<Item = &'a str>) -> ChainReport {
    let mut report = ChainReport::default();
    let mut previous: Option<String> = None;

    for (idx, line) in lines.into_iter().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut problem = |reason: String| {
            report.problems.push(ChainProblem {
                line: line_no,
                reason,
            })
        };

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                problem(format!("not valid JSON: {}", e));
                continue;
            }
        };
        let stored = value.get("hash").and_then(Value::as_str).map(str::to_string);
        let Some(stored) = stored else {
            problem("missing hash".to_string());
            continue;
        };

        match recompute_hash(&value) {
            Ok(expected) if expected == stored => {}
            Ok(_) => problem("hash does not match content".to_string()),
            Err(e) => problem(format!("{:#}", e)),
        }

        if let Some(prev) = value.get("prevHash").and_then(Value::as_str) {
            let want = previous.as_deref().unwrap_or(GENESIS);
            if prev != want {
                problem(format!("prevHash {} does not link to {}", prev, want));
            }
        }

        report.records += 1;
        previous = Some(stored);
    }

    report.head = previous;
    report
}

/// Verify a local JSONL audit log. A missing file is an empty, intact log.
pub fn verify_file(path: &Path) -> Result<ChainReport> {
    if !path.exists() {
        return Ok(ChainReport::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log: {}", path.display()))?;
    Ok(verify_chain(content.lines()))
}
