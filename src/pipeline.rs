//! One query, end to end.
//!
//! ```text
//! query ─► guardrails ─► retriever ─► evidence ─► answer ─► audit trail
//!          (redact)      (vector |     (collect    (synth)   (build +
//!                        assistant)     + resolve)           append)
//! ```
//!
//! Retrieval errors fail the query. Evidence problems only shrink the
//! evidence map. An audit write failure does not withhold the answer: the
//! outcome comes back with `audit_not_recorded = true` and the failure is
//! logged at error level.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::answer;
use crate::audit::RecordDraft;
use crate::config::Config;
use crate::error::KbError;
use crate::evidence::{EvidenceMap, EvidenceResolver, UrlSigner};
use crate::governance;
use crate::guardrails::{GuardrailReport, Guardrails};
use crate::models::{EvidenceRefs, Mode, Query, RetrievalResult};
use crate::retrieval::Retriever;
use crate::s3::S3Client;
use crate::sink;
use crate::trail::AuditTrail;

/// Everything a caller gets back for one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    /// The query as sent to the backend (after redaction).
    pub query: String,
    pub mode: Mode,
    pub answer: String,
    pub confidence: Option<f64>,
    pub result: RetrievalResult,
    pub evidence: EvidenceRefs,
    /// Keys referenced by the matches, resolved or not.
    pub evidence_keys: BTreeSet<String>,
    pub guardrails: GuardrailReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_hash: Option<String>,
    pub audit_not_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

pub struct Pipeline {
    guardrails: Guardrails,
    retriever: Retriever,
    evidence: EvidenceResolver,
    trail: AuditTrail,
    model: String,
}

impl Pipeline {
    pub fn new(
        guardrails: Guardrails,
        retriever: Retriever,
        evidence: EvidenceResolver,
        trail: AuditTrail,
        model: impl Into<String>,
    ) -> Self {
        Self {
            guardrails,
            retriever,
            evidence,
            trail,
            model: model.into(),
        }
    }

    /// Wire every component from configuration.
    pub async fn from_config(config: &Config) -> Result<Self, KbError> {
        let configuration = |e: anyhow::Error| KbError::Configuration(format!("{:#}", e));

        let status = governance::check(config);
        if !status.ok {
            for v in &status.violations {
                tracing::warn!(violation = %v, "governance check failed");
            }
        }

        let guardrails = Guardrails::from_config(&config.guardrails).map_err(configuration)?;
        let retriever = Retriever::from_config(config)?;

        let map = EvidenceMap::load(&config.evidence.map_path).map_err(configuration)?;
        let signer: Option<Arc<dyn UrlSigner>> = S3Client::from_config(config)
            .map_err(configuration)?
            .map(|c| Arc::new(c) as Arc<dyn UrlSigner>);
        let evidence = EvidenceResolver::new(map, signer, config.evidence.presign_ttl_secs);

        let trail = AuditTrail::open(sink::open_sink(config)?, config.audit.chain).await?;

        Ok(Self::new(
            guardrails,
            retriever,
            evidence,
            trail,
            config.audit.model_label.clone(),
        ))
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.retriever.supports(mode)
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub fn evidence(&self) -> &EvidenceResolver {
        &self.evidence
    }

    pub async fn ask(&self, query: Query) -> Result<QueryOutcome, KbError> {
        let report = self.guardrails.sanitize(&query.text);
        let query = Query {
            text: report.redacted.clone(),
            ..query
        };

        let result = self.retriever.retrieve(&query).await?;

        let evidence_keys = self.evidence.collect_keys(result.matches());
        let evidence = self.evidence.resolve(&evidence_keys);

        let answer = answer::synthesize(&query.text, &result);

        let draft = RecordDraft::new(query.clone(), result.clone(), evidence.clone())
            .with_answer(&answer)
            .with_guardrails(&report)
            .with_model(self.model.clone());

        let (audit_hash, audit_error) = match self.trail.record(draft).await {
            Ok(record) => (Some(record.hash), None),
            Err(e) => {
                tracing::error!(error = %e, mode = %query.mode, "answer delivered without audit record");
                (None, Some(e.to_string()))
            }
        };

        tracing::info!(
            mode = %query.mode,
            matches = result.matches().len(),
            evidence = evidence.len(),
            audited = audit_hash.is_some(),
            "query answered"
        );

        Ok(QueryOutcome {
            query: query.text,
            mode: query.mode,
            answer: answer.text,
            confidence: answer.confidence,
            result,
            evidence,
            evidence_keys,
            guardrails: report,
            audit_not_recorded: audit_hash.is_none(),
            audit_hash,
            audit_error,
        })
    }
}
