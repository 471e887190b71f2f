//! CLI command implementations.
//!
//! Each `run_*` function backs one `govkb` subcommand: it loads what it
//! needs from the [`Config`], does the work, and prints to stdout. Logs go
//! to stderr through `tracing`, so stdout stays clean for `--json`.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::audit::{self, ChainReport};
use crate::config::Config;
use crate::evidence::{EvidenceMap, EvidenceResolver, UrlSigner};
use crate::governance;
use crate::models::{Filters, Mode, Query};
use crate::pipeline::{Pipeline, QueryOutcome};
use crate::s3::S3Client;
use crate::sink;

/// `govkb ask`: answer one query and print the outcome.
pub async fn run_ask(
    config: &Config,
    text: &str,
    mode: Option<Mode>,
    filters: Filters,
    json: bool,
) -> Result<()> {
    if text.trim().is_empty() {
        bail!("query must not be empty");
    }
    let mode = mode.unwrap_or(config.retrieval.default_mode);
    let pipeline = Pipeline::from_config(config).await?;
    let outcome = pipeline
        .ask(Query::new(text, mode).with_filters(filters))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &QueryOutcome) {
    println!("{}", outcome.answer);
    println!();
    if let Some(c) = outcome.confidence {
        println!("Confidence: {:.3}", c);
    }

    let matches = outcome.result.matches();
    if !matches.is_empty() {
        println!();
        println!("{:<8} {:<12} {:<12} ID", "SCORE", "FRAMEWORK", "CONTROL");
        for m in matches {
            let score = m
                .score
                .map(|s| format!("{:.4}", s))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<8} {:<12} {:<12} {}",
                score,
                m.framework().unwrap_or("-"),
                m.control_id().unwrap_or("-"),
                m.id
            );
        }
    }

    if !outcome.evidence_keys.is_empty() {
        println!();
        println!("Evidence:");
        for key in &outcome.evidence_keys {
            match outcome.evidence.get(key) {
                Some(uri) => println!("  {}  {}", key, uri),
                None => println!("  {}  (unavailable)", key),
            }
        }
    }

    println!();
    match outcome.audit_hash {
        Some(ref h) => println!("Audit: recorded {}", h),
        None => println!(
            "Audit: NOT RECORDED ({})",
            outcome.audit_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// `govkb verify`: re-hash every audit record and check the links.
///
/// Reads `path` when given, otherwise the configured sink. Fails when the
/// chain is broken.
pub async fn run_verify(config: &Config, path: Option<&Path>) -> Result<()> {
    let (source, report) = match path {
        Some(p) => (p.display().to_string(), audit::verify_file(p)?),
        None => {
            let sink = sink::open_sink(config)?;
            let lines = sink.read_lines().await?;
            (
                sink.describe(),
                audit::verify_chain(lines.iter().map(String::as_str)),
            )
        }
    };
    print_report(&source, &report);
    if !report.is_intact() {
        bail!("audit chain verification failed: {} problem(s)", report.problems.len());
    }
    Ok(())
}

fn print_report(source: &str, report: &ChainReport) {
    println!("Audit log: {}", source);
    println!("  Records: {}", report.records);
    println!("  Head:    {}", report.head.as_deref().unwrap_or("(empty)"));
    if report.is_intact() {
        println!("  Status:  intact");
        return;
    }
    println!("  Status:  BROKEN");
    for p in &report.problems {
        println!("  line {}: {}", p.line, p.reason);
    }
}

/// `govkb snapshot`: upload the local audit log to the storage bucket.
pub async fn run_snapshot(config: &Config) -> Result<()> {
    if config.audit.destination != "file" {
        bail!("snapshots upload the local audit log; audit.destination is not 'file'");
    }
    let client = S3Client::from_config(config)?
        .ok_or_else(|| anyhow!("snapshot needs a [storage] section and AWS credentials"))?;
    let key = sink::snapshot(&client, &config.audit.path).await?;
    println!("Uploaded s3://{}/{}", client.bucket(), key);
    Ok(())
}

fn evidence_resolver(config: &Config) -> Result<EvidenceResolver> {
    let map = EvidenceMap::load(&config.evidence.map_path)?;
    let signer = S3Client::from_config(config)?.map(|c| Arc::new(c) as Arc<dyn UrlSigner>);
    Ok(EvidenceResolver::new(
        map,
        signer,
        config.evidence.presign_ttl_secs,
    ))
}

/// `govkb evidence`: resolve keys, or list every known key.
pub fn run_evidence(config: &Config, keys: &[String]) -> Result<()> {
    let resolver = evidence_resolver(config)?;

    if keys.is_empty() {
        let known = resolver.known_keys();
        println!("{} evidence key(s) in {}", known.len(), config.evidence.map_path.display());
        for k in known {
            println!("  {}", k);
        }
        return Ok(());
    }

    let wanted: BTreeSet<String> = keys.iter().cloned().collect();
    let resolved = resolver.resolve(&wanted);
    for key in &wanted {
        match resolved.get(key) {
            Some(uri) => println!("{}  {}", key, uri),
            None => println!("{}  (unresolved)", key),
        }
    }
    Ok(())
}

/// `govkb check`: summarize the configuration and run the governance
/// checks. Fails on governance violations.
pub fn run_check(config: &Config) -> Result<()> {
    let modes: Vec<String> = [Mode::Vector, Mode::Assistant]
        .into_iter()
        .filter(|m| config.supports(*m))
        .map(|m| m.to_string())
        .collect();
    let resolver = evidence_resolver(config).context("evidence map")?;
    let audit_target = match config.audit.destination.as_str() {
        "s3" => format!(
            "s3://{}/{}",
            config.storage.as_ref().map(|s| s.bucket.as_str()).unwrap_or("?"),
            config.audit.prefix
        ),
        _ => config.audit.path.display().to_string(),
    };

    println!("Configuration");
    println!("  Modes:         {}", if modes.is_empty() { "(none)".to_string() } else { modes.join(", ") });
    println!("  Default mode:  {}", config.retrieval.default_mode);
    println!("  Top k:         {}", config.retrieval.top_k);
    println!("  Timeout:       {}s", config.retrieval.timeout_secs);
    println!("  Evidence keys: {}", resolver.known_keys().len());
    println!(
        "  Audit:         {} (chain {})",
        audit_target,
        if config.audit.chain { "on" } else { "off" }
    );

    let status = governance::check(config);
    println!("  Governance:    {}", status.message());
    if !status.ok {
        bail!("governance check failed");
    }
    Ok(())
}
