//! Audit log destinations.
//!
//! | Destination | Layout |
//! |-------------|--------|
//! | `file` | one JSON line per record appended to `audit.path` |
//! | `s3` | one object per record: `<prefix><millis>-<hash12>.jsonl` |
//!
//! Both are append-only. The file sink opens in append mode and never
//! truncates. The S3 sink writes with `If-None-Match: *`, so an existing
//! object is never replaced, and zero-padded millisecond keys make the
//! lexicographic listing order equal to the append order.
//!
//! Several processes may write one log. The file sink serializes them with
//! an exclusive lock on `<path>.lock`, held while the head is read and the
//! record appended. The S3 sink has no lock; it refuses a record whose
//! `prevHash` does not link to the last listed object.
//!
//! Any write failure is a [`KbError::PersistenceFailure`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::audit::{AuditRecord, GENESIS};
use crate::config::Config;
use crate::error::KbError;
use crate::s3::S3Client;

/// Key prefix for whole-log snapshots.
pub const SNAPSHOT_PREFIX: &str = "audit_logs/";

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Where records go, for logs and `govkb check`.
    fn describe(&self) -> String;

    /// Durably append one record.
    async fn append(&self, record: &AuditRecord) -> Result<(), KbError>;

    /// Every stored record, oldest first, as raw JSON lines.
    async fn read_lines(&self) -> Result<Vec<String>, KbError>;

    /// The most recent record's hash and time, if any.
    async fn last_head(&self) -> Result<Option<ChainHead>, KbError> {
        let lines = self.read_lines().await?;
        match lines.iter().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => head_of_line(line).map(Some),
            None => Ok(None),
        }
    }

    /// Hash of the most recent record, if any.
    async fn last_hash(&self) -> Result<Option<String>, KbError> {
        Ok(self.last_head().await?.map(|h| h.hash))
    }

    /// Exclusive write access shared with other processes, held from
    /// reading the head until the append completes.
    async fn lock_writer(&self) -> Result<WriterLock, KbError> {
        Ok(WriterLock::default())
    }
}

/// Held writer lock; released on drop. Empty for sinks without one.
#[derive(Debug, Default)]
pub struct WriterLock {
    file: Option<std::fs::File>,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

fn persistence(e: anyhow::Error) -> KbError {
    KbError::PersistenceFailure(format!("{:#}", e))
}

/// Newest stored record, as far as chaining needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: String,
    /// Unix millis of the record's `timestamp`, when it parses.
    pub millis: Option<i64>,
}

fn head_of_line(line: &str) -> Result<ChainHead, KbError> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        KbError::PersistenceFailure(format!("last audit record is not valid JSON: {}", e))
    })?;
    let hash = value
        .get("hash")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KbError::PersistenceFailure("last audit record has no hash".into()))?;
    let millis = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis());
    Ok(ChainHead { hash, millis })
}

// ============ Local file ============

/// Newline-delimited JSON file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file locked by writers: `<path>.lock`.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create audit directory: {}", parent.display())
                })?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileSink {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), KbError> {
        let line = serde_json::to_string(record)
            .map_err(|e| KbError::PersistenceFailure(format!("serialize audit record: {}", e)))?;
        self.write_line(&line)
            .await
            .with_context(|| format!("append to {}", self.path.display()))
            .map_err(persistence)
    }

    async fn read_lines(&self) -> Result<Vec<String>, KbError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(KbError::PersistenceFailure(format!(
                "Failed to read audit log {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn last_head(&self) -> Result<Option<ChainHead>, KbError> {
        let path = self.path.clone();
        let line = tokio::task::spawn_blocking(move || last_line(&path))
            .await
            .map_err(|e| KbError::PersistenceFailure(format!("audit head task failed: {}", e)))?
            .with_context(|| format!("Failed to read audit log {}", self.path.display()))
            .map_err(persistence)?;
        line.as_deref().map(head_of_line).transpose()
    }

    async fn lock_writer(&self) -> Result<WriterLock, KbError> {
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || acquire_lock(&lock_path))
            .await
            .map_err(|e| KbError::PersistenceFailure(format!("audit lock task failed: {}", e)))?
            .map_err(persistence)
    }
}

fn acquire_lock(path: &Path) -> Result<WriterLock> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create audit directory: {}", parent.display())
            })?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open audit lock: {}", path.display()))?;
    FileExt::lock_exclusive(&file)
        .with_context(|| format!("Failed to lock {}", path.display()))?;
    Ok(WriterLock { file: Some(file) })
}

/// Last non-blank line of `path`, read backwards from the end.
fn last_line(path: &Path) -> std::io::Result<Option<String>> {
    const BLOCK: u64 = 8192;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut end = file.metadata()?.len();
    let mut tail: Vec<u8> = Vec::new();
    loop {
        let content_end = tail
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if let Some(nl) = tail[..content_end].iter().rposition(|&b| b == b'\n') {
            return Ok(Some(
                String::from_utf8_lossy(&tail[nl + 1..content_end]).into_owned(),
            ));
        }
        if end == 0 {
            return Ok((content_end > 0)
                .then(|| String::from_utf8_lossy(&tail[..content_end]).into_owned()));
        }
        let start = end.saturating_sub(BLOCK);
        let mut block = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;
        block.extend_from_slice(&tail);
        tail = block;
        end = start;
    }
}

// ============ Object storage ============

/// One object per record under a key prefix.
pub struct S3Sink {
    client: Arc<S3Client>,
    prefix: String,
}

impl S3Sink {
    pub fn new(client: Arc<S3Client>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// `<prefix><millis>-<hash12>.jsonl`, millis taken from the record's
    /// timestamp and zero-padded to 13 digits.
    pub fn object_key(&self, record: &AuditRecord) -> String {
        let millis = DateTime::parse_from_rfc3339(&record.timestamp)
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|_| Utc::now().timestamp_millis());
        let short = record.hash.get(..12).unwrap_or(&record.hash);
        format!("{}{:013}-{}.jsonl", self.prefix, millis, short)
    }
}

#[async_trait]
impl AuditSink for S3Sink {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.client.bucket(), self.prefix)
    }

    async fn append(&self, record: &AuditRecord) -> Result<(), KbError> {
        let mut body = serde_json::to_vec(record)
            .map_err(|e| KbError::PersistenceFailure(format!("serialize audit record: {}", e)))?;
        body.push(b'\n');
        let key = self.object_key(record);
        if let Some(ref prev) = record.prev_hash {
            let keys = self
                .client
                .list_keys(&self.prefix)
                .await
                .map_err(persistence)?;
            let last = keys.last().map(String::as_str);
            if let Some(conflict) = chain_conflict(&self.prefix, last, &key, prev) {
                return Err(KbError::PersistenceFailure(format!(
                    "audit chain conflict: {}",
                    conflict
                )));
            }
        }
        self.client
            .put_object(&key, body, "application/x-ndjson", true)
            .await
            .map_err(persistence)?;
        tracing::debug!(key = %key, "audit record stored");
        Ok(())
    }

    async fn read_lines(&self) -> Result<Vec<String>, KbError> {
        let keys = self
            .client
            .list_keys(&self.prefix)
            .await
            .map_err(persistence)?;
        let mut lines = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.client.get_object(&key).await.map_err(persistence)?;
            let text = String::from_utf8_lossy(&bytes);
            lines.extend(text.lines().map(str::to_string));
        }
        Ok(lines)
    }

    async fn last_head(&self) -> Result<Option<ChainHead>, KbError> {
        let keys = self
            .client
            .list_keys(&self.prefix)
            .await
            .map_err(persistence)?;
        let Some(last) = keys.last() else {
            return Ok(None);
        };
        let bytes = self.client.get_object(last).await.map_err(persistence)?;
        let text = String::from_utf8_lossy(&bytes);
        match text.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => head_of_line(line).map(Some),
            None => Ok(None),
        }
    }
}

/// Why `key`, linking to `prev`, cannot follow `last` (the newest existing
/// key under `prefix`). `None` when it can.
pub fn chain_conflict(prefix: &str, last: Option<&str>, key: &str, prev: &str) -> Option<String> {
    let Some(last) = last else {
        return (prev != GENESIS)
            .then(|| format!("prevHash {} but no earlier record exists", prev));
    };
    let last_short = last
        .strip_prefix(prefix)
        .and_then(|name| name.strip_suffix(".jsonl"))
        .and_then(|name| name.rsplit_once('-'))
        .map(|(_, short)| short)
        .unwrap_or("");
    let prev_short = prev.get(..12).unwrap_or(prev);
    if last_short.is_empty() || last_short != prev_short {
        return Some(format!("prevHash {} does not link to newest object {}", prev, last));
    }
    if key <= last {
        return Some(format!("key {} does not sort after newest object {}", key, last));
    }
    None
}

/// Build the sink named by `audit.destination`.
pub fn open_sink(config: &Config) -> Result<Arc<dyn AuditSink>, KbError> {
    match config.audit.destination.as_str() {
        "file" => Ok(Arc::new(FileSink::new(config.audit.path.clone()))),
        "s3" => {
            let client = S3Client::from_config(config)
                .map_err(|e| KbError::Configuration(format!("{:#}", e)))?
                .ok_or_else(|| {
                    KbError::Configuration(
                        "s3 audit destination needs [storage] and AWS credentials".into(),
                    )
                })?;
            Ok(Arc::new(S3Sink::new(Arc::new(client), config.audit.prefix.clone())))
        }
        other => Err(KbError::Configuration(format!(
            "Unknown audit destination: '{}'",
            other
        ))),
    }
}

/// `audit_logs/audit_<millis>-<sha12>.jsonl`, where `sha12` is the start of
/// the SHA-256 of the uploaded bytes.
pub fn snapshot_key(body: &[u8], at: DateTime<Utc>) -> String {
    let digest = hex::encode(Sha256::digest(body));
    format!(
        "{}audit_{:013}-{}.jsonl",
        SNAPSHOT_PREFIX,
        at.timestamp_millis(),
        &digest[..12]
    )
}

/// Upload the whole local audit log under [`snapshot_key`].
///
/// Returns the object key written.
pub async fn snapshot(client: &S3Client, log_path: &Path) -> Result<String> {
    let body = tokio::fs::read(log_path)
        .await
        .with_context(|| format!("Failed to read audit log: {}", log_path.display()))?;
    let key = snapshot_key(&body, Utc::now());
    client
        .put_object(&key, body, "application/x-ndjson", true)
        .await?;
    tracing::info!(bucket = client.bucket(), key = %key, "audit log snapshot uploaded");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{build, RecordDraft, GENESIS};
    use crate::models::{Mode, Query, RetrievalResult, VectorAnswer};
    use chrono::TimeZone;

    fn record(text: &str, prev: Option<&str>) -> AuditRecord {
        let draft = RecordDraft::new(
            Query::new(text, Mode::Vector),
            RetrievalResult::Vector(VectorAnswer { matches: vec![] }),
            Default::default(),
        );
        build(draft, prev, Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_file_sink_appends_and_recovers_head() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested/audits/log.jsonl"));
        assert_eq!(sink.last_hash().await.unwrap(), None);

        let a = record("one", Some(GENESIS));
        let b = record("two", Some(&a.hash));
        sink.append(&a).await.unwrap();
        sink.append(&b).await.unwrap();

        let lines = sink.read_lines().await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(sink.last_hash().await.unwrap(), Some(b.hash.clone()));
        let head = sink.last_head().await.unwrap().unwrap();
        assert_eq!(head.millis, Some(1714554000000));
        let first: AuditRecord = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first, a);
    }

    #[tokio::test]
    async fn test_file_sink_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"hash\":\"existing\"}\n").unwrap();

        let sink = FileSink::new(&path);
        assert_eq!(sink.last_hash().await.unwrap().as_deref(), Some("existing"));
        sink.append(&record("q", None)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("{\"hash\":\"existing\"}\n"));
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_file_sink_failure_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let sink = FileSink::new(dir.path());
        let err = sink.append(&record("q", None)).await.unwrap_err();
        assert!(matches!(err, KbError::PersistenceFailure(_)));
    }

    #[test]
    fn test_object_keys_sort_in_append_order() {
        let storage = crate::config::StorageConfig {
            bucket: "audit".into(),
            region: "us-east-1".into(),
            endpoint_url: Some("http://localhost:9000".into()),
        };
        let creds = crate::config::AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        };
        let sink = S3Sink::new(
            Arc::new(S3Client::new(&storage, creds, 5).unwrap()),
            "audit_records/",
        );

        let mut early = record("a", None);
        early.timestamp = "2001-09-09T01:46:39.999Z".into();
        let mut late = record("b", None);
        late.timestamp = "2001-09-09T01:46:40.000Z".into();

        let k1 = sink.object_key(&early);
        let k2 = sink.object_key(&late);
        assert_eq!(k1, format!("audit_records/0999999999999-{}.jsonl", &early.hash[..12]));
        assert!(k1 < k2);
        assert_eq!(sink.describe(), "s3://audit/audit_records/");
    }

    #[tokio::test]
    async fn test_file_head_read_from_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let sink = FileSink::new(&path);
        let mut prev = GENESIS.to_string();
        // Enough records to span several read blocks.
        for i in 0..60 {
            let r = record(&format!("query {} {}", i, "x".repeat(300)), Some(&prev));
            sink.append(&r).await.unwrap();
            prev = r.hash;
        }
        assert!(std::fs::metadata(&path).unwrap().len() > 16384);
        assert_eq!(sink.last_hash().await.unwrap(), Some(prev.clone()));

        // Trailing blank lines are skipped.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("\n  \n");
        std::fs::write(&path, content).unwrap();
        assert_eq!(sink.last_hash().await.unwrap(), Some(prev));
    }

    #[test]
    fn test_last_line_single_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        assert_eq!(last_line(&path).unwrap(), None);
        std::fs::write(&path, "").unwrap();
        assert_eq!(last_line(&path).unwrap(), None);
        std::fs::write(&path, "{\"hash\":\"only\"}").unwrap();
        assert_eq!(last_line(&path).unwrap().as_deref(), Some("{\"hash\":\"only\"}"));
    }

    #[tokio::test]
    async fn test_writer_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("audits/log.jsonl"));
        let held = sink.lock_writer().await.unwrap();
        assert!(sink.lock_path().exists());

        let other = std::fs::OpenOptions::new()
            .write(true)
            .open(sink.lock_path())
            .unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_err());
        drop(held);
        assert!(FileExt::try_lock_exclusive(&other).is_ok());
    }

    #[test]
    fn test_chain_conflict_rules() {
        let prefix = "audit_records/";
        let head = "abcdef0123456789";
        let last = "audit_records/1714554000000-abcdef012345.jsonl";
        let next = "audit_records/1714554000001-99aa00bb11cc.jsonl";

        assert_eq!(chain_conflict(prefix, None, next, GENESIS), None);
        assert!(chain_conflict(prefix, None, next, head).is_some());
        assert_eq!(chain_conflict(prefix, Some(last), next, head), None);
        // Another writer got there first.
        let stale = chain_conflict(prefix, Some(last), next, "0000000000000000").unwrap();
        assert!(stale.contains("does not link"));
        assert!(chain_conflict(prefix, Some(last), next, GENESIS).is_some());
        // Clock behind the newest object.
        let early = "audit_records/1714553999999-99aa00bb11cc.jsonl";
        assert!(chain_conflict(prefix, Some(last), early, head).unwrap().contains("sort after"));
    }

    #[test]
    fn test_snapshot_keys_distinct_within_one_second() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let a = snapshot_key(b"{\"hash\":\"a\"}\n", t);
        let b = snapshot_key(
            b"{\"hash\":\"a\"}\n{\"hash\":\"b\"}\n",
            t + chrono::Duration::milliseconds(1),
        );
        let c = snapshot_key(b"{\"hash\":\"a\"}\n{\"hash\":\"b\"}\n", t);
        assert!(a.starts_with("audit_logs/audit_1714554000000-"));
        assert!(a.ends_with(".jsonl"));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_open_sink_s3_without_credentials() {
        let mut cfg = Config::minimal();
        cfg.audit.destination = "s3".into();
        let err = open_sink(&cfg).err().unwrap();
        assert!(matches!(err, KbError::Configuration(_)));
    }
}
