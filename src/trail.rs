//! The running audit chain.
//!
//! [`AuditTrail`] serializes appends: building a record and writing it
//! happen under one lock, so concurrent queries cannot fork the chain.
//! Other processes may append to the same sink, so the head is re-read from
//! the sink under its writer lock before every record. The cached head
//! moves only after the sink confirms the write.
//!
//! Timestamps strictly increase along the chain (a record written in the
//! same millisecond as the newest stored record is stamped one millisecond
//! later), so time-ordered object keys match append order.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit::{self, AuditRecord, RecordDraft, GENESIS};
use crate::error::KbError;
use crate::sink::{AuditSink, ChainHead};

pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    chain: bool,
    head: Mutex<Head>,
}

#[derive(Default)]
struct Head {
    hash: Option<String>,
    /// Unix millis of the last record written.
    stamped: Option<i64>,
}

impl Head {
    /// Adopt the sink's newest record, which another writer may have added.
    fn follow(&mut self, newest: Option<ChainHead>) {
        let Some(newest) = newest else {
            self.hash = None;
            return;
        };
        if matches!(self.hash.as_deref(), Some(cached) if cached != newest.hash) {
            tracing::debug!(current = %newest.hash, "audit head advanced by another writer");
        }
        self.hash = Some(newest.hash);
        self.stamped = self.stamped.max(newest.millis);
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let millis = match self.stamped {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }
}

impl AuditTrail {
    /// Attach to `sink`, recovering the chain head from what it already
    /// holds.
    pub async fn open(sink: Arc<dyn AuditSink>, chain: bool) -> Result<Self, KbError> {
        let mut head = Head::default();
        if chain {
            head.follow(sink.last_head().await?);
        }
        tracing::info!(
            sink = %sink.describe(),
            chain,
            head = head.hash.as_deref().unwrap_or(GENESIS),
            "audit trail opened"
        );
        Ok(Self {
            sink,
            chain,
            head: Mutex::new(head),
        })
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub async fn head(&self) -> Option<String> {
        self.head.lock().await.hash.clone()
    }

    /// Hash, link, and persist one record.
    pub async fn record(&self, draft: RecordDraft) -> Result<AuditRecord, KbError> {
        let mut head = self.head.lock().await;
        let _writer = self.sink.lock_writer().await?;
        if self.chain {
            head.follow(self.sink.last_head().await?);
        }
        let prev = if self.chain {
            Some(head.hash.clone().unwrap_or_else(|| GENESIS.to_string()))
        } else {
            None
        };
        let timestamp = head.next_timestamp();

        let record = audit::build(draft, prev.as_deref(), timestamp)
            .map_err(|e| KbError::PersistenceFailure(format!("{:#}", e)))?;
        self.sink.append(&record).await?;

        head.hash = Some(record.hash.clone());
        head.stamped = Some(timestamp.timestamp_millis());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{verify_chain, verify_file};
    use crate::models::{Mode, Query, RetrievalResult, VectorAnswer};
    use crate::sink::FileSink;
    use async_trait::async_trait;

    fn draft(text: &str) -> RecordDraft {
        RecordDraft::new(
            Query::new(text, Mode::Vector),
            RetrievalResult::Vector(VectorAnswer { matches: vec![] }),
            Default::default(),
        )
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        fn describe(&self) -> String {
            "failing".into()
        }
        async fn append(&self, _record: &AuditRecord) -> Result<(), KbError> {
            Err(KbError::PersistenceFailure("disk full".into()))
        }
        async fn read_lines(&self) -> Result<Vec<String>, KbError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let trail = AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap();
        let first = trail.record(draft("one")).await.unwrap();
        assert_eq!(first.prev_hash.as_deref(), Some(GENESIS));
        drop(trail);

        let trail = AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap();
        assert_eq!(trail.head().await, Some(first.hash.clone()));
        let second = trail.record(draft("two")).await.unwrap();
        assert_eq!(second.prev_hash.as_deref(), Some(first.hash.as_str()));

        let content = std::fs::read_to_string(&path).unwrap();
        let report = verify_chain(content.lines());
        assert!(report.is_intact(), "{:?}", report.problems);
        assert_eq!(report.records, 2);
    }

    #[tokio::test]
    async fn test_concurrent_records_form_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let trail = Arc::new(
            AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let trail = trail.clone();
            handles.push(tokio::spawn(async move {
                trail.record(draft(&format!("query {}", i))).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let report = verify_chain(content.lines());
        assert!(report.is_intact(), "{:?}", report.problems);
        assert_eq!(report.records, 8);
        assert_eq!(report.head, trail.head().await);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(Arc::new(FileSink::new(dir.path().join("a.jsonl"))), true)
            .await
            .unwrap();
        let mut stamps = Vec::new();
        for i in 0..20 {
            stamps.push(trail.record(draft(&i.to_string())).await.unwrap().timestamp);
        }
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_two_trails_on_one_file_stay_linked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let a = AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap();
        let first = a.record(draft("from a")).await.unwrap();
        let b = AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap();
        let second = b.record(draft("from b")).await.unwrap();
        let third = a.record(draft("from a again")).await.unwrap();

        assert_eq!(second.prev_hash.as_deref(), Some(first.hash.as_str()));
        assert_eq!(third.prev_hash.as_deref(), Some(second.hash.as_str()));
        let report = verify_file(&path).unwrap();
        assert!(report.is_intact(), "{:?}", report.problems);
        assert_eq!(report.records, 3);
        assert_eq!(a.head().await, Some(third.hash));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_trails_on_one_file_form_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut handles = Vec::new();
        for t in 0..3 {
            let trail = Arc::new(
                AuditTrail::open(Arc::new(FileSink::new(&path)), true).await.unwrap(),
            );
            for i in 0..4 {
                let trail = trail.clone();
                handles.push(tokio::spawn(async move {
                    trail.record(draft(&format!("trail {} query {}", t, i))).await.unwrap()
                }));
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        let report = verify_file(&path).unwrap();
        assert!(report.is_intact(), "{:?}", report.problems);
        assert_eq!(report.records, 12);
    }

    #[tokio::test]
    async fn test_stamps_after_newest_stored_record() {
        use chrono::TimeZone;
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path().join("a.jsonl")));
        let trail = AuditTrail::open(sink.clone(), true).await.unwrap();

        // Another writer with a clock far ahead.
        let ahead = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        let foreign = audit::build(draft("elsewhere"), Some(GENESIS), ahead).unwrap();
        sink.append(&foreign).await.unwrap();

        let r = trail.record(draft("here")).await.unwrap();
        assert_eq!(r.prev_hash.as_deref(), Some(foreign.hash.as_str()));
        assert_eq!(r.timestamp, "2099-01-01T00:00:00.001Z");
    }

    #[tokio::test]
    async fn test_failed_append_keeps_head() {
        let trail = AuditTrail::open(Arc::new(FailingSink), true).await.unwrap();
        let err = trail.record(draft("q")).await.unwrap_err();
        assert!(matches!(err, KbError::PersistenceFailure(_)));
        assert_eq!(trail.head().await, None);
    }

    #[tokio::test]
    async fn test_unchained_records_have_no_prev_hash() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::open(Arc::new(FileSink::new(dir.path().join("a.jsonl"))), false)
            .await
            .unwrap();
        let r = trail.record(draft("q")).await.unwrap();
        assert!(r.prev_hash.is_none());
    }
}
