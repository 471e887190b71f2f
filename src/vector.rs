//! Vector search backends.
//!
//! Two implementations of [`VectorBackend`]:
//!
//! - **[`PineconeIndex`]**: the hosted index, queried with
//!   `POST https://<index_host>/query`.
//! - **[`LocalIndex`]**: a JSON file of pre-embedded chunks scored with
//!   [`cosine_similarity`]; useful offline and in tests.
//!
//! Both apply the metadata filter as exact-match equality with logical AND
//! and return matches best-first. The retrieval adapter still re-checks the
//! filter and ordering on whatever a backend returns.
//!
//! # Local index format
//!
//! ```json
//! [
//!   {
//!     "id": "nist-ia-2",
//!     "text": "Identification and Authentication (Organizational Users) ...",
//!     "namespace": "controls",
//!     "metadata": { "framework": "NIST80053", "control_id": "IA-2" },
//!     "values": [0.012, -0.094, ...]
//!   }
//! ]
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::embedding::cosine_similarity;
use crate::models::{Filters, Match};

/// Pinecone data-plane API version sent with every request.
const PINECONE_API_VERSION: &str = "2024-07";

/// One similarity search request.
pub struct VectorQuery<'a> {
    pub vector: &'a [f32],
    pub top_k: usize,
    pub filters: &'a Filters,
    pub namespace: Option<&'a str>,
}

/// A similarity search service.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Short backend label for logs (e.g. `"pinecone"`).
    fn name(&self) -> &str;

    /// Return up to `top_k` matches for the query vector, best first.
    async fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<Match>>;
}

/// Turn a bare host into an https base URL; keep an explicit scheme.
pub(crate) fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

/// Render filters in Pinecone's metadata filter language.
///
/// `{framework: "SOC2", control_id: "CC6.6"}` becomes
/// `{"framework": {"$eq": "SOC2"}, "control_id": {"$eq": "CC6.6"}}`;
/// sibling conditions are ANDed by the service.
pub fn pinecone_filter(filters: &Filters) -> Option<Value> {
    let pairs = filters.metadata_pairs();
    if pairs.is_empty() {
        return None;
    }
    let mut obj = Map::new();
    for (field, value) in pairs {
        obj.insert(field.to_string(), json!({ "$eq": value }));
    }
    Some(Value::Object(obj))
}

// ============ Pinecone ============

/// Client for a Pinecone serverless or pod index.
pub struct PineconeIndex {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl PineconeIndex {
    pub fn new(index_host: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url(index_host),
            api_key: api_key.to_string(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct PineconeQueryResponse {
    #[serde(default)]
    matches: Vec<PineconeMatch>,
}

#[derive(Deserialize)]
struct PineconeMatch {
    id: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, Value>>,
}

impl From<PineconeMatch> for Match {
    fn from(m: PineconeMatch) -> Self {
        let mut metadata = m.metadata.unwrap_or_default();
        let text = match metadata.remove("text") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Match {
            id: m.id,
            score: m.score.filter(|s| s.is_finite()),
            text,
            metadata,
        }
    }
}

#[async_trait]
impl VectorBackend for PineconeIndex {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<Match>> {
        let mut body = json!({
            "vector": query.vector,
            "topK": query.top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(ns) = query.namespace {
            body["namespace"] = json!(ns);
        }
        if let Some(filter) = pinecone_filter(query.filters) {
            body["filter"] = filter;
        }

        let url = format!("{}/query", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            bail!("Pinecone rejected the API key (HTTP {})", status);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Pinecone query failed (HTTP {}): {}",
                status,
                text.chars().take(300).collect::<String>()
            );
        }

        let parsed: PineconeQueryResponse = resp
            .json()
            .await
            .context("Invalid Pinecone query response")?;
        Ok(parsed.matches.into_iter().map(Match::from).collect())
    }
}

// ============ Local index ============

#[derive(Debug, Deserialize)]
struct LocalRecord {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    values: Vec<f32>,
}

/// In-process index over a JSON file of pre-embedded chunks.
pub struct LocalIndex {
    records: Vec<LocalRecord>,
}

impl LocalIndex {
    /// Load the index file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read local index: {}", path.display()))?;
        let records: Vec<LocalRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse local index: {}", path.display()))?;
        tracing::info!(path = %path.display(), records = records.len(), "local vector index loaded");
        Ok(Self { records })
    }

    fn in_namespace(record: &LocalRecord, namespace: Option<&str>) -> bool {
        let have = record.namespace.as_deref().unwrap_or("");
        have == namespace.unwrap_or("")
    }
}

#[async_trait]
impl VectorBackend for LocalIndex {
    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<Match>> {
        let mut matches: Vec<Match> = self
            .records
            .iter()
            .filter(|r| Self::in_namespace(r, query.namespace))
            .map(|r| Match {
                id: r.id.clone(),
                score: Some(f64::from(cosine_similarity(query.vector, &r.values)))
                    .filter(|s| s.is_finite()),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
            })
            .filter(|m| query.filters.matches(m))
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(query.top_k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_index(records: Value) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", records).unwrap();
        f
    }

    #[test]
    fn test_pinecone_filter_shape() {
        assert!(pinecone_filter(&Filters::default()).is_none());
        let f = Filters {
            framework: Some("SOC2".into()),
            control_id: None,
            namespace: Some("ignored".into()),
        };
        assert_eq!(
            pinecone_filter(&f).unwrap(),
            json!({"framework": {"$eq": "SOC2"}})
        );
    }

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(base_url("idx.svc.pinecone.io"), "https://idx.svc.pinecone.io");
        assert_eq!(base_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_pinecone_match_moves_text_out_of_metadata() {
        let m: Match = PineconeMatch {
            id: "a".into(),
            score: Some(f64::NAN),
            metadata: Some(
                serde_json::from_value(json!({"text": "MFA required", "framework": "SOC2"}))
                    .unwrap(),
            ),
        }
        .into();
        assert_eq!(m.text, "MFA required");
        assert!(!m.metadata.contains_key("text"));
        assert_eq!(m.score, None);
    }

    #[tokio::test]
    async fn test_local_index_filters_orders_and_truncates() {
        let f = write_index(json!([
            {"id": "a", "text": "a", "metadata": {"framework": "SOC2"}, "values": [1.0, 0.0]},
            {"id": "b", "text": "b", "metadata": {"framework": "NIST80053"}, "values": [1.0, 0.0]},
            {"id": "c", "text": "c", "metadata": {"framework": "SOC2"}, "values": [0.6, 0.8]},
            {"id": "d", "text": "d", "metadata": {"framework": "SOC2"}, "values": [0.0, 1.0]},
            {"id": "e", "text": "e", "namespace": "other", "metadata": {"framework": "SOC2"}, "values": [1.0, 0.0]}
        ]));
        let index = LocalIndex::load(f.path()).unwrap();
        let filters = Filters {
            framework: Some("SOC2".into()),
            ..Default::default()
        };
        let out = index
            .query(&VectorQuery {
                vector: &[1.0, 0.0],
                top_k: 2,
                filters: &filters,
                namespace: None,
            })
            .await
            .unwrap();
        let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let other = index
            .query(&VectorQuery {
                vector: &[1.0, 0.0],
                top_k: 5,
                filters: &Filters::default(),
                namespace: Some("other"),
            })
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].id, "e");
    }

    #[test]
    fn test_local_index_missing_file() {
        assert!(LocalIndex::load(Path::new("/nonexistent/index.json")).is_err());
    }
}
