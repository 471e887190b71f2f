//! Evidence resolution.
//!
//! Controls and policies point at stored proof artifacts through evidence
//! keys. The evidence map, loaded once at startup, says where each key
//! lives:
//!
//! ```json
//! {
//!   "evidence": {
//!     "soc2/cc6.1/mfa-enforcement.png": "s3://ai-gov-evidence/soc2/cc6.1/mfa-enforcement.png",
//!     "nist/ia-2/idp-config.json": "https://grc.example.com/artifacts/{key}",
//!     "pol-7/signed-policy.pdf": "file:///srv/evidence/pol-7/signed-policy.pdf"
//!   },
//!   "controls": {
//!     "SOC2:CC6.1": ["soc2/cc6.1/mfa-enforcement.png"],
//!     "NIST80053:IA-2": ["nist/ia-2/idp-config.json"]
//!   }
//! }
//! ```
//!
//! `s3://` locations become presigned GET links, `{key}` templates are
//! filled in, and anything else is returned as written. Resolution is
//! always partial: unknown keys and per-key signing failures are dropped
//! without affecting the other keys.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::models::{EvidenceRefs, Match};
use crate::s3::{parse_s3_uri, S3Client};

/// Static key → location table plus the control → keys fallback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvidenceMap {
    #[serde(default)]
    pub evidence: BTreeMap<String, String>,
    #[serde(default)]
    pub controls: BTreeMap<String, Vec<String>>,
}

impl EvidenceMap {
    /// Load the map from JSON. A missing file yields an empty map.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "evidence map not found; evidence links disabled");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read evidence map: {}", path.display()))?;
        let map: EvidenceMap = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse evidence map: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            keys = map.evidence.len(),
            controls = map.controls.len(),
            "evidence map loaded"
        );
        Ok(map)
    }
}

/// Produces time-limited URLs for stored objects.
pub trait UrlSigner: Send + Sync {
    fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String>;
}

impl UrlSigner for S3Client {
    fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String> {
        self.presign_get(bucket, key, ttl_secs)
    }
}

pub struct EvidenceResolver {
    map: EvidenceMap,
    signer: Option<Arc<dyn UrlSigner>>,
    ttl_secs: u64,
}

impl EvidenceResolver {
    pub fn new(map: EvidenceMap, signer: Option<Arc<dyn UrlSigner>>, ttl_secs: u64) -> Self {
        Self {
            map,
            signer,
            ttl_secs,
        }
    }

    /// Every key the map can resolve, sorted.
    pub fn known_keys(&self) -> Vec<&str> {
        self.map.evidence.keys().map(String::as_str).collect()
    }

    /// Gather the evidence keys referenced by a set of matches.
    ///
    /// A match's own `evidence_keys` metadata wins; when it has none, the
    /// map's `controls` table is consulted under the match's control label
    /// (e.g. `SOC2:CC6.1`).
    pub fn collect_keys(&self, matches: &[Match]) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for m in matches {
            let own = m.evidence_keys();
            if !own.is_empty() {
                keys.extend(own);
                continue;
            }
            if let Some(mapped) = self.map.controls.get(&m.control_label()) {
                keys.extend(mapped.iter().cloned());
            }
        }
        keys
    }

    /// Resolve each key to a URI. Keys without a usable location are
    /// omitted.
    pub fn resolve(&self, keys: &BTreeSet<String>) -> EvidenceRefs {
        let mut out = EvidenceRefs::new();
        for key in keys {
            let Some(location) = self.map.evidence.get(key) else {
                tracing::debug!(key = %key, "no evidence map entry");
                continue;
            };
            match self.resolve_location(key, location) {
                Ok(uri) => {
                    out.insert(key.clone(), uri);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %format!("{:#}", e), "evidence link not generated");
                }
            }
        }
        out
    }

    fn resolve_location(&self, key: &str, location: &str) -> Result<String> {
        if let Some((bucket, object_key)) = parse_s3_uri(location) {
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no object storage credentials to presign {}", location))?;
            return signer.presign(bucket, object_key, self.ttl_secs);
        }
        if location.contains("{key}") {
            return Ok(location.replace("{key}", key));
        }
        Ok(location.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeSigner;

    impl UrlSigner for FakeSigner {
        fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String> {
            if key.contains("broken") {
                anyhow::bail!("signing failed");
            }
            Ok(format!("https://{}.signed/{}?ttl={}", bucket, key, ttl_secs))
        }
    }

    fn map() -> EvidenceMap {
        serde_json::from_value(json!({
            "evidence": {
                "mfa.png": "s3://ev/soc2/mfa.png",
                "broken.pdf": "s3://ev/broken.pdf",
                "idp.json": "https://grc.example.com/a/{key}",
                "policy.pdf": "file:///srv/policy.pdf"
            },
            "controls": {
                "SOC2:CC6.1": ["mfa.png", "unknown.txt"]
            }
        }))
        .unwrap()
    }

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_kinds() {
        let r = EvidenceResolver::new(map(), Some(Arc::new(FakeSigner)), 600);
        let out = r.resolve(&keys(&["mfa.png", "idp.json", "policy.pdf"]));
        assert_eq!(out["mfa.png"], "https://ev.signed/soc2/mfa.png?ttl=600");
        assert_eq!(out["idp.json"], "https://grc.example.com/a/idp.json");
        assert_eq!(out["policy.pdf"], "file:///srv/policy.pdf");
    }

    #[test]
    fn test_resolve_is_subset_of_input_and_map() {
        let r = EvidenceResolver::new(map(), Some(Arc::new(FakeSigner)), 600);
        let input = keys(&["mfa.png", "broken.pdf", "missing.doc", "policy.pdf"]);
        let out = r.resolve(&input);
        for k in out.keys() {
            assert!(input.contains(k));
            assert!(r.known_keys().contains(&k.as_str()));
        }
        assert!(!out.contains_key("broken.pdf"));
        assert!(!out.contains_key("missing.doc"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_s3_locations_dropped_without_signer() {
        let r = EvidenceResolver::new(map(), None, 600);
        let out = r.resolve(&keys(&["mfa.png", "policy.pdf"]));
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("policy.pdf"));
    }

    #[test]
    fn test_collect_keys_prefers_metadata_then_controls() {
        let r = EvidenceResolver::new(map(), None, 600);
        let with_keys = Match {
            id: "1".into(),
            score: Some(0.9),
            text: String::new(),
            metadata: serde_json::from_value(json!({
                "framework": "SOC2", "control_id": "CC6.1", "evidence_keys": ["idp.json"]
            }))
            .unwrap(),
        };
        let without = Match {
            id: "2".into(),
            score: Some(0.8),
            text: String::new(),
            metadata: serde_json::from_value(json!({"framework": "SOC2", "control_id": "CC6.1"}))
                .unwrap(),
        };
        assert_eq!(r.collect_keys(&[with_keys.clone()]), keys(&["idp.json"]));
        assert_eq!(
            r.collect_keys(&[with_keys, without]),
            keys(&["idp.json", "mfa.png", "unknown.txt"])
        );
    }

    #[test]
    fn test_missing_map_file_is_empty() {
        let map = EvidenceMap::load(Path::new("/nonexistent/evidence_map.json")).unwrap();
        assert!(map.evidence.is_empty());
    }
}
