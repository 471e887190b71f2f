//! Object storage client.
//!
//! Talks to S3 (or an S3-compatible service such as MinIO or LocalStack)
//! through its REST API with AWS Signature V4 authentication. Provides the
//! four operations the rest of the crate needs:
//!
//! | Operation | Used by |
//! |-----------|---------|
//! | [`S3Client::presign_get`] | evidence resolution (time-limited links) |
//! | [`S3Client::put_object`] | remote audit sink, audit log snapshots |
//! | [`S3Client::list_keys`] | recovering the chain head of a remote audit trail |
//! | [`S3Client::get_object`] | reading remote audit records back |
//!
//! Signing uses only pure-Rust dependencies (`hmac`, `sha2`), so there is no
//! C toolchain requirement.
//!
//! # Addressing
//!
//! Without `endpoint_url`, requests go to the virtual-hosted endpoint
//! `<bucket>.s3.<region>.amazonaws.com`. With a custom endpoint, path-style
//! addressing (`<endpoint>/<bucket>/<key>`) is used and the endpoint's scheme
//! is kept, so `http://localhost:4566` works.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::{AwsCredentials, Config, StorageConfig};

type HmacSha256 = Hmac<Sha256>;

/// Longest validity SigV4 allows for a presigned URL (7 days).
pub const MAX_PRESIGN_SECS: u64 = 604_800;

/// Signed client for one region and default bucket.
pub struct S3Client {
    bucket: String,
    region: String,
    endpoint: Option<Endpoint>,
    creds: AwsCredentials,
    http: reqwest::Client,
}

/// A parsed custom endpoint.
struct Endpoint {
    scheme: String,
    host: String,
}

/// Where a request for `(bucket, key)` goes.
struct Target {
    host: String,
    /// Already percent-encoded path, starting with `/`.
    canonical_uri: String,
    base_url: String,
}

impl S3Client {
    pub fn new(storage: &StorageConfig, creds: AwsCredentials, timeout_secs: u64) -> Result<Self> {
        let endpoint = storage.endpoint_url.as_deref().map(|url| {
            let (scheme, rest) = match url.split_once("://") {
                Some((s, r)) => (s.to_string(), r),
                None => ("https".to_string(), url),
            };
            Endpoint {
                scheme,
                host: rest.trim_end_matches('/').to_string(),
            }
        });

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            bucket: storage.bucket.clone(),
            region: storage.region.clone(),
            endpoint,
            creds,
            http,
        })
    }

    /// Client for the `[storage]` section, if one is configured and AWS
    /// credentials are present.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let (Some(storage), Some(creds)) = (&config.storage, &config.credentials.aws) else {
            return Ok(None);
        };
        Self::new(storage, creds.clone(), config.retrieval.timeout_secs).map(Some)
    }

    /// The default bucket this client writes to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn target(&self, bucket: &str, key: &str) -> Target {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match self.endpoint {
            Some(ref ep) => {
                let canonical_uri = if key.is_empty() {
                    format!("/{}", bucket)
                } else {
                    format!("/{}/{}", bucket, encoded_key)
                };
                Target {
                    host: ep.host.clone(),
                    base_url: format!("{}://{}{}", ep.scheme, ep.host, canonical_uri),
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                Target {
                    base_url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    // ============ Presigned URLs ============

    /// Build a presigned `GET` URL for `bucket/key`, valid for `ttl_secs`.
    ///
    /// Pure computation; no request is made.
    pub fn presign_get(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String> {
        self.presign_get_at(bucket, key, ttl_secs, Utc::now())
    }

    /// [`presign_get`](Self::presign_get) with an explicit signing time.
    pub fn presign_get_at(
        &self,
        bucket: &str,
        key: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if key.is_empty() {
            bail!("cannot presign an empty object key");
        }
        if ttl_secs == 0 || ttl_secs > MAX_PRESIGN_SECS {
            bail!(
                "presign expiry must be between 1 and {} seconds, got {}",
                MAX_PRESIGN_SECS,
                ttl_secs
            );
        }

        let target = self.target(bucket, key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.creds.access_key_id, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), ttl_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        let canonical_querystring = canonical_query(&params);

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            target.canonical_uri, canonical_querystring, target.host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        Ok(format!(
            "{}?{}&X-Amz-Signature={}",
            target.base_url, canonical_querystring, signature
        ))
    }

    // ============ Signed requests ============

    /// Compute SigV4 `Authorization` and `x-amz-*` headers for a request.
    fn signed_headers(
        &self,
        method: &str,
        target: &Target,
        query: &[(String, String)],
        payload_hash: &str,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            target.canonical_uri,
            canonical_query(query),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("Authorization".to_string(), authorization));
        out
    }

    /// Upload `body` to `key` in the default bucket.
    ///
    /// With `create_only`, the request carries `If-None-Match: *` and an
    /// existing object makes the call fail instead of being replaced.
    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        create_only: bool,
    ) -> Result<()> {
        let target = self.target(&self.bucket, key);
        let payload_hash = hex_sha256(&body);

        let mut req = self
            .http
            .put(&target.base_url)
            .header("Content-Type", content_type);
        for (k, v) in self.signed_headers("PUT", &target, &[], &payload_hash) {
            req = req.header(k, v);
        }
        if create_only {
            req = req.header("If-None-Match", "*");
        }

        let resp = req
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.bucket, key))?;

        let status = resp.status();
        if status.as_u16() == 412 {
            bail!("s3://{}/{} already exists", self.bucket, key);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                text.chars().take(300).collect::<String>()
            );
        }
        Ok(())
    }

    /// Download an object from the default bucket.
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let target = self.target(&self.bucket, key);
        let payload_hash = hex_sha256(b"");

        let mut req = self.http.get(&target.base_url);
        for (k, v) in self.signed_headers("GET", &target, &[], &payload_hash) {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.bucket, key))?;

        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// List every key under `prefix` in the default bucket, in S3's
    /// lexicographic order.
    ///
    /// Follows `NextContinuationToken` until the listing is complete.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let target = self.target(&self.bucket, "");
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let payload_hash = hex_sha256(b"");
            let url = format!("{}?{}", target.base_url, canonical_query(&query));
            let mut req = self.http.get(&url);
            for (k, v) in self.signed_headers("GET", &target, &query, &payload_hash) {
                req = req.header(k, v);
            }

            let resp = req.send().await.with_context(|| {
                format!("Failed to list s3://{}/{}", self.bucket, prefix)
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(300).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }
}

/// Split `s3://bucket/key` into its parts.
pub fn parse_s3_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

// ============ AWS SigV4 Helpers ============

/// Sorted, percent-encoded query string.
fn canonical_query(params: &[(String, String)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing (minimal) ============

/// Pull `<Key>` values, the truncation flag, and the continuation token out
/// of a `ListObjectsV2` response. Folder markers (keys ending in `/`) are
/// skipped.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(unescape_xml(&key));
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client(endpoint: Option<&str>) -> S3Client {
        let storage = StorageConfig {
            bucket: "ai-gov-audits".into(),
            region: "us-east-1".into(),
            endpoint_url: endpoint.map(str::to_string),
        };
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        };
        S3Client::new(&storage, creds, 5).unwrap()
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_presign_is_deterministic_for_fixed_time() {
        let c = client(None);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = c.presign_get_at("evidence", "soc2/cc6.6 mfa.pdf", 900, now).unwrap();
        let b = c.presign_get_at("evidence", "soc2/cc6.6 mfa.pdf", 900, now).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("https://evidence.s3.us-east-1.amazonaws.com/soc2/cc6.6%20mfa.pdf?"));
        assert!(a.contains("X-Amz-Expires=900"));
        assert!(a.contains("X-Amz-Date=20240501T120000Z"));
        let sig = a.rsplit("X-Amz-Signature=").next().unwrap();
        assert_eq!(sig.len(), 64);

        let other = c.presign_get_at("evidence", "soc2/other.pdf", 900, now).unwrap();
        assert_ne!(
            other.rsplit("X-Amz-Signature=").next().unwrap(),
            sig
        );
    }

    #[test]
    fn test_presign_path_style_for_custom_endpoint() {
        let c = client(Some("http://localhost:4566/"));
        let url = c.presign_get("evidence", "a/b.pdf", 60).unwrap();
        assert!(url.starts_with("http://localhost:4566/evidence/a/b.pdf?"));
    }

    #[test]
    fn test_presign_rejects_bad_expiry_and_key() {
        let c = client(None);
        assert!(c.presign_get("b", "k", 0).is_err());
        assert!(c.presign_get("b", "k", MAX_PRESIGN_SECS + 1).is_err());
        assert!(c.presign_get("b", "", 60).is_err());
    }

    #[test]
    fn test_parse_s3_uri() {
        assert_eq!(parse_s3_uri("s3://bucket/a/b.pdf"), Some(("bucket", "a/b.pdf")));
        assert_eq!(parse_s3_uri("s3://bucket/"), None);
        assert_eq!(parse_s3_uri("https://x/y"), None);
    }

    #[test]
    fn test_parse_list_objects_response() {
        let xml = r#"<ListBucketResult>
<IsTruncated>true</IsTruncated>
<NextContinuationToken>tok</NextContinuationToken>
<Contents><Key>audit_records/</Key></Contents>
<Contents><Key>audit_records/0001-a.jsonl</Key><Size>10</Size></Contents>
<Contents><Key>audit_records/0002-b&amp;c.jsonl</Key></Contents>
</ListBucketResult>"#;
        let (keys, truncated, token) = parse_list_objects_response(xml);
        assert_eq!(
            keys,
            vec!["audit_records/0001-a.jsonl", "audit_records/0002-b&c.jsonl"]
        );
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_canonical_query_sorted_and_encoded() {
        let q = canonical_query(&[
            ("prefix".into(), "audit records/".into()),
            ("list-type".into(), "2".into()),
        ]);
        assert_eq!(q, "list-type=2&prefix=audit%20records%2F");
    }
}
