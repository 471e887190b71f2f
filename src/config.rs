//! TOML configuration and environment credentials.
//!
//! Non-secret settings live in the config file (default `./config/govkb.toml`).
//! Credentials are read from the environment once, after `.env` loading, and
//! folded into the same immutable [`Config`]. Everything is validated before
//! the first query; a missing endpoint or credential is a
//! [`KbError::Configuration`].
//!
//! ```toml
//! [retrieval]
//! default_mode = "vector"
//! top_k = 5
//! timeout_secs = 20
//!
//! [vector]
//! backend = "pinecone"
//! index_host = "compliance-abc123.svc.us-east-1.pinecone.io"
//! namespace = "controls"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [assistant]
//! host = "prod-1-data.ke.pinecone.io"
//! name = "compliance-assistant"
//!
//! [storage]
//! bucket = "ai-gov-audits"
//! region = "us-east-1"
//!
//! [audit]
//! destination = "file"
//! path = "audits/audit_log.jsonl"
//! chain = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::KbError;
use crate::models::Mode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub vector: Option<VectorConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub assistant: Option<AssistantConfig>,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Secrets from the environment; never read from the file.
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            top_k: default_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_mode() -> Mode {
    Mode::Vector
}
fn default_top_k() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `pinecone` or `local`.
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    /// Pinecone index host, with or without scheme.
    #[serde(default)]
    pub index_host: Option<String>,
    /// Default namespace when the query does not name one.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Path to the pre-embedded chunk file for the `local` backend.
    #[serde(default)]
    pub local_index: Option<PathBuf>,
}

fn default_vector_backend() -> String {
    "pinecone".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_embedding_url(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_max_retries() -> u32 {
    3
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    /// Assistant data-plane host, with or without scheme.
    pub host: String,
    /// Assistant name as created in the console.
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvidenceConfig {
    #[serde(default = "default_evidence_map")]
    pub map_path: PathBuf,
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            map_path: default_evidence_map(),
            presign_ttl_secs: default_presign_ttl(),
        }
    }
}

fn default_evidence_map() -> PathBuf {
    PathBuf::from("data/evidence_map.json")
}
fn default_presign_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// `file` or `s3`.
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    /// Object key prefix for the `s3` destination.
    #[serde(default = "default_audit_prefix")]
    pub prefix: String,
    #[serde(default = "default_chain")]
    pub chain: bool,
    /// Recorded in each audit entry as the answering model.
    #[serde(default = "default_model_label")]
    pub model_label: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            path: default_audit_path(),
            prefix: default_audit_prefix(),
            chain: default_chain(),
            model_label: default_model_label(),
        }
    }
}

fn default_destination() -> String {
    "file".to_string()
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("audits/audit_log.jsonl")
}
fn default_audit_prefix() -> String {
    "audit_records/".to_string()
}
fn default_chain() -> bool {
    true
}
fn default_model_label() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GuardrailsConfig {
    #[serde(default)]
    pub pii_patterns: Vec<PiiPattern>,
    /// Case-insensitive phrases that mark a query as a likely injection.
    #[serde(default)]
    pub deny_if_contains: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PiiPattern {
    pub name: String,
    pub regex: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub allow_regions: Vec<String>,
    #[serde(default)]
    pub allow_models: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

/// Secrets read from the process environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub pinecone_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub aws: Option<AwsCredentials>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("pinecone_api_key", &self.pinecone_api_key.as_ref().map(|_| "***"))
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("aws", &self.aws.as_ref().map(|_| "***"))
            .finish()
    }
}

/// AWS credentials for SigV4 signing.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    /// Read `PINECONE_API_KEY`, `OPENAI_API_KEY`, and the `AWS_*` triple.
    ///
    /// Empty values count as unset.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let aws = match (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };
        Self {
            pinecone_api_key: var("PINECONE_API_KEY"),
            openai_api_key: var("OPENAI_API_KEY"),
            aws,
        }
    }
}

impl Config {
    /// A config with every section defaulted and no backends.
    pub fn minimal() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            vector: None,
            embedding: EmbeddingConfig::default(),
            assistant: None,
            evidence: EvidenceConfig::default(),
            storage: None,
            audit: AuditConfig::default(),
            guardrails: GuardrailsConfig::default(),
            governance: GovernanceConfig::default(),
            server: ServerConfig::default(),
            credentials: Credentials::default(),
        }
    }

    /// Whether a query in `mode` can be served with this configuration.
    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::Vector => self.vector.is_some(),
            Mode::Assistant => self.assistant.is_some(),
        }
    }
}

/// Load `.env`, read the config file, attach environment credentials, and
/// validate.
pub fn load_config(path: &Path) -> Result<Config, KbError> {
    dotenvy::dotenv().ok();

    let content = std::fs::read_to_string(path).map_err(|e| {
        KbError::Configuration(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config = parse_config(&content, Credentials::from_env())?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse and validate config text with explicitly supplied credentials.
pub fn parse_config(content: &str, credentials: Credentials) -> Result<Config, KbError> {
    let mut config: Config = toml::from_str(content)
        .map_err(|e| KbError::Configuration(format!("Failed to parse config file: {}", e)))?;
    config.credentials = credentials;
    validate(&config)?;
    Ok(config)
}

fn bail(msg: impl Into<String>) -> Result<(), KbError> {
    Err(KbError::Configuration(msg.into()))
}

fn validate(config: &Config) -> Result<(), KbError> {
    let creds = &config.credentials;

    if config.retrieval.top_k == 0 {
        return bail("retrieval.top_k must be >= 1");
    }
    if config.retrieval.timeout_secs == 0 {
        return bail("retrieval.timeout_secs must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                return bail("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                return bail("embedding.dims must be > 0 when provider is 'openai'");
            }
            if creds.openai_api_key.is_none() {
                return bail("OPENAI_API_KEY environment variable not set");
            }
        }
        other => {
            return bail(format!(
                "Unknown embedding provider: '{}'. Must be disabled or openai.",
                other
            ))
        }
    }

    if let Some(ref vector) = config.vector {
        if !config.embedding.is_enabled() {
            return bail("[vector] requires an [embedding] provider to embed queries");
        }
        match vector.backend.as_str() {
            "pinecone" => {
                if vector.index_host.as_deref().map_or(true, str::is_empty) {
                    return bail("vector.index_host is required for the pinecone backend");
                }
                if creds.pinecone_api_key.is_none() {
                    return bail("PINECONE_API_KEY environment variable not set");
                }
            }
            "local" => {
                if vector.local_index.is_none() {
                    return bail("vector.local_index is required for the local backend");
                }
            }
            other => {
                return bail(format!(
                    "Unknown vector backend: '{}'. Must be pinecone or local.",
                    other
                ))
            }
        }
    }

    if let Some(ref assistant) = config.assistant {
        if assistant.host.is_empty() || assistant.name.is_empty() {
            return bail("assistant.host and assistant.name must not be empty");
        }
        if creds.pinecone_api_key.is_none() {
            return bail("PINECONE_API_KEY environment variable not set");
        }
    }

    if let Some(ref storage) = config.storage {
        if storage.bucket.is_empty() {
            return bail("storage.bucket must not be empty");
        }
    }

    // A config with no backends at all is still valid for audit-only commands.
    let any_backend = config.vector.is_some() || config.assistant.is_some();
    if any_backend && !config.supports(config.retrieval.default_mode) {
        return bail(format!(
            "retrieval.default_mode is '{}' but that backend is not configured",
            config.retrieval.default_mode
        ));
    }

    match config.audit.destination.as_str() {
        "file" => {}
        "s3" => {
            if config.storage.is_none() {
                return bail("audit.destination = 's3' requires a [storage] section");
            }
            if creds.aws.is_none() {
                return bail("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set for the s3 audit destination");
            }
        }
        other => {
            return bail(format!(
                "Unknown audit destination: '{}'. Must be file or s3.",
                other
            ))
        }
    }

    for pattern in &config.guardrails.pii_patterns {
        if let Err(e) = regex::Regex::new(&pattern.regex) {
            return bail(format!("guardrails pattern '{}' is invalid: {}", pattern.name, e));
        }
    }

    Ok(())
}
