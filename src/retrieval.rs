//! Dual-mode retrieval adapter.
//!
//! [`Retriever::retrieve`] sends a query to exactly one backend, chosen by
//! its [`Mode`], and normalizes the answer into a [`RetrievalResult`]:
//!
//! | Mode | Backend calls | Result |
//! |------|---------------|--------|
//! | `vector` | embed query → similarity search | [`VectorAnswer`] ranked by score |
//! | `assistant` | chat | [`AssistantAnswer`] with one match per citation |
//!
//! Every backend call runs under the configured per-call timeout. Failures
//! are reported as [`KbError::BackendUnavailable`] or
//! [`KbError::BackendTimeout`]; the adapter never falls back to the other
//! mode on its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::assistant::{self, AssistantBackend, PineconeAssistant};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::KbError;
use crate::models::{Filters, Match, Mode, Query, RetrievalResult, VectorAnswer};
use crate::vector::{LocalIndex, PineconeIndex, VectorBackend, VectorQuery};

/// Vector search needs both an embedder and an index.
struct VectorSide {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorBackend>,
}

pub struct Retriever {
    top_k: usize,
    timeout_secs: u64,
    default_namespace: Option<String>,
    vector: Option<VectorSide>,
    assistant: Option<Arc<dyn AssistantBackend>>,
}

impl Retriever {
    /// A retriever with no backends attached.
    pub fn new(top_k: usize, timeout_secs: u64) -> Self {
        Self {
            top_k: top_k.max(1),
            timeout_secs,
            default_namespace: None,
            vector: None,
            assistant: None,
        }
    }

    pub fn with_vector(
        mut self,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorBackend>,
    ) -> Self {
        self.vector = Some(VectorSide { embedder, index });
        self
    }

    pub fn with_assistant(mut self, backend: Arc<dyn AssistantBackend>) -> Self {
        self.assistant = Some(backend);
        self
    }

    pub fn with_default_namespace(mut self, namespace: Option<String>) -> Self {
        self.default_namespace = namespace;
        self
    }

    /// Build the backends named in the configuration.
    pub fn from_config(config: &Config) -> Result<Self, KbError> {
        let timeout = config.retrieval.timeout_secs;
        let mut retriever = Retriever::new(config.retrieval.top_k, timeout);
        let configuration = |e: anyhow::Error| KbError::Configuration(format!("{:#}", e));

        if let Some(ref vector) = config.vector {
            let embedder: Arc<dyn EmbeddingProvider> =
                Arc::from(embedding::create_provider(config).map_err(configuration)?);
            let index: Arc<dyn VectorBackend> = match vector.backend.as_str() {
                "local" => {
                    let path = vector.local_index.as_deref().ok_or_else(|| {
                        KbError::Configuration("vector.local_index is required".into())
                    })?;
                    Arc::new(LocalIndex::load(path).map_err(configuration)?)
                }
                _ => {
                    let host = vector.index_host.as_deref().unwrap_or_default();
                    let key = config.credentials.pinecone_api_key.as_deref().unwrap_or_default();
                    Arc::new(PineconeIndex::new(host, key, timeout).map_err(configuration)?)
                }
            };
            retriever = retriever
                .with_vector(embedder, index)
                .with_default_namespace(vector.namespace.clone());
        }

        if let Some(ref assistant) = config.assistant {
            let key = config.credentials.pinecone_api_key.as_deref().unwrap_or_default();
            let backend = PineconeAssistant::new(assistant, key, timeout).map_err(configuration)?;
            retriever = retriever.with_assistant(Arc::new(backend));
        }

        Ok(retriever)
    }

    pub fn supports(&self, mode: Mode) -> bool {
        match mode {
            Mode::Vector => self.vector.is_some(),
            Mode::Assistant => self.assistant.is_some(),
        }
    }

    /// Run `query` against the backend its mode selects.
    pub async fn retrieve(&self, query: &Query) -> Result<RetrievalResult, KbError> {
        match query.mode {
            Mode::Vector => self.retrieve_vector(&query.text, &query.filters).await,
            Mode::Assistant => self.retrieve_assistant(&query.text, &query.filters).await,
        }
    }

    async fn retrieve_vector(
        &self,
        text: &str,
        filters: &Filters,
    ) -> Result<RetrievalResult, KbError> {
        let side = self.vector.as_ref().ok_or_else(|| {
            KbError::Configuration("vector mode requested but no [vector] backend is configured".into())
        })?;

        let vector = self
            .bounded(Mode::Vector, embedding::embed_query(side.embedder.as_ref(), text))
            .await?;

        let namespace = filters
            .namespace
            .as_deref()
            .or(self.default_namespace.as_deref());
        let request = VectorQuery {
            vector: &vector,
            top_k: self.top_k,
            filters,
            namespace,
        };
        let matches = self
            .bounded(Mode::Vector, side.index.query(&request))
            .await?;

        let returned = matches.len();
        let matches = rank(matches, filters, self.top_k);
        tracing::debug!(
            backend = side.index.name(),
            returned,
            kept = matches.len(),
            "vector search complete"
        );

        Ok(RetrievalResult::Vector(VectorAnswer { matches }))
    }

    async fn retrieve_assistant(
        &self,
        text: &str,
        filters: &Filters,
    ) -> Result<RetrievalResult, KbError> {
        let backend = self.assistant.as_ref().ok_or_else(|| {
            KbError::Configuration(
                "assistant mode requested but no [assistant] backend is configured".into(),
            )
        })?;

        let reply = self
            .bounded(Mode::Assistant, backend.ask(text, filters))
            .await?;
        let answer = assistant::normalize(reply);
        tracing::debug!(
            backend = backend.name(),
            citations = answer.matches.len(),
            "assistant answered"
        );
        Ok(RetrievalResult::Assistant(answer))
    }

    /// Await a backend call under the per-call timeout, classifying failures.
    async fn bounded<T>(
        &self,
        mode: Mode,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, KbError> {
        let timed_out = KbError::BackendTimeout {
            mode,
            timeout_secs: self.timeout_secs,
        };
        match tokio::time::timeout(Duration::from_secs(self.timeout_secs), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if is_client_timeout(&e) => Err(timed_out),
            Ok(Err(e)) => Err(KbError::unavailable(mode, e)),
            Err(_) => Err(timed_out),
        }
    }
}

/// The HTTP clients carry the same timeout and may trip it first.
fn is_client_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_timeout())
    })
}

/// Keep matches that satisfy `filters`, order by descending score, and cut
/// to `top_k`.
///
/// The sort is stable, so equal scores keep their backend order; unscored
/// matches sort last.
pub fn rank(mut matches: Vec<Match>, filters: &Filters, top_k: usize) -> Vec<Match> {
    matches.retain(|m| filters.matches(m));
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(top_k);
    matches
}
