//! Error taxonomy for the query pipeline.
//!
//! Application glue (CLI commands, file loading) uses `anyhow` like the rest
//! of the crate. The four failure classes below are the ones callers must be
//! able to tell apart, so they get a typed enum.

use crate::models::Mode;

/// Typed failures surfaced by the retrieval adapter, audit sink, and
/// configuration loader.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// The selected backend could not be reached, rejected our credentials,
    /// or answered with an error status.
    #[error("{mode} backend unavailable: {cause}")]
    BackendUnavailable {
        /// Mode whose backend failed.
        mode: Mode,
        /// Rendered cause chain from the underlying client.
        cause: String,
    },

    /// The backend call did not complete within the per-call timeout.
    #[error("{mode} backend timed out after {timeout_secs}s")]
    BackendTimeout {
        /// Mode whose backend timed out.
        mode: Mode,
        /// Configured per-call timeout.
        timeout_secs: u64,
    },

    /// The audit record could not be written to its destination.
    #[error("audit record not persisted: {0}")]
    PersistenceFailure(String),

    /// Required configuration (endpoint, credential, file) is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KbError {
    /// Builds a [`KbError::BackendUnavailable`] from any client error,
    /// keeping the full `anyhow` context chain in the message.
    pub fn unavailable(mode: Mode, err: anyhow::Error) -> Self {
        KbError::BackendUnavailable {
            mode,
            cause: format!("{:#}", err),
        }
    }

    /// Short machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::BackendUnavailable { .. } => "backend_unavailable",
            KbError::BackendTimeout { .. } => "backend_timeout",
            KbError::PersistenceFailure(_) => "persistence_failure",
            KbError::Configuration(_) => "not_configured",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("POST /query");
        let kb = KbError::unavailable(Mode::Vector, err);
        let msg = kb.to_string();
        assert!(msg.starts_with("vector backend unavailable"));
        assert!(msg.contains("POST /query"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_codes() {
        let timeout = KbError::BackendTimeout {
            mode: Mode::Assistant,
            timeout_secs: 5,
        };
        assert_eq!(timeout.code(), "backend_timeout");
        assert_eq!(timeout.to_string(), "assistant backend timed out after 5s");
        assert_eq!(
            KbError::Configuration("x".into()).code(),
            "not_configured"
        );
    }
}
