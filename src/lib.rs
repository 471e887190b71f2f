//! # govkb
//!
//! Compliance knowledge-base front end. Answers questions about controls and
//! policies from one of two retrieval backends, attaches links to the stored
//! proof artifacts, and writes a tamper-evident audit record for every
//! answer.
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────┐   ┌──────────────┐   ┌────────────┐
//! query ──────▶│ Guardrails │──▶│  Retriever   │──▶│  Evidence  │
//!              │  (redact)  │   │ vector|asst. │   │  resolver  │
//!              └────────────┘   └──────────────┘   └─────┬──────┘
//!                                                        ▼
//!                               ┌──────────────┐   ┌────────────┐
//!                               │  Audit sink  │◀──│ Audit trail│
//!                               │  file | s3   │   │ (SHA-256)  │
//!                               └──────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment credentials |
//! | [`error`] | Typed failure classes |
//! | [`models`] | Queries, matches, retrieval results |
//! | [`guardrails`] | PII redaction and prompt-injection detection |
//! | [`embedding`] | Query embedding providers |
//! | [`vector`] | Vector index backends (Pinecone, local file) |
//! | [`assistant`] | Hosted assistant backend and citation normalization |
//! | [`retrieval`] | Dual-mode retrieval adapter |
//! | [`evidence`] | Evidence key collection and link resolution |
//! | [`s3`] | SigV4 object storage client and presigned URLs |
//! | [`answer`] | Grounded answer text and confidence |
//! | [`audit`] | Audit records, canonical hashing, chain verification |
//! | [`sink`] | Append-only audit destinations |
//! | [`trail`] | Serialized chain head and appends |
//! | [`governance`] | Region and model allow-lists |
//! | [`pipeline`] | One query end to end |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod assistant;
pub mod audit;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evidence;
pub mod governance;
pub mod guardrails;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod s3;
pub mod server;
pub mod sink;
pub mod trail;
pub mod vector;
