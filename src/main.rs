//! # govkb CLI
//!
//! Compliance knowledge-base front end: ask questions against the control
//! index or the assistant, resolve evidence links, and verify the
//! hash-chained audit log.
//!
//! ## Usage
//!
//! ```bash
//! govkb --config ./config/govkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `govkb ask "<query>"` | Answer a query with evidence and an audit record |
//! | `govkb verify` | Re-hash the audit log and check every link |
//! | `govkb snapshot` | Upload the local audit log to object storage |
//! | `govkb evidence [KEY...]` | Resolve evidence keys, or list the known ones |
//! | `govkb check` | Summarize configuration and run governance checks |
//! | `govkb serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! govkb ask "Which control covers Multifactor Authentication?" --framework NIST80053
//! govkb ask "Who approves access reviews?" --mode assistant --json
//! govkb verify --path audits/audit_log.jsonl
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use govkb::commands;
use govkb::config;
use govkb::models::{Filters, Mode};
use govkb::server;

/// govkb: grounded compliance answers with tamper-evident audit records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/govkb.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "govkb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/govkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a compliance question.
    ///
    /// The query is redacted, sent to the selected backend, enriched with
    /// evidence links, and recorded in the audit log.
    Ask {
        /// The question.
        query: String,

        /// Retrieval mode: `vector` or `assistant`. Defaults to
        /// `retrieval.default_mode`.
        #[arg(long)]
        mode: Option<Mode>,

        /// Only controls from this framework (e.g. `SOC2`, `NIST80053`).
        #[arg(long)]
        framework: Option<String>,

        /// Only this control id (e.g. `CC6.1`).
        #[arg(long)]
        control_id: Option<String>,

        /// Index namespace to search.
        #[arg(long)]
        namespace: Option<String>,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Verify the audit log hash chain.
    Verify {
        /// Verify this JSONL file instead of the configured sink.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Upload the local audit log to the storage bucket.
    Snapshot,

    /// Resolve evidence keys to links. Lists every known key when none are
    /// given.
    Evidence {
        keys: Vec<String>,
    },

    /// Validate configuration and run governance checks.
    Check,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn init_tracing() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("govkb=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    // Verifying an explicit file needs no configuration.
    if let Commands::Verify { path: Some(ref path) } = cli.command {
        if !cli.config.exists() {
            let cfg = config::Config::minimal();
            return commands::run_verify(&cfg, Some(path)).await;
        }
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ask {
            query,
            mode,
            framework,
            control_id,
            namespace,
            json,
        } => {
            let filters = Filters {
                framework,
                control_id,
                namespace,
            };
            commands::run_ask(&cfg, &query, mode, filters, json).await?;
        }
        Commands::Verify { path } => {
            commands::run_verify(&cfg, path.as_deref()).await?;
        }
        Commands::Snapshot => {
            commands::run_snapshot(&cfg).await?;
        }
        Commands::Evidence { keys } => {
            commands::run_evidence(&cfg, &keys)?;
        }
        Commands::Check => {
            commands::run_check(&cfg)?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
