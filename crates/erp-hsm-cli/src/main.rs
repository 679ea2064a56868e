//! erp-hsm CLI - operator tool for the HSM session pool and blob store

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use erp_hsm_core::config::{BlobStoreBackend, Config};
use erp_hsm_core::context::HsmServiceContext;
use erp_hsm_core::hsm::{
    BlobEntry, BlobStore, BlobType, IdentityKind, IdentityResolver, InMemoryBlobStore,
    SimulatedHsmClient, SqliteBlobStore,
};
use erp_hsm_core::jobs::NullTrustStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "erp-hsm")]
#[command(author, version, about = "HSM session pool and blob store operations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service and run until Ctrl-C
    Run {
        /// Use the built-in simulated HSM
        #[arg(long)]
        simulated: bool,
        /// Sessions to open before serving
        #[arg(long, default_value_t = 0)]
        prewarm: usize,
    },

    /// Inspect and maintain stored blobs
    Blobs {
        #[command(subcommand)]
        action: BlobAction,
    },

    /// Inspect HSM identities
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BlobAction {
    /// List all blobs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check that each type has a currently valid blob
    Check {
        #[arg(required = true)]
        types: Vec<BlobType>,
    },
    /// Delete a blob by name
    Delete { blob_type: BlobType, name: String },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the resolved identity; secrets are never printed
    Show { kind: IdentityKind },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective configuration
    Show,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("erp_hsm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { simulated, prewarm } => cmd_run(simulated, prewarm, cli.quiet).await,
        Commands::Blobs { action } => cmd_blobs(action, cli.quiet).await,
        Commands::Identity { action } => cmd_identity(action),
        Commands::Config { action } => cmd_config(action),
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.blob_store.backend {
        BlobStoreBackend::Memory => Ok(Arc::new(InMemoryBlobStore::new())),
        BlobStoreBackend::Sqlite => {
            let path = config.blob_store_path()?;
            let store = SqliteBlobStore::open(&path)
                .await
                .with_context(|| format!("Failed to open blob store {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

async fn cmd_run(simulated: bool, prewarm: usize, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    if !simulated && config.hsm.device != "simulated" {
        bail!(
            "No vendor HSM client is linked into this binary; use --simulated or set hsm.device = \"simulated\""
        );
    }

    let store = open_store(&config).await?;
    let client = Arc::new(SimulatedHsmClient::new());
    let context = HsmServiceContext::start(config, client, store, Arc::new(NullTrustStore)).await?;

    if prewarm > 0 {
        if let Err(e) = context.pool().prewarm(prewarm).await {
            warn!(error = %e, "Prewarming the pool failed");
        }
    }

    if !quiet {
        println!(
            "erp-hsm running with {} session slot(s); press Ctrl-C to stop",
            context.pool().options().max_sessions
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let pool = context.pool().clone();
    let jobs: Vec<(String, u64)> = context
        .jobs()
        .iter()
        .map(|job| (job.name().to_string(), job.cycles()))
        .collect();
    context.shutdown().await?;

    if !quiet {
        println!("Stopped. Peak concurrent sessions: {}", pool.max_used_count());
        for (name, cycles) in jobs {
            println!("  {:<24} {} cycle(s)", name, cycles);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct BlobRow {
    blob_type: BlobType,
    id: u32,
    name: String,
    generation: u32,
    fingerprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    valid: bool,
}

impl BlobRow {
    fn new(entry: &BlobEntry, now: DateTime<Utc>) -> Self {
        Self {
            blob_type: entry.blob_type,
            id: entry.id.0,
            name: entry.name.clone(),
            generation: entry.generation,
            fingerprint: entry.fingerprint(),
            not_before: entry.validity.not_before(),
            not_after: entry.validity.not_after(),
            valid: entry.is_valid_at(now),
        }
    }
}

async fn cmd_blobs(action: BlobAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    if config.blob_store.backend == BlobStoreBackend::Memory {
        warn!("Blob store backend is 'memory'; nothing persists between runs");
    }
    let store = open_store(&config).await?;
    let now = Utc::now();

    match action {
        BlobAction::List { json } => {
            let rows: Vec<BlobRow> = store
                .all_sorted_by_id()
                .await?
                .iter()
                .map(|entry| BlobRow::new(entry, now))
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                if !quiet {
                    println!("No blobs stored.");
                }
            } else {
                println!(
                    "{:<30} {:>4} {:<40} {:>4} {:<16} {:<20} VALID",
                    "TYPE", "ID", "NAME", "GEN", "FINGERPRINT", "NOT AFTER"
                );
                for row in rows {
                    println!(
                        "{:<30} {:>4} {:<40} {:>4} {:<16} {:<20} {}",
                        row.blob_type.as_str(),
                        row.id,
                        row.name,
                        row.generation,
                        row.fingerprint,
                        row.not_after.format("%Y-%m-%d %H:%M:%S"),
                        if row.valid { "yes" } else { "no" }
                    );
                }
            }
        }
        BlobAction::Check { types } => {
            let flags = store.has_valid_of_type(&types, now).await?;
            let mut missing = 0;
            for (blob_type, valid) in types.iter().zip(flags) {
                if !valid {
                    missing += 1;
                }
                if !quiet || !valid {
                    println!("{:<30} {}", blob_type.as_str(), if valid { "valid" } else { "MISSING" });
                }
            }
            if missing > 0 {
                bail!("{} blob type(s) have no valid blob", missing);
            }
        }
        BlobAction::Delete { blob_type, name } => {
            store.delete(blob_type, &name).await?;
            if !quiet {
                println!("Deleted {} '{}'", blob_type, name);
            }
        }
    }
    Ok(())
}

fn cmd_identity(action: IdentityAction) -> anyhow::Result<()> {
    match action {
        IdentityAction::Show { kind } => {
            let config = Config::load()?;
            let identity = IdentityResolver::new(config).resolve(kind);

            println!("{}", identity.display_name());
            println!("  username: {}", identity.username);
            println!(
                "  password: {}",
                if identity.password.is_empty() { "(not set)" } else { "(set)" }
            );
            println!(
                "  keyspec:  {}",
                if identity.keyspec.is_some() { "(set, preferred)" } else { "(not set)" }
            );
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            for (key, value) in config.list() {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
