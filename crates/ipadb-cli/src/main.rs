use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ipadb_adapters::FixtureFeedAdapter;
use ipadb_core::keys::NewKeyRequest;
use ipadb_sync::keys::KeyLedger;
use ipadb_sync::{build_store, run_sync_once_from_env, SyncConfig, SyncPipeline, SyncWindow};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ipadb-cli")]
#[command(about = "IPA catalog mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle against the configured store.
    Sync {
        /// Only listings released in the last N hours.
        #[arg(long, conflicts_with = "window")]
        hours: Option<u32>,
        /// `today`, `full` or `<N>h`.
        #[arg(long)]
        window: Option<String>,
        /// Read the feed document from a file instead of the network.
        #[arg(long)]
        feed_file: Option<PathBuf>,
    },
    /// Serve the HTTP API (and the scheduler when enabled).
    Serve,
    /// Manage license keys.
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Debug, Subcommand)]
enum KeyCommands {
    Create {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        uses: Option<u32>,
        #[arg(long)]
        notes: Option<String>,
    },
    List,
    Verify { key: String },
    Delete { key: String },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        hours: None,
        window: None,
        feed_file: None,
    }) {
        Commands::Sync {
            hours,
            window,
            feed_file,
        } => {
            let window = SyncWindow::from_request(hours, window.as_deref())
                .map_err(anyhow::Error::msg)?;
            let report = match feed_file {
                Some(path) => {
                    let config = SyncConfig::from_env()?;
                    let store = build_store(&config)?;
                    let feed = Box::new(FixtureFeedAdapter::from_path(&path)?);
                    SyncPipeline::new(config, feed, store)?
                        .run_with_conflict_retry(window)
                        .await?
                }
                None => run_sync_once_from_env(window).await?,
            };
            println!(
                "sync complete: run_id={} window={} new={} version_updates={} duplicates={} skipped={} total={} written={}",
                report.run_id,
                report.window,
                report.new,
                report.version_updates,
                report.duplicates,
                report.skipped,
                report.total_after,
                report.written
            );
        }
        Commands::Serve => ipadb_web::serve_from_env().await?,
        Commands::Keys { command } => {
            let config = SyncConfig::from_env()?;
            let ledger = KeyLedger::new(build_store(&config)?, config.keys_path.clone());
            let now = Utc::now();
            let output = match command {
                KeyCommands::Create { days, uses, notes } => {
                    let request = NewKeyRequest {
                        duration_days: days,
                        max_uses: uses,
                        notes,
                    };
                    serde_json::to_value(ledger.create(&request, now).await?)?
                }
                KeyCommands::List => {
                    let listing = ledger.list(now).await?;
                    serde_json::json!({"keys": listing.keys, "stats": listing.stats})
                }
                KeyCommands::Verify { key } => serde_json::to_value(ledger.verify(&key, now).await?)?,
                KeyCommands::Delete { key } => serde_json::to_value(ledger.delete(&key).await?)?,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("rendering key output")?
            );
        }
    }

    Ok(())
}
