use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use propfeed_adapters::XmlFileFeed;
use propfeed_storage::{ListingStore, MemoryStore, PgStore};
use propfeed_sync::{maybe_build_scheduler, write_run_report, LoadConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "propfeed")]
#[command(about = "Load a listing feed into the contact directory and property catalog")]
struct Cli {
    /// Use an in-process store instead of Postgres (nothing is persisted).
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create tables and indexes if they are missing.
    Bootstrap,
    /// Single-transaction load: contacts first, then scan-then-insert listings.
    Batch {
        #[arg(long)]
        feed: Option<PathBuf>,
    },
    /// Concurrent per-record upserts; failures are reported, not fatal.
    Stream {
        #[arg(long)]
        feed: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run batch loads on PROPFEED_LOAD_CRON until Ctrl-C.
    Schedule,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn open_store(config: &LoadConfig, in_memory: bool) -> Result<Arc<dyn ListingStore>> {
    if in_memory {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.db)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let mut config = LoadConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Batch { feed: None });

    match command {
        Commands::Bootstrap => {
            let store = open_store(&config, cli.in_memory).await?;
            store.bootstrap().await.context("bootstrapping schema")?;
            let counts = store.counts().await.context("counting rows")?;
            println!(
                "schema ready: contacts={} listings={}",
                counts.contacts, counts.listings
            );
        }
        Commands::Batch { feed } => {
            if let Some(feed) = feed {
                config.feed_path = feed;
            }
            let store = open_store(&config, cli.in_memory).await?;
            let source = XmlFileFeed::new(&config.feed_path);
            match propfeed_sync::run_batch_once(Arc::clone(&store), &source).await {
                Ok(report) => {
                    let path = write_run_report(&config.reports_dir, report.run_id, &report).await?;
                    println!(
                        "batch load complete: run_id={} records={} rejected={} contacts_created={} inserted={} updated={} skipped={} summary={}",
                        report.run_id,
                        report.raw_records,
                        report.rejected,
                        report.contacts_created,
                        report.inserted,
                        report.updated,
                        report.skipped,
                        path.display()
                    );
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "batch load failed");
                    eprintln!("batch load failed; nothing was committed: {err:#}");
                    return Err(err);
                }
            }
        }
        Commands::Stream { feed, workers } => {
            if let Some(feed) = feed {
                config.feed_path = feed;
            }
            if let Some(workers) = workers {
                config.stream_workers = workers;
            }
            let store = open_store(&config, cli.in_memory).await?;
            let source = XmlFileFeed::new(&config.feed_path);
            let report =
                propfeed_sync::run_stream_once(store, &source, config.stream_workers).await?;
            let path = write_run_report(&config.reports_dir, report.run_id, &report).await?;
            for failure in &report.failures {
                eprintln!(
                    "record #{} failed ({:?}): {}",
                    failure.index, failure.kind, failure.message
                );
            }
            println!(
                "stream load finished: run_id={} records={} rejected={} inserted={} updated={} failed={} summary={}",
                report.run_id,
                report.raw_records,
                report.rejected,
                report.inserted,
                report.updated,
                report.failed,
                path.display()
            );
        }
        Commands::Schedule => {
            let store = open_store(&config, cli.in_memory).await?;
            let Some(mut sched) = maybe_build_scheduler(&config, store).await? else {
                bail!("scheduler disabled; set PROPFEED_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.load_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_flags_parse() {
        let cli = Cli::try_parse_from([
            "propfeed",
            "--in-memory",
            "stream",
            "--feed",
            "feed.xml",
            "--workers",
            "8",
        ])
        .expect("parse");
        assert!(cli.in_memory);
        match cli.command {
            Some(Commands::Stream { feed, workers }) => {
                assert_eq!(feed, Some(PathBuf::from("feed.xml")));
                assert_eq!(workers, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_is_allowed() {
        let cli = Cli::try_parse_from(["propfeed"]).expect("parse");
        assert!(cli.command.is_none());
    }
}
