//! Load orchestration: batch and streaming runs, reports, scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use propfeed_adapters::{FeedSource, XmlFileFeed};
use propfeed_storage::{DbConfig, ListingStore};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod batch;
pub mod stream;

pub use batch::{
    distinct_emails, ensure_contacts, scan_then_insert, BatchError, BatchLoader, BatchReport,
    ContactLoad,
};
pub use stream::{
    upsert_record, FailureKind, RecordFailure, RecordOutcome, RecordResult, StreamPipeline,
    StreamReport, DEFAULT_STREAM_WORKERS,
};

pub const CRATE_NAME: &str = "propfeed-sync";

pub const REPORT_FILE_NAME: &str = "load_summary.json";

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub db: DbConfig,
    pub feed_path: PathBuf,
    pub stream_workers: usize,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub load_cron: String,
}

impl LoadConfig {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            feed_path: std::env::var("PROPFEED_FEED_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources/feed.xml")),
            stream_workers: std::env::var("PROPFEED_STREAM_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STREAM_WORKERS),
            reports_dir: std::env::var("PROPFEED_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("PROPFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            load_cron: std::env::var("PROPFEED_LOAD_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

/// Read the feed, bootstrap the schema and run one batch load.
pub async fn run_batch_once(
    store: Arc<dyn ListingStore>,
    feed: &dyn FeedSource,
) -> Result<BatchReport> {
    let raws = feed
        .read_listings()
        .await
        .with_context(|| format!("reading feed from {}", feed.describe()))?;
    store.bootstrap().await.context("bootstrapping schema")?;
    let report = BatchLoader::new(store).run(&raws).await?;
    Ok(report)
}

/// Read the feed, bootstrap the schema and push every record through the stream pipeline.
pub async fn run_stream_once(
    store: Arc<dyn ListingStore>,
    feed: &dyn FeedSource,
    workers: usize,
) -> Result<StreamReport> {
    let raws = feed
        .read_listings()
        .await
        .with_context(|| format!("reading feed from {}", feed.describe()))?;
    store.bootstrap().await.context("bootstrapping schema")?;
    let (report, _results) = StreamPipeline::new(store)
        .with_workers(workers)
        .run(raws)
        .await;
    Ok(report)
}

/// Persist a run summary as `<reports_dir>/<run_id>/load_summary.json`.
pub async fn write_run_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    report: &T,
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(REPORT_FILE_NAME);
    let bytes = serde_json::to_vec_pretty(report).context("serializing load summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Cron-driven batch loads of the configured feed. `None` when disabled.
pub async fn maybe_build_scheduler(
    config: &LoadConfig,
    store: Arc<dyn ListingStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let feed_path = config.feed_path.clone();
    let reports_dir = config.reports_dir.clone();
    let job = Job::new_async(config.load_cron.as_str(), move |_uuid, _l| {
        let store = Arc::clone(&store);
        let feed = XmlFileFeed::new(feed_path.clone());
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            match run_batch_once(store, &feed).await {
                Ok(report) => {
                    info!(run_id = %report.run_id, inserted = report.inserted, "scheduled batch load finished");
                    if let Err(err) = write_run_report(&reports_dir, report.run_id, &report).await {
                        error!(error = %err, "writing scheduled load summary failed");
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled batch load failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.load_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Summary {
        inserted: usize,
    }

    #[tokio::test]
    async fn run_report_lands_under_run_id() {
        let dir = tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let path = write_run_report(dir.path(), run_id, &Summary { inserted: 3 })
            .await
            .expect("write report");

        assert!(path.ends_with(format!("{run_id}/{REPORT_FILE_NAME}")));
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["inserted"], 3);
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let config = LoadConfig {
            db: DbConfig::default(),
            feed_path: PathBuf::from("feed.xml"),
            stream_workers: 1,
            reports_dir: PathBuf::from("reports"),
            scheduler_enabled: false,
            load_cron: "0 0 6 * * *".into(),
        };
        let store: Arc<dyn ListingStore> = Arc::new(propfeed_storage::MemoryStore::new());
        assert!(maybe_build_scheduler(&config, store).await.expect("ok").is_none());
    }
}
