//! Streaming mode: concurrent workers, Conflict-Driven Upsert per record.
//!
//! Each worker holds one pooled session and reuses it across records. A record
//! that fails is reported and dropped; the worker then releases its session and
//! reacquires on the next record, so a broken connection never outlives the
//! failure that exposed it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use propfeed_core::{normalize, LoadOutcome, NormalizeRejection, Normalized, NormalizedListing, RawListing};
use propfeed_storage::{ListingSession, ListingStore, StoreError};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_STREAM_WORKERS: usize = 4;
const CHANNEL_CAPACITY_PER_WORKER: usize = 16;

#[derive(Debug)]
pub enum RecordOutcome {
    Applied(LoadOutcome),
    Rejected(NormalizeRejection),
    Failed(StoreError),
    /// The record never reported back: its worker died or every worker had
    /// exited before it was dispatched.
    Aborted,
}

#[derive(Debug)]
pub struct RecordResult {
    pub index: usize,
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub index: usize,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connectivity,
    Integrity,
    Query,
    Aborted,
}

impl From<&StoreError> for FailureKind {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Connectivity(_) => FailureKind::Connectivity,
            StoreError::Integrity(_) => FailureKind::Integrity,
            StoreError::Query(_) => FailureKind::Query,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_records: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
}

impl StreamReport {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    fn from_results(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        raw_records: usize,
        results: &[RecordResult],
    ) -> Self {
        let mut report = StreamReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_records,
            rejected: 0,
            inserted: 0,
            updated: 0,
            failed: 0,
            failures: Vec::new(),
        };
        for result in results {
            match &result.outcome {
                RecordOutcome::Applied(LoadOutcome::Updated) => report.updated += 1,
                RecordOutcome::Applied(_) => report.inserted += 1,
                RecordOutcome::Rejected(_) => report.rejected += 1,
                RecordOutcome::Failed(err) => {
                    report.failed += 1;
                    report.failures.push(RecordFailure {
                        index: result.index,
                        kind: FailureKind::from(err),
                        message: err.to_string(),
                    });
                }
                RecordOutcome::Aborted => {
                    report.failed += 1;
                    report.failures.push(RecordFailure {
                        index: result.index,
                        kind: FailureKind::Aborted,
                        message: "stream worker aborted before reporting".to_string(),
                    });
                }
            }
        }
        report
    }
}

/// Ensure the record's contact, then upsert its listing on the natural key.
pub async fn upsert_record(
    session: &mut dyn ListingSession,
    listing: &NormalizedListing,
) -> Result<LoadOutcome, StoreError> {
    session.ensure_contact(&listing.contact_email).await?;
    session.upsert_listing(listing).await
}

pub struct StreamPipeline {
    store: Arc<dyn ListingStore>,
    workers: usize,
}

impl StreamPipeline {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            workers: DEFAULT_STREAM_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Feed every record through the worker pool. Never fails as a whole:
    /// per-record problems land in the report.
    pub async fn run<I>(&self, records: I) -> (StreamReport, Vec<RecordResult>)
    where
        I: IntoIterator<Item = RawListing>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("stream_load", %run_id, workers = self.workers);

        let (tx, rx) = mpsc::channel::<(usize, RawListing)>(self.workers * CHANNEL_CAPACITY_PER_WORKER);
        let rx = Arc::new(Mutex::new(rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<RecordResult>();
        let mut pool = JoinSet::new();
        for worker_id in 0..self.workers {
            let store = Arc::clone(&self.store);
            let rx = Arc::clone(&rx);
            let result_tx = result_tx.clone();
            pool.spawn(run_worker(worker_id, store, rx, result_tx).instrument(span.clone()));
        }
        drop(result_tx);
        drop(rx);

        let mut raw_records = 0usize;
        let mut records = records.into_iter();
        for record in records.by_ref() {
            let index = raw_records;
            raw_records += 1;
            if tx.send((index, record)).await.is_err() {
                error!(index, "all stream workers exited early");
                break;
            }
        }
        raw_records += records.count();
        drop(tx);

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "stream worker aborted");
            }
        }
        let mut results = Vec::with_capacity(raw_records);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.index);
        let results = fill_unreported(results, raw_records);

        let report = StreamReport::from_results(run_id, started_at, raw_records, &results);
        span.in_scope(|| {
            info!(
                applied = report.applied(),
                rejected = report.rejected,
                failed = report.failed,
                "stream load finished"
            )
        });
        (report, results)
    }
}

/// Mark every index in `0..raw_records` without a result as aborted.
/// `results` must be sorted by index.
fn fill_unreported(results: Vec<RecordResult>, raw_records: usize) -> Vec<RecordResult> {
    if results.len() == raw_records {
        return results;
    }
    let mut filled = Vec::with_capacity(raw_records);
    let mut reported = results.into_iter().peekable();
    for index in 0..raw_records {
        match reported.next_if(|r| r.index == index) {
            Some(result) => filled.push(result),
            None => {
                warn!(index, "record lost with its stream worker");
                filled.push(RecordResult {
                    index,
                    outcome: RecordOutcome::Aborted,
                });
            }
        }
    }
    filled
}

async fn run_worker(
    worker_id: usize,
    store: Arc<dyn ListingStore>,
    rx: Arc<Mutex<mpsc::Receiver<(usize, RawListing)>>>,
    results: mpsc::UnboundedSender<RecordResult>,
) {
    let mut session: Option<Box<dyn ListingSession>> = None;

    loop {
        let next = rx.lock().await.recv().await;
        let Some((index, raw)) = next else {
            break;
        };

        let outcome = match normalize(&raw) {
            Normalized::Rejected(reason) => {
                debug!(worker_id, index, %reason, "record rejected");
                RecordOutcome::Rejected(reason)
            }
            Normalized::Valid(listing) => match apply(store.as_ref(), &mut session, &listing).await {
                Ok(outcome) => RecordOutcome::Applied(outcome),
                Err(err) => {
                    warn!(worker_id, index, error = %err, "record dropped from stream");
                    session = None;
                    RecordOutcome::Failed(err)
                }
            },
        };
        if results.send(RecordResult { index, outcome }).is_err() {
            break;
        }
    }
}

async fn apply(
    store: &dyn ListingStore,
    session: &mut Option<Box<dyn ListingSession>>,
    listing: &NormalizedListing,
) -> Result<LoadOutcome, StoreError> {
    if session.is_none() {
        *session = Some(store.acquire().await?);
    }
    let active = session
        .as_mut()
        .ok_or_else(|| StoreError::Connectivity("no session available".to_string()))?;
    upsert_record(active.as_mut(), listing).await
}
