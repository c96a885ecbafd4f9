//! Batch mode: one transaction, contacts first, then Scan-Then-Insert per listing.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use propfeed_core::{normalize, ContactEmail, LoadOutcome, Normalized, NormalizedListing, RawListing};
use propfeed_storage::{ListingSession, ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("opening batch transaction: {0}")]
    Session(#[source] StoreError),
    #[error("loading contact directory: {0}")]
    Contacts(#[source] StoreError),
    #[error("loading listing #{index}: {source}")]
    Listing {
        index: usize,
        #[source]
        source: StoreError,
    },
    #[error("committing batch: {0}")]
    Commit(#[source] StoreError),
}

impl BatchError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            BatchError::Session(err) | BatchError::Contacts(err) | BatchError::Commit(err) => err,
            BatchError::Listing { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContactLoad {
    pub distinct: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_records: usize,
    pub rejected: usize,
    pub distinct_contacts: usize,
    pub contacts_created: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Distinct contact emails across a batch, each exactly once.
pub fn distinct_emails(listings: &[NormalizedListing]) -> BTreeSet<&ContactEmail> {
    listings.iter().map(|l| &l.contact_email).collect()
}

/// Insert-if-absent every distinct contact. Stops at the first failure.
pub async fn ensure_contacts(
    session: &mut dyn ListingSession,
    listings: &[NormalizedListing],
) -> Result<ContactLoad, StoreError> {
    let emails = distinct_emails(listings);
    let mut load = ContactLoad {
        distinct: emails.len(),
        created: 0,
    };
    for email in emails {
        if session.ensure_contact(email).await? {
            load.created += 1;
        }
    }
    Ok(load)
}

/// An exact eleven-field match leaves the store untouched; anything else is
/// written through the natural-key conflict clause.
pub async fn scan_then_insert(
    session: &mut dyn ListingSession,
    listing: &NormalizedListing,
) -> Result<LoadOutcome, StoreError> {
    if session.count_exact(listing).await? > 0 {
        return Ok(LoadOutcome::Skipped);
    }
    session.upsert_listing(listing).await
}

pub struct BatchLoader {
    store: Arc<dyn ListingStore>,
}

impl BatchLoader {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    /// Normalize, then load contacts and listings in a single transaction.
    /// Any store failure aborts the run and nothing is committed.
    pub async fn run(&self, raws: &[RawListing]) -> Result<BatchReport, BatchError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch_load", %run_id, records = raws.len());
        self.run_inner(run_id, raws).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, raws: &[RawListing]) -> Result<BatchReport, BatchError> {
        let started_at = Utc::now();

        let mut listings = Vec::with_capacity(raws.len());
        let mut rejected = 0usize;
        for (index, raw) in raws.iter().enumerate() {
            match normalize(raw) {
                Normalized::Valid(listing) => listings.push(listing),
                Normalized::Rejected(reason) => {
                    rejected += 1;
                    debug!(index, %reason, "record rejected");
                }
            }
        }

        let mut session = self.store.begin().await.map_err(BatchError::Session)?;
        let contacts = ensure_contacts(session.as_mut(), &listings)
            .await
            .map_err(BatchError::Contacts)?;

        let mut inserted = 0usize;
        let mut updated = 0usize;
        let mut skipped = 0usize;
        for (index, listing) in listings.iter().enumerate() {
            let outcome = scan_then_insert(session.as_mut(), listing)
                .await
                .map_err(|source| BatchError::Listing { index, source })?;
            match outcome {
                LoadOutcome::Inserted => inserted += 1,
                LoadOutcome::Updated => updated += 1,
                LoadOutcome::Skipped => skipped += 1,
            }
        }

        session.commit().await.map_err(BatchError::Commit)?;

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_records: raws.len(),
            rejected,
            distinct_contacts: contacts.distinct,
            contacts_created: contacts.created,
            inserted,
            updated,
            skipped,
        };
        info!(
            rejected = report.rejected,
            contacts_created = report.contacts_created,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "batch load committed"
        );
        Ok(report)
    }
}
