use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use propfeed_core::{
    price_fits_column, Contact, ContactEmail, Listing, ListingKey, LoadOutcome, NormalizedListing,
};
use tokio::sync::Mutex;

use crate::{ListingSession, ListingStore, StoreCounts, StoreError};

/// In-process store with the same constraints as the Postgres schema:
/// unique contact emails, the listing foreign key and the natural key.
/// Transactions work on a private copy that replaces the shared tables on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    offline: bool,
    failing_emails: HashSet<String>,
    bootstrap_runs: usize,
}

impl MemoryState {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Connectivity("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self, email: &ContactEmail) -> Result<(), StoreError> {
        self.check_online()?;
        if self.failing_emails.contains(email.as_str()) {
            Err(StoreError::Integrity(format!("write rejected for {email}")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    contacts: BTreeMap<ContactEmail, i64>,
    listings: Vec<Listing>,
    keys: BTreeMap<ListingKey, usize>,
    next_contact_id: i64,
    next_listing_id: i64,
}

impl Tables {
    fn ensure_contact(&mut self, email: &ContactEmail) -> bool {
        if self.contacts.contains_key(email) {
            return false;
        }
        self.next_contact_id += 1;
        self.contacts.insert(email.clone(), self.next_contact_id);
        true
    }

    fn count_exact(&self, listing: &NormalizedListing) -> i64 {
        self.listings
            .iter()
            .filter(|row| row.fields.same_observation(listing))
            .count() as i64
    }

    fn upsert_listing(&mut self, listing: &NormalizedListing) -> Result<LoadOutcome, StoreError> {
        if !self.contacts.contains_key(&listing.contact_email) {
            return Err(StoreError::Integrity(format!(
                "listing references unknown contact {}",
                listing.contact_email
            )));
        }
        if !price_fits_column(&listing.price) {
            return Err(StoreError::Query(format!(
                "numeric field overflow: price {} exceeds NUMERIC(15, 2)",
                listing.price
            )));
        }

        let key = listing.natural_key();
        if let Some(&index) = self.keys.get(&key) {
            let row = &mut self.listings[index];
            row.fields.price = listing.price.clone();
            row.fields.contact_phone = listing.contact_phone.clone();
            return Ok(LoadOutcome::Updated);
        }

        self.next_listing_id += 1;
        self.keys.insert(key, self.listings.len());
        self.listings.push(Listing {
            id: self.next_listing_id,
            fields: listing.clone(),
        });
        Ok(LoadOutcome::Inserted)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every new session and every operation fail with a connectivity error.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Reject contact and listing writes for `email` with an integrity error.
    pub async fn fail_writes_for(&self, email: &str) {
        self.state
            .lock()
            .await
            .failing_emails
            .insert(email.trim().to_lowercase());
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        let state = self.state.lock().await;
        let mut contacts: Vec<Contact> = state
            .tables
            .contacts
            .iter()
            .map(|(email, id)| Contact {
                id: *id,
                email: email.clone(),
            })
            .collect();
        contacts.sort_by_key(|c| c.id);
        contacts
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.state.lock().await.tables.listings.clone()
    }

    pub async fn bootstrap_runs(&self) -> usize {
        self.state.lock().await.bootstrap_runs
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn bootstrap(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state.bootstrap_runs += 1;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn ListingSession>, StoreError> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            mode: SessionMode::Transaction(Some(state.tables.clone())),
        }))
    }

    async fn acquire(&self) -> Result<Box<dyn ListingSession>, StoreError> {
        self.state.lock().await.check_online()?;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            mode: SessionMode::AutoCommit,
        }))
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(StoreCounts {
            contacts: state.tables.contacts.len() as i64,
            listings: state.tables.listings.len() as i64,
        })
    }
}

enum SessionMode {
    Transaction(Option<Tables>),
    AutoCommit,
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    mode: SessionMode,
}

fn working_tables<'a>(
    mode: &'a mut SessionMode,
    shared: &'a mut Tables,
) -> Result<&'a mut Tables, StoreError> {
    match mode {
        SessionMode::Transaction(Some(tables)) => Ok(tables),
        SessionMode::Transaction(None) => {
            Err(StoreError::Query("session already committed".to_string()))
        }
        SessionMode::AutoCommit => Ok(shared),
    }
}

#[async_trait]
impl ListingSession for MemorySession {
    async fn ensure_contact(&mut self, email: &ContactEmail) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(email)?;
        let tables = working_tables(&mut self.mode, &mut state.tables)?;
        Ok(tables.ensure_contact(email))
    }

    async fn count_exact(&mut self, listing: &NormalizedListing) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        let tables = working_tables(&mut self.mode, &mut state.tables)?;
        Ok(tables.count_exact(listing))
    }

    async fn upsert_listing(
        &mut self,
        listing: &NormalizedListing,
    ) -> Result<LoadOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(&listing.contact_email)?;
        let tables = working_tables(&mut self.mode, &mut state.tables)?;
        tables.upsert_listing(listing)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        if let SessionMode::Transaction(working) = &mut self.mode {
            let tables = working
                .take()
                .ok_or_else(|| StoreError::Query("session already committed".to_string()))?;
            state.tables = tables;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use propfeed_core::{normalize, RawListing};

    fn listing(email: &str, price: &str) -> NormalizedListing {
        normalize(&RawListing::from_fields([
            ("mail_contact", email),
            ("price", price),
            ("state", "Jalisco"),
            ("city", "Zapopan"),
            ("street", "Av. Patria"),
            ("type", "Casa"),
            ("purpose", "Venta"),
        ]))
        .valid()
        .expect("valid listing")
    }

    #[tokio::test]
    async fn contacts_are_unique_by_email() {
        let store = MemoryStore::new();
        let mut session = store.acquire().await.unwrap();
        let email = ContactEmail::parse("a@b.co").unwrap();
        assert!(session.ensure_contact(&email).await.unwrap());
        assert!(!session.ensure_contact(&email).await.unwrap());
        assert_eq!(store.contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn listing_requires_existing_contact() {
        let store = MemoryStore::new();
        let mut session = store.acquire().await.unwrap();
        let err = session
            .upsert_listing(&listing("nobody@b.co", "10"))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert!(store.listings().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_overwrites_price_on_natural_key() {
        let store = MemoryStore::new();
        let mut session = store.acquire().await.unwrap();
        let first = listing("a@b.co", "100");
        session.ensure_contact(&first.contact_email).await.unwrap();
        assert_eq!(
            session.upsert_listing(&first).await.unwrap(),
            LoadOutcome::Inserted
        );
        assert_eq!(
            session.upsert_listing(&listing("a@b.co", "90")).await.unwrap(),
            LoadOutcome::Updated
        );
        let rows = store.listings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.price, BigDecimal::from(90));
    }

    #[tokio::test]
    async fn price_beyond_column_width_is_refused() {
        let store = MemoryStore::new();
        let mut session = store.acquire().await.unwrap();
        let mut wide = listing("a@b.co", "10");
        wide.price = "100000000000000".parse().unwrap();
        session.ensure_contact(&wide.contact_email).await.unwrap();
        let err = session.upsert_listing(&wide).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
        assert!(store.listings().await.is_empty());
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_discarded() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.ensure_contact(&ContactEmail::parse("a@b.co").unwrap())
                .await
                .unwrap();
        }
        assert!(store.contacts().await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.ensure_contact(&ContactEmail::parse("a@b.co").unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn offline_store_refuses_sessions() {
        let store = MemoryStore::new();
        store.set_offline(true).await;
        assert!(store.acquire().await.err().unwrap().is_connectivity());
        assert!(store.begin().await.err().unwrap().is_connectivity());
    }
}
