use async_trait::async_trait;
use propfeed_core::{ContactEmail, LoadOutcome, NormalizedListing};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use crate::schema::bootstrap_statements;
use crate::{DbConfig, ListingSession, ListingStore, StoreCounts, StoreError};

const COUNT_EXACT_SQL: &str = r#"
SELECT COUNT(*)
  FROM listings
 WHERE state = $1
   AND city = $2
   AND colony = $3
   AND street = $4
   AND external_number = $5
   AND property_type = $6
   AND transaction_type = $7
   AND price = $8
   AND provider_code = $9
   AND email = $10
   AND phone = $11
"#;

// `xmax = 0` only holds for a freshly inserted tuple.
const UPSERT_LISTING_SQL: &str = r#"
INSERT INTO listings (
    state, city, colony, street, external_number, property_type,
    transaction_type, price, provider_code, email, phone
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT ON CONSTRAINT listings_natural_key DO UPDATE
   SET price = EXCLUDED.price,
       phone = EXCLUDED.phone
RETURNING (xmax = 0) AS inserted
"#;

const ENSURE_CONTACT_SQL: &str =
    "INSERT INTO contacts (email) VALUES ($1) ON CONFLICT (email) DO NOTHING";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;
        info!("connected to postgres");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn bootstrap(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in bootstrap_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("schema bootstrap complete");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn ListingSession>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            handle: Some(PgHandle::Transaction(tx)),
        }))
    }

    async fn acquire(&self) -> Result<Box<dyn ListingSession>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession {
            handle: Some(PgHandle::AutoCommit(conn)),
        }))
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
            .fetch_one(&self.pool)
            .await?;
        let listings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreCounts { contacts, listings })
    }
}

enum PgHandle {
    Transaction(Transaction<'static, Postgres>),
    AutoCommit(PoolConnection<Postgres>),
}

struct PgSession {
    handle: Option<PgHandle>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        match self.handle.as_mut() {
            Some(PgHandle::Transaction(tx)) => Ok(&mut **tx),
            Some(PgHandle::AutoCommit(conn)) => Ok(&mut **conn),
            None => Err(StoreError::Query("session already committed".to_string())),
        }
    }
}

#[async_trait]
impl ListingSession for PgSession {
    async fn ensure_contact(&mut self, email: &ContactEmail) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let result = sqlx::query(ENSURE_CONTACT_SQL)
            .bind(email.as_str())
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_exact(&mut self, listing: &NormalizedListing) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = sqlx::query_scalar(COUNT_EXACT_SQL)
            .bind(&listing.state)
            .bind(&listing.city)
            .bind(&listing.colony)
            .bind(&listing.street)
            .bind(&listing.external_number)
            .bind(&listing.property_type)
            .bind(&listing.transaction_type)
            .bind(&listing.price)
            .bind(&listing.provider_code)
            .bind(listing.contact_email.as_str())
            .bind(&listing.contact_phone)
            .fetch_one(conn)
            .await?;
        Ok(count)
    }

    async fn upsert_listing(
        &mut self,
        listing: &NormalizedListing,
    ) -> Result<LoadOutcome, StoreError> {
        let conn = self.conn()?;
        let inserted: bool = sqlx::query_scalar(UPSERT_LISTING_SQL)
            .bind(&listing.state)
            .bind(&listing.city)
            .bind(&listing.colony)
            .bind(&listing.street)
            .bind(&listing.external_number)
            .bind(&listing.property_type)
            .bind(&listing.transaction_type)
            .bind(&listing.price)
            .bind(&listing.provider_code)
            .bind(listing.contact_email.as_str())
            .bind(&listing.contact_phone)
            .fetch_one(conn)
            .await?;
        Ok(if inserted {
            LoadOutcome::Inserted
        } else {
            LoadOutcome::Updated
        })
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self.handle.take() {
            Some(PgHandle::Transaction(tx)) => tx.commit().await?,
            other => self.handle = other,
        }
        Ok(())
    }
}
