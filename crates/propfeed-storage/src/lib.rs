//! Contact directory + listing catalog persistence for propfeed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use propfeed_core::{ContactEmail, LoadOutcome, NormalizedListing};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

mod memory;
mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "propfeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connectivity failure: {0}")]
    Connectivity(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::Integrity(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::Other => StoreError::Query(err.to_string()),
                _ => StoreError::Integrity(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connectivity(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// One unit of work against the store: a transaction from [`ListingStore::begin`]
/// or an autocommit connection from [`ListingStore::acquire`]. The underlying
/// connection is released when the session is dropped.
#[async_trait]
pub trait ListingSession: Send {
    /// Insert the contact if absent. Returns `true` when a row was created.
    async fn ensure_contact(&mut self, email: &ContactEmail) -> Result<bool, StoreError>;

    /// Number of listings equal to `listing` on all eleven fields.
    async fn count_exact(&mut self, listing: &NormalizedListing) -> Result<i64, StoreError>;

    /// Insert, or overwrite price and phone when the natural key already exists.
    async fn upsert_listing(&mut self, listing: &NormalizedListing)
        -> Result<LoadOutcome, StoreError>;

    /// Commit a transactional session. No-op for autocommit sessions.
    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Create tables, the natural-key constraint and secondary indexes if missing.
    async fn bootstrap(&self) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn ListingSession>, StoreError>;

    async fn acquire(&self) -> Result<Box<dyn ListingSession>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub contacts: i64,
    pub listings: i64,
}

#[derive(Clone)]
pub struct DbConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "propfeed".to_string(),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASSWORD").unwrap_or(defaults.password),
            database: std::env::var("DB_NAME").unwrap_or(defaults.database),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: defaults.acquire_timeout,
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        match &self.database_url {
            Some(url) => url.parse().map_err(StoreError::from),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.database)),
        }
    }
}

// Credentials stay out of logs and panics.
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
