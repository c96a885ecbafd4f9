//! Runs against a live database: `DATABASE_URL=... cargo test -- --ignored`.
//! Every write happens inside a transaction that is rolled back on drop.

use std::time::{SystemTime, UNIX_EPOCH};

use bigdecimal::BigDecimal;
use propfeed_core::{normalize, LoadOutcome, NormalizedListing, RawListing};
use propfeed_storage::{DbConfig, ListingStore, PgStore, StoreError};

async fn connect() -> Option<PgStore> {
    let config = DbConfig::from_env();
    config.database_url.as_ref()?;
    let store = PgStore::connect(&config).await.expect("connect");
    store.bootstrap().await.expect("bootstrap");
    Some(store)
}

fn listing(price: &str) -> NormalizedListing {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let email = format!("pg-{nanos}@sol.mx");
    normalize(&RawListing::from_fields([
        ("external_num", "7"),
        ("price", price),
        ("mail_contact", email.as_str()),
        ("state", "Jalisco"),
        ("city", "Zapopan"),
        ("street", "Av. Patria"),
        ("type", "Casa"),
        ("purpose", "Venta"),
        ("code", "500"),
    ]))
    .valid()
    .expect("valid listing")
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a disposable Postgres"]
async fn upsert_reports_insert_then_update_on_natural_key() {
    let Some(store) = connect().await else {
        return;
    };
    let mut tx = store.begin().await.expect("begin");
    let first = listing("1000");
    assert!(tx.ensure_contact(&first.contact_email).await.expect("contact"));
    assert!(!tx.ensure_contact(&first.contact_email).await.expect("contact again"));

    assert_eq!(tx.count_exact(&first).await.expect("count"), 0);
    assert_eq!(
        tx.upsert_listing(&first).await.expect("insert"),
        LoadOutcome::Inserted
    );
    assert_eq!(tx.count_exact(&first).await.expect("count"), 1);

    let mut repriced = first.clone();
    repriced.price = BigDecimal::from(900);
    assert_eq!(
        tx.upsert_listing(&repriced).await.expect("update"),
        LoadOutcome::Updated
    );
    assert_eq!(tx.count_exact(&first).await.expect("count"), 0);
    assert_eq!(tx.count_exact(&repriced).await.expect("count"), 1);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a disposable Postgres"]
async fn listing_without_contact_violates_foreign_key() {
    let Some(store) = connect().await else {
        return;
    };
    let mut tx = store.begin().await.expect("begin");
    let err = tx.upsert_listing(&listing("10")).await.unwrap_err();
    assert!(err.is_integrity(), "{err:?}");
}

#[tokio::test]
#[ignore = "needs DATABASE_URL pointing at a disposable Postgres"]
async fn price_wider_than_column_is_a_query_error() {
    let Some(store) = connect().await else {
        return;
    };
    let mut tx = store.begin().await.expect("begin");
    let mut wide = listing("10");
    wide.price = "100000000000000".parse().expect("decimal");
    tx.ensure_contact(&wide.contact_email).await.expect("contact");
    let err = tx.upsert_listing(&wide).await.unwrap_err();
    assert!(matches!(err, StoreError::Query(_)), "{err:?}");
}
