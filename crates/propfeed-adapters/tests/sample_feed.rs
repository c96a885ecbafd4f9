use std::path::PathBuf;

use propfeed_adapters::{FeedSource, XmlFileFeed};
use propfeed_core::{normalize, Normalized};

fn sample_feed_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed/sample.xml")
}

#[tokio::test]
async fn sample_feed_reads_every_record() {
    let feed = XmlFileFeed::new(sample_feed_path());
    let listings = feed.read_listings().await.expect("sample feed parses");
    assert_eq!(listings.len(), 5);
    assert_eq!(listings[2].price, None);
    assert_eq!(listings[4].mail_contact, None);
}

#[tokio::test]
async fn sample_feed_normalizes_with_two_rejections() {
    let feed = XmlFileFeed::new(sample_feed_path());
    let listings = feed.read_listings().await.expect("sample feed parses");
    let normalized: Vec<Normalized> = listings.iter().map(normalize).collect();
    let rejected = normalized.iter().filter(|n| n.is_rejected()).count();
    assert_eq!(rejected, 2);

    let first = normalized[0].clone().valid().expect("first record is valid");
    assert_eq!(first.contact_email.as_str(), "ventas@inmobiliariasol.mx");
    let third = normalized[2].clone().valid().expect("third record is valid");
    assert_eq!(third.price.to_string(), "0.00");
    assert_eq!(third.contact_phone, "N/A");
}
