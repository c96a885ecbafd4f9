//! Feed source contracts + XML feed reader.

use std::path::PathBuf;

use async_trait::async_trait;
use propfeed_core::RawListing;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "propfeed-adapters";

const ROOT_DEPTH: usize = 1;
const RECORD_DEPTH: usize = 2;
const FIELD_DEPTH: usize = 3;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed feed xml at byte {position}: {message}")]
    Xml { position: u64, message: String },
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    async fn read_listings(&self) -> Result<Vec<RawListing>, FeedError>;
}

/// Feed document stored on the local filesystem.
#[derive(Debug, Clone)]
pub struct XmlFileFeed {
    path: PathBuf,
}

impl XmlFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for XmlFileFeed {
    fn describe(&self) -> String {
        format!("xml file {}", self.path.display())
    }

    async fn read_listings(&self) -> Result<Vec<RawListing>, FeedError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| FeedError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_feed_xml(&text)
    }
}

/// Feed document already held in memory.
#[derive(Debug, Clone)]
pub struct InlineXmlFeed {
    document: String,
}

impl InlineXmlFeed {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

#[async_trait]
impl FeedSource for InlineXmlFeed {
    fn describe(&self) -> String {
        format!("inline xml ({} bytes)", self.document.len())
    }

    async fn read_listings(&self) -> Result<Vec<RawListing>, FeedError> {
        parse_feed_xml(&self.document)
    }
}

/// Parse a flat feed: a root element whose children are records and whose
/// grandchildren are fields. Record attributes are read as fields too.
pub fn parse_feed_xml(document: &str) -> Result<Vec<RawListing>, FeedError> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut listings = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<RawListing> = None;
    let mut field: Option<(String, String)> = None;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader.read_event().map_err(|e| FeedError::Xml {
            position,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(start) => {
                depth += 1;
                match depth {
                    RECORD_DEPTH => current = Some(record_from_attributes(&start, position)?),
                    FIELD_DEPTH => field = Some((element_name(&start), String::new())),
                    _ => {}
                }
            }
            Event::Empty(empty) => match depth {
                ROOT_DEPTH => listings.push(record_from_attributes(&empty, position)?),
                RECORD_DEPTH => {
                    if let Some(record) = current.as_mut() {
                        assign_field(record, &element_name(&empty), None);
                    }
                }
                _ => {}
            },
            Event::Text(text) if depth == FIELD_DEPTH => {
                if let Some((_, value)) = field.as_mut() {
                    let unescaped = text.unescape().map_err(|e| FeedError::Xml {
                        position,
                        message: e.to_string(),
                    })?;
                    value.push_str(&unescaped);
                }
            }
            Event::CData(data) if depth == FIELD_DEPTH => {
                if let Some((_, value)) = field.as_mut() {
                    value.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                match depth {
                    FIELD_DEPTH => {
                        if let (Some(record), Some((name, value))) = (current.as_mut(), field.take())
                        {
                            assign_field(record, &name, Some(value));
                        }
                    }
                    RECORD_DEPTH => {
                        if let Some(record) = current.take() {
                            listings.push(record);
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(listings)
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn record_from_attributes(element: &BytesStart<'_>, position: u64) -> Result<RawListing, FeedError> {
    let mut record = RawListing::default();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| FeedError::Xml {
            position,
            message: e.to_string(),
        })?;
        let name = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(|e| FeedError::Xml {
            position,
            message: e.to_string(),
        })?;
        assign_field(&mut record, &name, Some(value.into_owned()));
    }
    Ok(record)
}

fn assign_field(record: &mut RawListing, name: &str, value: Option<String>) {
    let value = value.filter(|v| !v.trim().is_empty());
    if !record.set_field(name, value) {
        debug!(field = name, "ignoring unknown feed field");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_flat_records() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <data>
              <row>
                <external_num>10</external_num>
                <price>1200.5</price>
                <mail_contact>Agent@Example.com</mail_contact>
                <state>Jalisco</state>
                <type>Casa</type>
                <purpose>Venta</purpose>
              </row>
              <row>
                <mail_contact>other@example.com</mail_contact>
                <price/>
                <street>   </street>
              </row>
            </data>"#;

        let listings = parse_feed_xml(xml).expect("parse");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].external_num.as_deref(), Some("10"));
        assert_eq!(listings[0].kind.as_deref(), Some("Casa"));
        assert_eq!(listings[0].mail_contact.as_deref(), Some("Agent@Example.com"));
        assert_eq!(listings[1].price, None);
        assert_eq!(listings[1].street, None);
        assert_eq!(listings[1].city, None);
    }

    #[test]
    fn unescapes_entities_and_cdata() {
        let xml = "<data><row><street>Calle 5 &amp; 6</street>\
                   <colony><![CDATA[Centro <Histórico>]]></colony></row></data>";
        let listings = parse_feed_xml(xml).expect("parse");
        assert_eq!(listings[0].street.as_deref(), Some("Calle 5 & 6"));
        assert_eq!(listings[0].colony.as_deref(), Some("Centro <Histórico>"));
    }

    #[test]
    fn record_attributes_are_fields() {
        let xml = r#"<data><row code="777" state="Puebla"><city>Cholula</city></row><row code="1"/></data>"#;
        let listings = parse_feed_xml(xml).expect("parse");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].code.as_deref(), Some("777"));
        assert_eq!(listings[0].state.as_deref(), Some("Puebla"));
        assert_eq!(listings[0].city.as_deref(), Some("Cholula"));
        assert_eq!(listings[1].code.as_deref(), Some("1"));
    }

    #[test]
    fn empty_document_has_no_records() {
        assert!(parse_feed_xml("<data/>").expect("parse").is_empty());
        assert!(parse_feed_xml("<data></data>").expect("parse").is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let err = parse_feed_xml("<data><row><city>x</state></row></data>").unwrap_err();
        assert!(matches!(err, FeedError::Xml { .. }));
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let err = XmlFileFeed::new("/definitely/not/here.xml")
            .read_listings()
            .await
            .unwrap_err();
        match err {
            FeedError::Io { path, .. } => assert!(path.ends_with("here.xml")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
