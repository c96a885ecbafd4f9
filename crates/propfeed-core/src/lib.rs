//! Core listing model and feed-field normalization for propfeed.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::{BigDecimal, RoundingMode, Zero};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "propfeed-core";

/// Placeholder persisted for descriptive fields the feed left out.
pub const NOT_AVAILABLE: &str = "N/A";

/// Fractional digits kept for prices (`NUMERIC(15, 2)` in the store).
pub const PRICE_SCALE: i64 = 2;

/// Integer digits a stored price may carry (`NUMERIC(15, 2)`).
pub const PRICE_MAX_INTEGER_DIGITS: u32 = 13;

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$";

/// Feed field names as they appear in the source document.
pub mod feed_fields {
    pub const EXTERNAL_NUM: &str = "external_num";
    pub const PRICE: &str = "price";
    pub const MAIL_CONTACT: &str = "mail_contact";
    pub const PHONE_CONTACT: &str = "phone_contact";
    pub const STATE: &str = "state";
    pub const CITY: &str = "city";
    pub const COLONY: &str = "colony";
    pub const STREET: &str = "street";
    pub const TYPE: &str = "type";
    pub const PURPOSE: &str = "purpose";
    pub const CODE: &str = "code";

    pub const ALL: [&str; 11] = [
        EXTERNAL_NUM,
        PRICE,
        MAIL_CONTACT,
        PHONE_CONTACT,
        STATE,
        CITY,
        COLONY,
        STREET,
        TYPE,
        PURPOSE,
        CODE,
    ];
}

/// One feed entry exactly as read; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_num: Option<String>,
    pub price: Option<String>,
    pub mail_contact: Option<String>,
    pub phone_contact: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub colony: Option<String>,
    pub street: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub purpose: Option<String>,
    pub code: Option<String>,
}

impl RawListing {
    /// Assign a field by its feed name. Returns `false` for names the feed
    /// model does not know, leaving the record untouched.
    pub fn set_field(&mut self, name: &str, value: Option<String>) -> bool {
        let slot = match name {
            feed_fields::EXTERNAL_NUM => &mut self.external_num,
            feed_fields::PRICE => &mut self.price,
            feed_fields::MAIL_CONTACT => &mut self.mail_contact,
            feed_fields::PHONE_CONTACT => &mut self.phone_contact,
            feed_fields::STATE => &mut self.state,
            feed_fields::CITY => &mut self.city,
            feed_fields::COLONY => &mut self.colony,
            feed_fields::STREET => &mut self.street,
            feed_fields::TYPE => &mut self.kind,
            feed_fields::PURPOSE => &mut self.purpose,
            feed_fields::CODE => &mut self.code,
            _ => return false,
        };
        *slot = value;
        true
    }

    pub fn from_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut raw = Self::default();
        for (name, value) in fields {
            raw.set_field(name, Some(value.to_string()));
        }
        raw
    }
}

/// Trimmed, lower-cased contact address that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContactEmail(String);

impl ContactEmail {
    pub fn parse(input: &str) -> Option<Self> {
        let candidate = input.trim().to_lowercase();
        if email_regex().is_match(&candidate) {
            Some(Self(candidate))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContactEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContactEmail {
    type Error = NormalizeRejection;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(NormalizeRejection::InvalidEmail(value))
    }
}

impl From<ContactEmail> for String {
    fn from(value: ContactEmail) -> Self {
        value.0
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern is valid"))
}

/// Total, typed listing record; every field is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub state: String,
    pub city: String,
    pub colony: String,
    pub street: String,
    pub external_number: String,
    pub property_type: String,
    pub transaction_type: String,
    pub price: BigDecimal,
    pub provider_code: String,
    pub contact_email: ContactEmail,
    pub contact_phone: String,
}

impl NormalizedListing {
    pub fn natural_key(&self) -> ListingKey {
        ListingKey {
            state: self.state.clone(),
            city: self.city.clone(),
            colony: self.colony.clone(),
            street: self.street.clone(),
            external_number: self.external_number.clone(),
            property_type: self.property_type.clone(),
            transaction_type: self.transaction_type.clone(),
            provider_code: self.provider_code.clone(),
            contact_email: self.contact_email.clone(),
        }
    }

    /// Whether `other` matches on all eleven fields. Prices compare by value,
    /// so `100` and `100.00` are the same observation, as in a `NUMERIC`
    /// equality scan.
    pub fn same_observation(&self, other: &NormalizedListing) -> bool {
        self.natural_key() == other.natural_key()
            && self.price == other.price
            && self.contact_phone == other.contact_phone
    }
}

/// The persisted uniqueness constraint for listings: every field except
/// price and phone, which are the only columns an observation may overwrite
/// once a key exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub state: String,
    pub city: String,
    pub colony: String,
    pub street: String,
    pub external_number: String,
    pub property_type: String,
    pub transaction_type: String,
    pub provider_code: String,
    pub contact_email: ContactEmail,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NormalizeRejection {
    #[error("record has no contact email")]
    MissingEmail,
    #[error("contact email {0:?} is not a valid address")]
    InvalidEmail(String),
}

/// Result of normalizing one feed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Valid(NormalizedListing),
    Rejected(NormalizeRejection),
}

impl Normalized {
    pub fn valid(self) -> Option<NormalizedListing> {
        match self {
            Normalized::Valid(listing) => Some(listing),
            Normalized::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Normalized::Rejected(_))
    }
}

/// Clean, default and validate one raw record. Pure; rejection is a value.
pub fn normalize(raw: &RawListing) -> Normalized {
    let contact_email = match raw.mail_contact.as_deref() {
        None => return Normalized::Rejected(NormalizeRejection::MissingEmail),
        Some(value) => match ContactEmail::parse(value) {
            Some(email) => email,
            None => {
                return Normalized::Rejected(NormalizeRejection::InvalidEmail(value.to_string()))
            }
        },
    };

    Normalized::Valid(NormalizedListing {
        state: text_or_default(raw.state.as_deref()),
        city: text_or_default(raw.city.as_deref()),
        colony: text_or_default(raw.colony.as_deref()),
        street: text_or_default(raw.street.as_deref()),
        external_number: text_or_default(raw.external_num.as_deref()),
        property_type: text_or_default(raw.kind.as_deref()),
        transaction_type: text_or_default(raw.purpose.as_deref()),
        price: normalize_price(raw.price.as_deref()),
        provider_code: text_or_default(raw.code.as_deref()),
        contact_email,
        contact_phone: text_or_default(raw.phone_contact.as_deref()),
    })
}

pub fn normalize_all(raws: &[RawListing]) -> Vec<Normalized> {
    raws.iter().map(normalize).collect()
}

fn text_or_default(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => NOT_AVAILABLE.to_string(),
    }
}

/// Coerce a raw price into a non-negative two-decimal amount; anything
/// missing, unparsable or too wide for the price column becomes zero.
/// Exponent notation is not accepted.
pub fn normalize_price(value: Option<&str>) -> BigDecimal {
    let parsed = value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.contains(['e', 'E']))
        .and_then(|v| BigDecimal::from_str(v).ok())
        .unwrap_or_else(BigDecimal::zero);
    if parsed < BigDecimal::zero() {
        return BigDecimal::zero().with_scale(PRICE_SCALE);
    }
    let rounded = parsed.with_scale_round(PRICE_SCALE, RoundingMode::HalfEven);
    if price_fits_column(&rounded) {
        rounded
    } else {
        BigDecimal::zero().with_scale(PRICE_SCALE)
    }
}

/// Whether `price` is storable in `NUMERIC(15, 2)` without overflow.
pub fn price_fits_column(price: &BigDecimal) -> bool {
    let ceiling = BigDecimal::from(10u64.pow(PRICE_MAX_INTEGER_DIGITS));
    price.abs() < ceiling
}

/// A directory entry keyed by its email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub email: ContactEmail,
}

/// A persisted listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    #[serde(flatten)]
    pub fields: NormalizedListing,
}

/// What a listing write did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    Inserted,
    Updated,
    Skipped,
}
