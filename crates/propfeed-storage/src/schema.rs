//! Table, constraint and index definitions applied by `bootstrap`.

pub const CONTACTS_TABLE: &str = "contacts";
pub const LISTINGS_TABLE: &str = "listings";
pub const LISTING_NATURAL_KEY: &str = "listings_natural_key";

/// Secondary indexes: read-path acceleration, not uniqueness.
pub const LISTING_INDEXES: [(&str, &str); 4] = [
    ("idx_listings_location", "state, city, colony"),
    ("idx_listings_email", "email"),
    ("idx_listings_type_transaction", "property_type, transaction_type"),
    ("idx_listings_price", "price"),
];

pub const CREATE_CONTACTS: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    id BIGSERIAL PRIMARY KEY,
    email TEXT NOT NULL UNIQUE
)
"#;

pub const CREATE_LISTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    id BIGSERIAL PRIMARY KEY,
    state TEXT NOT NULL,
    city TEXT NOT NULL,
    colony TEXT NOT NULL,
    street TEXT NOT NULL,
    external_number TEXT NOT NULL,
    property_type TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    price NUMERIC(15, 2) NOT NULL DEFAULT 0,
    provider_code TEXT NOT NULL,
    email TEXT NOT NULL REFERENCES contacts (email),
    phone TEXT NOT NULL,
    CONSTRAINT listings_natural_key UNIQUE (
        state, city, colony, street, external_number,
        property_type, transaction_type, provider_code, email
    )
)
"#;

/// Every statement `bootstrap` runs, in order. Each one is idempotent.
pub fn bootstrap_statements() -> Vec<String> {
    let mut statements = vec![CREATE_CONTACTS.trim().to_string(), CREATE_LISTINGS.trim().to_string()];
    statements.extend(LISTING_INDEXES.iter().map(|(name, columns)| {
        format!("CREATE INDEX IF NOT EXISTS {name} ON {LISTINGS_TABLE} ({columns})")
    }));
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_create_if_missing_only() {
        let statements = bootstrap_statements();
        assert_eq!(statements.len(), 6);
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
        assert!(statements[1].contains(LISTING_NATURAL_KEY));
        assert!(statements[1].contains(&format!("REFERENCES {CONTACTS_TABLE} (email)")));
    }

    #[test]
    fn natural_key_leaves_price_and_phone_mutable() {
        let key_clause = CREATE_LISTINGS
            .split("UNIQUE (")
            .nth(1)
            .expect("unique clause");
        assert!(!key_clause.contains("price"));
        assert!(!key_clause.contains("phone"));
        assert!(key_clause.contains("email"));
        assert!(key_clause.contains("provider_code"));
    }
}
