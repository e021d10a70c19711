//! Identifier Validation
//!
//! Table and column names cannot travel as bind parameters, so every
//! tenant-supplied name passes through here before it is spliced into a
//! statement. Names read back from the catalog were validated on the way in.

use crate::error::{EngineError, EngineResult};

/// Maximum identifier length (Postgres truncates at 63 bytes)
pub const MAX_IDENT_LEN: usize = 63;

/// Words that may never name a collection, field or view
pub const RESERVED_WORDS: &[&str] = &[
    "select",
    "insert",
    "update",
    "delete",
    "drop",
    "create",
    "alter",
    "table",
    "index",
    "from",
    "where",
    "and",
    "or",
    "not",
    "null",
    "true",
    "false",
    "primary",
    "foreign",
    "key",
    "references",
    "constraint",
    "unique",
    "check",
    "default",
    "on",
    "cascade",
    "set",
    "grant",
    "revoke",
    "user",
    "role",
    "schema",
    "database",
    "public",
    "information_schema",
    "pg_catalog",
];

/// Columns every collection table carries; never user-defined
pub const SYSTEM_COLUMNS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "created_by_user_id",
    "created_by_app_user_id",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.contains(&name)
}

/// True iff `name` matches `^[a-z][a-z0-9_]{0,62}$` and is not reserved.
pub fn validate_slug(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some(first) = bytes.first() else {
        return false;
    };
    if !first.is_ascii_lowercase() || bytes.len() > MAX_IDENT_LEN {
        return false;
    }
    let body_ok = bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_');
    body_ok && !is_reserved(name)
}

/// Like [`validate_slug`] but reports which rule was broken.
pub fn require_slug(name: &str, what: &str) -> EngineResult<()> {
    if validate_slug(name) {
        return Ok(());
    }
    if is_reserved(name) {
        return Err(EngineError::validation(format!(
            "{what} name '{name}' is a reserved word"
        )));
    }
    Err(EngineError::validation(format!(
        "Invalid {what} name '{name}': must start with a lowercase letter, contain only \
         lowercase letters, digits and underscores, and be at most {MAX_IDENT_LEN} characters"
    )))
}

/// Double-quote an identifier for use in SQL text.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal for use in DDL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_slugs() {
        for name in ["a", "orders", "order_items", "x1", "a_b_c_9"] {
            assert!(validate_slug(name), "{name} should be valid");
        }
        assert!(validate_slug(&format!("a{}", "b".repeat(62))));
    }

    #[test]
    fn test_invalid_slugs() {
        for name in [
            "",
            "1abc",
            "_private",
            "Orders",
            "order-items",
            "order items",
            "orders;drop",
            "naïve",
        ] {
            assert!(!validate_slug(name), "{name:?} should be invalid");
        }
        assert!(!validate_slug(&format!("a{}", "b".repeat(63))));
    }

    #[test]
    fn test_reserved_words_rejected() {
        for word in RESERVED_WORDS {
            assert!(!validate_slug(word), "{word} is reserved");
        }
    }

    #[test]
    fn test_require_slug_messages() {
        let err = require_slug("select", "Collection").unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let err = require_slug("Bad", "Field").unwrap_err();
        assert!(err.to_string().contains("Invalid Field name 'Bad'"));

        assert!(require_slug("title", "Field").is_ok());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote("orders"), "\"orders\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_system_columns() {
        assert!(is_system_column("id"));
        assert!(is_system_column("created_by_app_user_id"));
        assert!(!is_system_column("title"));
    }
}
