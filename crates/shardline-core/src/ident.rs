//! Identifier rules for table nodes, columns and exclusion rules.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Longest identifier accepted. Mirrored rule names `<child>_<base>` are
/// checked against it as well.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier {0:?} exceeds {MAX_IDENTIFIER_LEN} characters")]
    TooLong(String),

    #[error("identifier {0:?} must start with a letter or underscore and contain only letters, digits and underscores")]
    Malformed(String),
}

/// Check that `name` is a plain identifier.
pub fn validate_identifier(name: &str) -> Result<(), IdentError> {
    if name.is_empty() {
        return Err(IdentError::Empty);
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentError::TooLong(name.to_string()));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(IdentError::Malformed(name.to_string()));
    }
    Ok(())
}
