//! Short, content-derived error identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;

/// Number of hex characters kept from the SHA-256 digest.
pub const ERROR_ID_LENGTH: usize = 8;

/// Truncated hex SHA-256 of an error's message (or of a failed command's tokens).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(String);

impl ErrorId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for ErrorId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ErrorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ErrorId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ErrorId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl From<&str> for ErrorId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ErrorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Hash the concatenation of `parts` into an [`ErrorId`].
///
/// Parts are fed to the digest back to back with no separator, so
/// `["ab", "c"]` and `["abc"]` share an ID. The result depends only on the
/// UTF-8 bytes of the input.
pub fn generate_error_id<I, S>(parts: I) -> ErrorId
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(ERROR_ID_LENGTH);
    ErrorId(hex)
}
