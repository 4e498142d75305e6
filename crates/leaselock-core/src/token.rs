use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one acquisition attempt.
///
/// A lock is owned by whoever holds the token equal to the record's current
/// value, so a fresh token is generated for every attempt rather than once
/// per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh random token (UUIDv4, 122 random bits).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
