//! Identifier normalization.

use crate::error::{LimiterError, Result};

/// A canonical storage key naming a program or program group.
///
/// Produced only by [`IdentifierKey::normalize`], so every key in the ledger
/// is trimmed, non-empty, length-bounded and free of control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentifierKey(String);

impl IdentifierKey {
    /// Normalize a caller-supplied name into a storage key.
    ///
    /// Surrounding whitespace is trimmed; everything else is kept verbatim,
    /// including case, so distinct trimmed names always yield distinct keys.
    pub fn normalize(raw: &str, max_len: usize) -> Result<Self> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(LimiterError::InvalidIdentifier(
                "identifier must not be empty".to_string(),
            ));
        }

        let len = trimmed.chars().count();
        if len > max_len {
            return Err(LimiterError::InvalidIdentifier(format!(
                "identifier is {} characters long, limit is {}",
                len, max_len
            )));
        }

        if let Some(c) = trimmed.chars().find(|c| c.is_control()) {
            return Err(LimiterError::InvalidIdentifier(format!(
                "identifier contains control character {:?}",
                c
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
