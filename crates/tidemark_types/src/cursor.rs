//! Opaque pull cursor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque marker of pull progress against the remote store.
///
/// The cursor is owned by the sync engine and advanced only after a
/// pull batch has been fully applied. Its contents are a token minted
/// by the remote gateway; the core never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// The position before anything has been pulled.
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    /// Wraps a gateway-minted token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Returns true if nothing has been pulled yet.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_start() {
            write!(f, "cursor:start")
        } else {
            write!(f, "cursor:{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_empty() {
        assert!(SyncCursor::start().is_start());
        assert!(!SyncCursor::from_token("42").is_start());
    }

    #[test]
    fn token_roundtrip() {
        let c = SyncCursor::from_token("page-17");
        assert_eq!(c.token(), "page-17");
        assert_eq!(c.to_string(), "cursor:page-17");
    }
}
