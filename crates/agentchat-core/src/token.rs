//! Opaque bearer token.
//!
//! The backend hands out a token on login; the client only ever stores it and
//! echoes it back in `Authorization: Bearer <token>` headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A non-empty bearer token, kept exactly as the server issued it.
///
/// `Debug` redacts the value so tokens don't end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a token string. Only blank tokens are refused.
    pub fn new(token: impl Into<String>) -> Result<Self, TokenParseError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(TokenParseError::Empty);
        }
        Ok(Self(token))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

impl FromStr for BearerToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BearerToken {
    type Error = TokenParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<BearerToken> for String {
    fn from(token: BearerToken) -> Self {
        token.0
    }
}

/// Error parsing a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenParseError {
    #[error("bearer token cannot be empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_has_bearer_prefix() {
        let token: BearerToken = "abc.def".parse().unwrap();
        assert_eq!(token.as_str(), "abc.def");
        assert_eq!(token.header_value(), "Bearer abc.def");
    }

    #[test]
    fn rejects_only_blank() {
        assert_eq!(BearerToken::new(""), Err(TokenParseError::Empty));
        assert_eq!(BearerToken::new("   "), Err(TokenParseError::Empty));
    }

    #[test]
    fn keeps_token_verbatim() {
        let token = BearerToken::new(" a b ").unwrap();
        assert_eq!(token.as_str(), " a b ");
    }

    #[test]
    fn debug_redacts() {
        let token = BearerToken::new("secret").unwrap();
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn deserializes_from_string() {
        let token: BearerToken = serde_json::from_str("\"tok\"").unwrap();
        assert_eq!(token.as_str(), "tok");
        assert!(serde_json::from_str::<BearerToken>("\"\"").is_err());
    }
}
