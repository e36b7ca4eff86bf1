//! Federation addresses.
//!
//! An address names an endpoint as `local@domain/resource`, where both the
//! local part and the resource are optional: `b.example`, `alice@b.example`
//! and `alice@b.example/desk` are all valid. S2S routing only ever looks at
//! the domain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is missing")]
    Missing,

    #[error("address is empty")]
    Empty,

    #[error("address '{0}' has an empty domain")]
    EmptyDomain(String),

    #[error("address '{0}' has an empty local part")]
    EmptyLocal(String),

    #[error("address '{0}' has an empty resource")]
    EmptyResource(String),
}

/// A parsed federation address.
///
/// The domain is ASCII-lowercased at parse time so that `B.Example` and
/// `b.example` compare equal everywhere downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub local: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

impl Address {
    /// Parse `local@domain/resource` with optional local part and resource.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        // The resource starts at the first '/', and may itself contain '/'.
        let (bare, resource) = match raw.split_once('/') {
            Some((bare, resource)) => {
                if resource.is_empty() {
                    return Err(AddressError::EmptyResource(raw.to_owned()));
                }
                (bare, Some(resource.to_owned()))
            }
            None => (raw, None),
        };

        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(AddressError::EmptyLocal(raw.to_owned()));
                }
                (Some(local.to_owned()), domain)
            }
            None => (None, bare),
        };

        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(raw.to_owned()));
        }

        Ok(Self { local, domain: domain.to_ascii_lowercase(), resource })
    }

    /// Extract just the domain of a raw address string.
    pub fn domain_of(raw: &str) -> Result<String, AddressError> {
        Ok(Self::parse(raw)?.domain)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_forms() {
        let full = Address::parse("alice@b.example/desk").unwrap();
        assert_eq!(full.local.as_deref(), Some("alice"));
        assert_eq!(full.domain, "b.example");
        assert_eq!(full.resource.as_deref(), Some("desk"));

        let bare = Address::parse("b.example").unwrap();
        assert_eq!(bare.local, None);
        assert_eq!(bare.domain, "b.example");
        assert_eq!(bare.resource, None);

        let no_resource = Address::parse("alice@b.example").unwrap();
        assert_eq!(no_resource.local.as_deref(), Some("alice"));
        assert_eq!(no_resource.resource, None);
    }

    #[test]
    fn domain_is_lowercased() {
        assert_eq!(Address::domain_of("Alice@B.Example").unwrap(), "b.example");
    }

    #[test]
    fn resource_may_contain_slashes() {
        let addr = Address::parse("alice@b.example/home/desk").unwrap();
        assert_eq!(addr.resource.as_deref(), Some("home/desk"));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(Address::parse("@b.example"), Err(AddressError::EmptyLocal(_))));
        assert!(matches!(Address::parse("alice@"), Err(AddressError::EmptyDomain(_))));
        assert!(matches!(Address::parse("alice@b.example/"), Err(AddressError::EmptyResource(_))));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["b.example", "alice@b.example", "alice@b.example/desk"] {
            assert_eq!(Address::parse(raw).unwrap().to_string(), raw);
        }
    }
}
