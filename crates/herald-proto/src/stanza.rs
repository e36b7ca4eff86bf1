//! Stanzas — the routable unit of federation traffic.
//!
//! A stanza carries its source and destination as address strings plus an
//! opaque JSON payload. Stanzas are fully normalized before they reach the
//! routing core: there is no wrapped/unwrapped distinction, and content
//! semantics are never inspected by the router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::addr::{Address, AddressError};

/// The three stanza families of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    /// Directed content (chat messages, notifications).
    Message,
    /// Availability broadcasts.
    Presence,
    /// Request/response exchanges.
    Iq,
}

/// A single routable stanza.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stanza {
    pub kind: StanzaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Sender-assigned stanza id, used for request/response correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Opaque content — the router never looks inside.
    #[serde(default)]
    pub payload: Value,
}

impl Stanza {
    pub fn new(
        kind: StanzaKind,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from: Some(from.into()),
            to: Some(to.into()),
            id: None,
            payload: Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Domain of the source address, erroring when `from` is absent or
    /// unparseable.
    pub fn from_domain(&self) -> Result<String, AddressError> {
        self.from.as_deref().ok_or(AddressError::Missing).and_then(Address::domain_of)
    }

    /// Domain of the destination address, erroring when `to` is absent or
    /// unparseable.
    pub fn to_domain(&self) -> Result<String, AddressError> {
        self.to.as_deref().ok_or(AddressError::Missing).and_then(Address::domain_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_shape() {
        let stanza = Stanza::new(StanzaKind::Message, "alice@a.example", "bob@b.example")
            .with_id("m1")
            .with_payload(json!({ "body": "hi" }));

        let wire = serde_json::to_value(&stanza).unwrap();
        assert_eq!(wire["kind"], "message");
        assert_eq!(wire["from"], "alice@a.example");
        assert_eq!(wire["to"], "bob@b.example");
        assert_eq!(wire["payload"]["body"], "hi");

        let back: Stanza = serde_json::from_value(wire).unwrap();
        assert_eq!(back, stanza);
    }

    #[test]
    fn absent_addresses_are_omitted() {
        let mut stanza = Stanza::new(StanzaKind::Presence, "a.example", "b.example");
        stanza.from = None;
        let wire = serde_json::to_value(&stanza).unwrap();
        assert!(wire.get("from").is_none());
    }

    #[test]
    fn domain_accessors_resolve_or_reject() {
        let stanza = Stanza::new(StanzaKind::Message, "alice@a.example/desk", "Bob@B.Example");
        assert_eq!(stanza.from_domain().unwrap(), "a.example");
        assert_eq!(stanza.to_domain().unwrap(), "b.example");

        let mut bare = stanza.clone();
        bare.from = None;
        assert_eq!(bare.from_domain(), Err(AddressError::Missing));

        let mut broken = stanza;
        broken.to = Some("bob@".to_owned());
        assert!(matches!(broken.to_domain(), Err(AddressError::EmptyDomain(_))));
    }
}
