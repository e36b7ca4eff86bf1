//! Federation wire frames.
//!
//! Every message exchanged on an S2S connection is one [`Frame`], serialized
//! as a single line of JSON tagged by `"type"`:
//!
//! | type           | direction            | purpose                                    |
//! |----------------|----------------------|--------------------------------------------|
//! | `stream.open`  | dialer → acceptor    | open a stream, declaring both domains      |
//! | `stream.ack`   | acceptor → dialer    | accept, assigning the stream id            |
//! | `db.key`       | originator → receiver| dialback step 1: present the generated key |
//! | `db.verify`    | receiver → authoritative | step 2: ask the claimed origin to confirm |
//! | `db.verified`  | authoritative → receiver | step 3: confirmation verdict           |
//! | `db.result`    | receiver → originator| step 4: final outcome for the inbound link |
//! | `stanza`       | either               | routed traffic (only after verification)   |

use serde::{Deserialize, Serialize};

use crate::stanza::Stanza;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Stream negotiation, sent by the dialing side immediately after connect.
    #[serde(rename = "stream.open")]
    StreamOpen { from: String, to: String },

    /// Stream negotiation reply; `id` is the acceptor-assigned stream id.
    #[serde(rename = "stream.ack")]
    StreamAck { id: String },

    /// Dialback key announcement.
    #[serde(rename = "db.key")]
    DialbackKey { from: String, to: String, key: String },

    /// Dialback verification request, carrying the stream id and key the
    /// receiver saw on its inbound connection.
    #[serde(rename = "db.verify")]
    DialbackVerify { from: String, to: String, id: String, key: String },

    /// Authoritative verdict for a `db.verify`.
    #[serde(rename = "db.verified")]
    DialbackVerified { from: String, to: String, id: String, valid: bool },

    /// Final dialback outcome for an inbound connection.
    #[serde(rename = "db.result")]
    DialbackResult { from: String, to: String, valid: bool },

    /// Routed traffic.
    #[serde(rename = "stanza")]
    Stanza(Stanza),
}

impl Frame {
    pub fn dialback_key(
        from: impl Into<String>,
        to: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::DialbackKey { from: from.into(), to: to.into(), key: key.into() }
    }

    pub fn dialback_verify(
        from: impl Into<String>,
        to: impl Into<String>,
        id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::DialbackVerify {
            from: from.into(),
            to: to.into(),
            id: id.into(),
            key: key.into(),
        }
    }

    pub fn dialback_verified(
        from: impl Into<String>,
        to: impl Into<String>,
        id: impl Into<String>,
        valid: bool,
    ) -> Self {
        Self::DialbackVerified { from: from.into(), to: to.into(), id: id.into(), valid }
    }

    pub fn dialback_result(
        from: impl Into<String>,
        to: impl Into<String>,
        valid: bool,
    ) -> Self {
        Self::DialbackResult { from: from.into(), to: to.into(), valid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::StanzaKind;

    #[test]
    fn tagged_shape() {
        let frame = Frame::dialback_key("a.example", "b.example", "1234567890123456");
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "db.key");
        assert_eq!(wire["from"], "a.example");
        assert_eq!(wire["key"], "1234567890123456");
    }

    #[test]
    fn stanza_frame_keeps_stanza_fields_flat() {
        let frame = Frame::Stanza(Stanza::new(StanzaKind::Message, "a.example", "b.example"));
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "stanza");
        assert_eq!(wire["kind"], "message");

        let back: Frame = serde_json::from_value(wire).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn verdict_frames_round_trip() {
        for frame in [
            Frame::dialback_verified("a.example", "b.example", "s1", true),
            Frame::dialback_result("b.example", "a.example", false),
        ] {
            let line = serde_json::to_string(&frame).unwrap();
            let back: Frame = serde_json::from_str(&line).unwrap();
            assert_eq!(back, frame);
        }
    }
}
