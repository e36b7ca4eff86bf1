//! Federation error types.

use herald_proto::AddressError;
use thiserror::Error;

/// Errors surfaced by the federation core.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Routing ─────────────────────────────────────────────────────────────

    #[error("stanza carries no routable source/destination address")]
    MissingDestination,

    #[error("unroutable address: {0}")]
    Addressing(AddressError),

    // ── Connection lifecycle ─────────────────────────────────────────────────

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("link to domain '{0}' is closed")]
    LinkClosed(String),

    // ── Dialback ────────────────────────────────────────────────────────────

    #[error("dialback verification failed for domain '{0}'")]
    DialbackMismatch(String),
}

impl From<AddressError> for FederationError {
    fn from(err: AddressError) -> Self {
        match err {
            // An absent address is a routing failure, not a parse failure.
            AddressError::Missing => FederationError::MissingDestination,
            other => FederationError::Addressing(other),
        }
    }
}

/// Connection-level failures. Handled at the outbound-link boundary: the
/// failed link is evicted and the next send dials a fresh one.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no route to domain '{0}'")]
    Unreachable(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds the configured maximum length")]
    FrameTooLong,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    #[error("connection closed")]
    Closed,
}
