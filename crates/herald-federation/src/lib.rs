//! # herald-federation
//!
//! The server-to-server (S2S) federation core of Herald: accepts inbound
//! connections from remote domains, opens and reuses outbound connections
//! toward them, and establishes mutual trust with the three-party dialback
//! handshake before any stanza is allowed to flow.
//!
//! ```text
//!  originator O                      receiver R
//!       │                                │
//!       ├────── db.key{K} ─────────────► │            (O's outbound link)
//!       │                                ├─ db.verify{S,K} ─► O   (R's own link back)
//!       │                                │ ◄─ db.verified{S,ok} ─┘
//!       │ ◄───── db.result{ok} ───────── │            (same wire the key used)
//!       │                                │
//!  link verified — queued stanzas flush, new sends go straight out
//! ```
//!
//! ## Key concepts
//!
//! - **Router** (`router.rs`): process-wide entry point; one context per
//!   hosted domain, plus the Receiver/Authoritative role wiring for inbound
//!   connections.
//! - **Domain context** (`context.rs`): per-hosted-domain cache of outbound
//!   links, created lazily and evicted on failure.
//! - **Outbound link** (`link.rs`): one connection toward one remote domain;
//!   an explicit `Connecting → Online → Verified` state machine with a FIFO
//!   queue for stanzas awaiting trust.
//! - **Dialback** (`dialback.rs`): the trust protocol's roles and key
//!   material.
//! - **Transport** (`transport/`): the connector contract, the TCP
//!   line-delimited JSON implementation, and an in-process network for
//!   tests and embedding.

pub mod context;
pub mod dialback;
pub mod error;
pub mod link;
pub mod router;
pub mod transport;

pub use context::{DomainContext, InboundPeer};
pub use error::{FederationError, TransportError};
pub use link::{LinkPhase, OutboundLink, VerifiedNotice};
pub use router::Router;

pub use herald_proto::{Address, AddressError, Frame, Stanza, StanzaKind};
