//! # herald-proto
//!
//! Wire-level types shared by every Herald crate: addresses, stanzas, and
//! the federation frame set (stream negotiation + dialback messages).
//! No I/O and no business logic — just the shapes that cross the wire.

pub mod addr;
pub mod frame;
pub mod stanza;

pub use addr::{Address, AddressError};
pub use frame::Frame;
pub use stanza::{Stanza, StanzaKind};
