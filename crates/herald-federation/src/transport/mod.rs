//! Transport contracts consumed by the federation core.
//!
//! The core never touches sockets directly: it talks to a [`Connector`] that
//! hands out [`Connection`]s, and reacts to the [`ConnectionEvent`]s each
//! connection delivers. Two implementations ship with the crate:
//!
//! * [`tcp`] — newline-delimited JSON frames over TCP, the production path.
//! * [`memory`] — an in-process network for tests and embedding.

pub mod memory;
pub mod tcp;

use std::net::SocketAddr;

use tokio::sync::mpsc;

use herald_proto::Frame;

use crate::error::TransportError;

/// Lifecycle and protocol events delivered by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The transport finished dialing and stream negotiation; `stream_id` is
    /// the acceptor-assigned identifier for this stream.
    Online { stream_id: String },
    /// A decoded wire frame arrived from the peer.
    Frame(Frame),
    /// The connection failed; no further events follow.
    Error(TransportError),
    /// The peer closed the connection; no further events follow.
    Closed,
}

/// Cloneable handle for writing frames to a connection.
///
/// Writes are queued to the connection's pump task; a send only fails once
/// the connection has shut down.
#[derive(Debug, Clone)]
pub struct FrameWriter(mpsc::UnboundedSender<Frame>);

impl FrameWriter {
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// An established (or establishing) connection: a writer handle plus the
/// stream of events the transport delivers for it.
#[derive(Debug)]
pub struct Connection {
    pub writer: FrameWriter,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    /// Create a connection handle together with the transport-side ends used
    /// to service it: the outbound frame queue and the event sender.
    pub fn pipe() -> (
        Self,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { writer: FrameWriter(writer_tx), events: event_rx }, writer_rx, event_tx)
    }
}

/// An accepted inbound connection, past stream negotiation.
#[derive(Debug)]
pub struct InboundConnection {
    /// The stream id this side assigned during negotiation.
    pub stream_id: String,
    /// Peer address, when the transport has one.
    pub remote: Option<SocketAddr>,
    pub writer: FrameWriter,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Factory for outbound connections.
///
/// `connect` returns immediately: dialing and stream negotiation proceed in a
/// background task, and readiness arrives as [`ConnectionEvent::Online`] (or
/// [`ConnectionEvent::Error`] if the dial fails).
pub trait Connector: Send + Sync {
    /// Open a connection from the hosted domain `from` toward the remote
    /// domain `to`.
    fn connect(&self, from: &str, to: &str) -> Connection;
}
