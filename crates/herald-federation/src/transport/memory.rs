//! In-process transport: a federation network that never leaves the process.
//!
//! Domains are hosted by registering an acceptor with [`MemoryNetwork::host`];
//! dialing a hosted domain wires the two ends together with channel shuttles
//! and performs the same stream-id negotiation the TCP transport does. Used
//! by the end-to-end tests and available to embedders that want to federate
//! local domains without sockets.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use herald_proto::Frame;

use crate::error::TransportError;
use crate::transport::{Connection, ConnectionEvent, Connector, InboundConnection};

/// An in-process federation network.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    acceptors: Mutex<HashMap<String, mpsc::UnboundedSender<InboundConnection>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `domain` on this network. Connections dialed toward it arrive on
    /// the returned receiver; dropping the receiver unhosts the domain.
    pub fn host(&self, domain: &str) -> mpsc::UnboundedReceiver<InboundConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.acceptors
            .lock()
            .expect("acceptor registry poisoned")
            .insert(domain.to_owned(), tx);
        rx
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, from: &str, to: &str) -> Connection {
        let (connection, client_writer_rx, client_event_tx) = Connection::pipe();

        let acceptor = self.acceptors.lock().expect("acceptor registry poisoned").get(to).cloned();
        let Some(acceptor) = acceptor else {
            let _ = client_event_tx.send(ConnectionEvent::Error(TransportError::Unreachable(
                to.to_owned(),
            )));
            return connection;
        };

        let stream_id = Uuid::new_v4().simple().to_string();
        let (server_side, server_writer_rx, server_event_tx) = Connection::pipe();
        let inbound = InboundConnection {
            stream_id: stream_id.clone(),
            remote: None,
            writer: server_side.writer,
            events: server_side.events,
        };

        if acceptor.send(inbound).is_err() {
            // Host dropped its receiver since we looked it up.
            let _ = client_event_tx.send(ConnectionEvent::Error(TransportError::Unreachable(
                to.to_owned(),
            )));
            return connection;
        }

        trace!(%from, %to, id = %stream_id, "memory stream established");
        tokio::spawn(shuttle(client_writer_rx, server_event_tx));
        tokio::spawn(shuttle(server_writer_rx, client_event_tx.clone()));
        let _ = client_event_tx.send(ConnectionEvent::Online { stream_id });

        connection
    }
}

/// Forward written frames to the peer's event stream; report `Closed` once
/// the writing side goes away.
async fn shuttle(
    mut writer_rx: mpsc::UnboundedReceiver<Frame>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(frame) = writer_rx.recv().await {
        if event_tx.send(ConnectionEvent::Frame(frame)).is_err() {
            return;
        }
    }
    let _ = event_tx.send(ConnectionEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dialing_an_unhosted_domain_fails() {
        let net = MemoryNetwork::new();
        let mut conn = net.connect("a.example", "nowhere.example");
        match conn.events.recv().await {
            Some(ConnectionEvent::Error(TransportError::Unreachable(domain))) => {
                assert_eq!(domain, "nowhere.example");
            }
            other => panic!("expected unreachable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_ends_share_the_stream_id_and_exchange_frames() {
        let net = MemoryNetwork::new();
        let mut inbound_rx = net.host("b.example");

        let mut conn = net.connect("a.example", "b.example");
        let stream_id = match conn.events.recv().await {
            Some(ConnectionEvent::Online { stream_id }) => stream_id,
            other => panic!("expected online, got {other:?}"),
        };

        let mut inbound = inbound_rx.recv().await.unwrap();
        assert_eq!(inbound.stream_id, stream_id);

        conn.writer.send(Frame::dialback_key("a.example", "b.example", "123")).unwrap();
        match inbound.events.recv().await {
            Some(ConnectionEvent::Frame(Frame::DialbackKey { key, .. })) => assert_eq!(key, "123"),
            other => panic!("expected key frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let net = MemoryNetwork::new();
        let mut inbound_rx = net.host("b.example");

        let conn = net.connect("a.example", "b.example");
        let mut inbound = inbound_rx.recv().await.unwrap();

        drop(conn);
        loop {
            match inbound.events.recv().await {
                Some(ConnectionEvent::Closed) | None => break,
                Some(_) => continue,
            }
        }
    }
}
