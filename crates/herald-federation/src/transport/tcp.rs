//! TCP transport: newline-delimited JSON frames.
//!
//! Stream negotiation is a single round trip. The dialing side opens with
//! `stream.open` carrying both domain names; the accepting side assigns a
//! fresh stream id and answers `stream.ack`. That id is what dialback later
//! binds its keys to, so both ends must agree on it before any other frame.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use uuid::Uuid;

use herald_proto::Frame;

use crate::error::TransportError;
use crate::transport::{Connection, ConnectionEvent, Connector, InboundConnection};

/// Default cap on a single frame line.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Dials remote domains on a fixed S2S port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new(port: u16) -> Self {
        Self { port, max_frame_bytes: DEFAULT_MAX_FRAME_BYTES }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&self, from: &str, to: &str) -> Connection {
        let (connection, writer_rx, event_tx) = Connection::pipe();
        let (from, to) = (from.to_owned(), to.to_owned());
        let (port, max_frame_bytes) = (self.port, self.max_frame_bytes);

        tokio::spawn(async move {
            match dial(&from, &to, port, max_frame_bytes).await {
                Ok((framed, stream_id)) => {
                    debug!(%from, %to, id = %stream_id, "outbound stream negotiated");
                    if event_tx.send(ConnectionEvent::Online { stream_id }).is_err() {
                        return;
                    }
                    pump(framed, writer_rx, event_tx).await;
                }
                Err(err) => {
                    let _ = event_tx.send(ConnectionEvent::Error(err));
                }
            }
        });

        connection
    }
}

/// Accept the inbound half of stream negotiation on a freshly accepted
/// socket, assigning the stream id this side will vouch for.
pub async fn accept<S>(
    io: S,
    remote: Option<SocketAddr>,
    max_frame_bytes: usize,
) -> Result<InboundConnection, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(io, LinesCodec::new_with_max_length(max_frame_bytes));
    match read_frame(&mut framed).await? {
        Some(Frame::StreamOpen { from, to }) => {
            let stream_id = Uuid::new_v4().simple().to_string();
            send_frame(&mut framed, &Frame::StreamAck { id: stream_id.clone() }).await?;
            debug!(%from, %to, id = %stream_id, "inbound stream negotiated");

            let (connection, writer_rx, event_tx) = Connection::pipe();
            tokio::spawn(pump(framed, writer_rx, event_tx));
            Ok(InboundConnection {
                stream_id,
                remote,
                writer: connection.writer,
                events: connection.events,
            })
        }
        Some(frame) => Err(TransportError::Negotiation(format!(
            "expected stream.open, got {frame:?}"
        ))),
        None => Err(TransportError::Closed),
    }
}

async fn dial(
    from: &str,
    to: &str,
    port: u16,
    max_frame_bytes: usize,
) -> Result<(Framed<TcpStream, LinesCodec>, String), TransportError> {
    let addr = format!("{to}:{port}");
    let socket = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransportError::Connect { addr: addr.clone(), source })?;
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(max_frame_bytes));
    negotiate_outbound(framed, from, to).await
}

/// Outbound half of stream negotiation: announce both domains, then wait for
/// the acceptor's stream id.
async fn negotiate_outbound<S>(
    mut framed: Framed<S, LinesCodec>,
    from: &str,
    to: &str,
) -> Result<(Framed<S, LinesCodec>, String), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let open = Frame::StreamOpen { from: from.to_owned(), to: to.to_owned() };
    send_frame(&mut framed, &open).await?;
    match read_frame(&mut framed).await? {
        Some(Frame::StreamAck { id }) => Ok((framed, id)),
        Some(frame) => Err(TransportError::Negotiation(format!(
            "expected stream.ack, got {frame:?}"
        ))),
        None => Err(TransportError::Closed),
    }
}

/// Shuttle frames between the socket and the connection's channel pair until
/// either side goes away.
async fn pump<S>(
    mut framed: Framed<S, LinesCodec>,
    mut writer_rx: mpsc::UnboundedReceiver<Frame>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            outbound = writer_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(err) = send_frame(&mut framed, &frame).await {
                        let _ = event_tx.send(ConnectionEvent::Error(err));
                        return;
                    }
                }
                // All writer handles dropped: local close.
                None => return,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                    Ok(frame) => {
                        if event_tx.send(ConnectionEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = event_tx.send(ConnectionEvent::Error(err.into()));
                        return;
                    }
                },
                Some(Err(err)) => {
                    let _ = event_tx.send(ConnectionEvent::Error(codec_error(err)));
                    return;
                }
                None => {
                    let _ = event_tx.send(ConnectionEvent::Closed);
                    return;
                }
            },
        }
    }
}

async fn send_frame<S>(
    framed: &mut Framed<S, LinesCodec>,
    frame: &Frame,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(frame)?;
    framed.send(line).await.map_err(codec_error)
}

async fn read_frame<S>(
    framed: &mut Framed<S, LinesCodec>,
) -> Result<Option<Frame>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(line)) => Ok(Some(serde_json::from_str(&line)?)),
        Some(Err(err)) => Err(codec_error(err)),
        None => Ok(None),
    }
}

fn codec_error(err: LinesCodecError) -> TransportError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => TransportError::FrameTooLong,
        LinesCodecError::Io(io) => TransportError::Io(io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_proto::{Stanza, StanzaKind};

    #[tokio::test]
    async fn negotiation_agrees_on_the_acceptor_assigned_id() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(accept(server_io, None, DEFAULT_MAX_FRAME_BYTES));
        let client = Framed::new(client_io, LinesCodec::new_with_max_length(DEFAULT_MAX_FRAME_BYTES));
        let (client, client_seen_id) =
            negotiate_outbound(client, "a.example", "b.example").await.unwrap();

        let inbound = server.await.unwrap().unwrap();
        assert_eq!(inbound.stream_id, client_seen_id);
        drop(client);
    }

    #[tokio::test]
    async fn frames_cross_the_pump_in_both_directions() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(accept(server_io, None, DEFAULT_MAX_FRAME_BYTES));
        let client = Framed::new(client_io, LinesCodec::new_with_max_length(DEFAULT_MAX_FRAME_BYTES));
        let (mut client, _) = negotiate_outbound(client, "a.example", "b.example").await.unwrap();
        let mut inbound = server.await.unwrap().unwrap();

        // client → server
        let stanza = Frame::Stanza(Stanza::new(StanzaKind::Message, "a.example", "b.example"));
        let line = serde_json::to_string(&stanza).unwrap();
        client.send(line).await.unwrap();
        match inbound.events.recv().await {
            Some(ConnectionEvent::Frame(frame)) => assert_eq!(frame, stanza),
            other => panic!("expected stanza frame, got {other:?}"),
        }

        // server → client
        inbound.writer.send(Frame::dialback_result("b.example", "a.example", true)).unwrap();
        let line = client.next().await.unwrap().unwrap();
        let frame: Frame = serde_json::from_str(&line).unwrap();
        assert_eq!(frame, Frame::dialback_result("b.example", "a.example", true));
    }

    #[tokio::test]
    async fn rejecting_garbage_kills_the_connection() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(accept(server_io, None, DEFAULT_MAX_FRAME_BYTES));
        let client = Framed::new(client_io, LinesCodec::new_with_max_length(DEFAULT_MAX_FRAME_BYTES));
        let (mut client, _) = negotiate_outbound(client, "a.example", "b.example").await.unwrap();
        let mut inbound = server.await.unwrap().unwrap();

        client.send("not json".to_owned()).await.unwrap();
        match inbound.events.recv().await {
            Some(ConnectionEvent::Error(TransportError::Malformed(_))) => {}
            other => panic!("expected malformed-frame error, got {other:?}"),
        }
    }
}
