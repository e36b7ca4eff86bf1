//! Process-wide federation entry point.
//!
//! The [`Router`] owns one [`DomainContext`] per locally hosted domain and
//! wires the dialback roles onto inbound connections:
//!
//! | frame       | role          | handling                                        |
//! |-------------|---------------|-------------------------------------------------|
//! | `db.verify` | Authoritative | check our own outbound record, answer in place  |
//! | `db.key`    | Receiver      | confirm with the claimed origin before trusting |
//! | `stanza`    | —             | publish to local subscribers                    |
//!
//! Trust is only ever tracked on the outbound side, per dialback's
//! asymmetric design: accepting a stanza requires no verified state about
//! the sender beyond the handshake that completed on the matching outbound
//! link.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use herald_proto::{Frame, Stanza};

use crate::context::{DomainContext, InboundPeer};
use crate::error::FederationError;
use crate::transport::{tcp, ConnectionEvent, Connector, FrameWriter, InboundConnection};

/// Capacity of the inbound-stanza broadcast channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

/// Process-wide federation router.
pub struct Router {
    connector: Arc<dyn Connector>,
    contexts: RwLock<HashMap<String, Arc<DomainContext>>>,
    stanza_tx: broadcast::Sender<Stanza>,
}

impl Router {
    /// Create a router dispatching outbound connections through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        let (stanza_tx, _) = broadcast::channel(DELIVERY_CHANNEL_CAPACITY);
        Arc::new(Self { connector, contexts: RwLock::new(HashMap::new()), stanza_tx })
    }

    /// Route an outbound stanza: resolve the hosted domain from the stanza's
    /// source address and delegate to that domain's context.
    pub async fn send(self: &Arc<Self>, stanza: Stanza) -> Result<(), FederationError> {
        let domain = stanza.from_domain()?;
        self.get_context(&domain).await.send(stanza).await
    }

    /// Fetch or lazily create the context for a hosted domain.
    pub async fn get_context(self: &Arc<Self>, domain: &str) -> Arc<DomainContext> {
        if let Some(ctx) = self.contexts.read().await.get(domain) {
            return Arc::clone(ctx);
        }

        let mut contexts = self.contexts.write().await;
        if let Some(ctx) = contexts.get(domain) {
            return Arc::clone(ctx);
        }
        let ctx = DomainContext::new(domain.to_owned(), Arc::clone(&self.connector));
        contexts.insert(domain.to_owned(), Arc::clone(&ctx));
        debug!(%domain, "created domain context");
        ctx
    }

    pub async fn has_context(&self, domain: &str) -> bool {
        self.contexts.read().await.contains_key(domain)
    }

    /// Authoritative dialback check: true only if we host `to` and its
    /// outbound record toward `from` carries exactly this stream id and key.
    pub async fn verify_dialback(&self, from: &str, to: &str, id: &str, key: &str) -> bool {
        let ctx = self.contexts.read().await.get(to).cloned();
        match ctx {
            Some(ctx) => ctx.verify_dialback(from, id, key).await,
            None => false,
        }
    }

    /// Attach the Receiver and Authoritative roles to a freshly accepted
    /// inbound connection.
    pub fn accept_connection(self: &Arc<Self>, inbound: InboundConnection) {
        tokio::spawn(run_inbound(Arc::clone(self), inbound));
    }

    /// Bind the S2S listener and accept inbound connections until aborted.
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        max_frame_bytes: usize,
    ) -> io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "s2s listener bound");

        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            match tcp::accept(socket, Some(peer), max_frame_bytes).await {
                                Ok(inbound) => router.accept_connection(inbound),
                                Err(err) => debug!(%peer, %err, "inbound negotiation failed"),
                            }
                        });
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }))
    }

    /// Subscribe to stanzas delivered by remote peers.
    pub fn subscribe(&self) -> broadcast::Receiver<Stanza> {
        self.stanza_tx.subscribe()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

/// Dispatch loop for one inbound connection.
async fn run_inbound(router: Arc<Router>, inbound: InboundConnection) {
    let InboundConnection { stream_id, remote, writer, mut events } = inbound;
    debug!(?remote, id = %stream_id, "inbound connection attached");

    while let Some(event) = events.recv().await {
        match event {
            // Authoritative role: a remote receiver asks us to confirm a key
            // we generated for one of our own outbound links. The verdict
            // goes back on the connection the question arrived on.
            ConnectionEvent::Frame(Frame::DialbackVerify { from, to, id, key }) => {
                let valid = router.verify_dialback(&from, &to, &id, &key).await;
                debug!(%from, %to, id = %id, valid, "answered dialback verify");
                let _ = writer.send(Frame::dialback_verified(to, from, id, valid));
            }
            // Receiver role: the peer presents a key for this inbound
            // connection. Spawned per handshake so a stalled verification
            // never blocks other traffic on this connection.
            ConnectionEvent::Frame(Frame::DialbackKey { from, to, key }) => {
                tokio::spawn(receiver_handshake(
                    Arc::clone(&router),
                    writer.clone(),
                    stream_id.clone(),
                    from,
                    to,
                    key,
                ));
            }
            ConnectionEvent::Frame(Frame::Stanza(stanza)) => {
                trace!(from = stanza.from.as_deref().unwrap_or("-"), "inbound stanza");
                let _ = router.stanza_tx.send(stanza);
            }
            ConnectionEvent::Frame(frame) => {
                trace!(?frame, "ignoring frame on inbound connection");
            }
            ConnectionEvent::Online { .. } => {}
            ConnectionEvent::Error(err) => {
                debug!(?remote, id = %stream_id, %err, "inbound connection failed");
                break;
            }
            ConnectionEvent::Closed => {
                debug!(?remote, id = %stream_id, "inbound connection closed");
                break;
            }
        }
    }
}

/// Receiver role for one `db.key`: have the claimed origin's authoritative
/// server confirm the key, then report the outcome on the inbound connection
/// the key arrived on — that wire's far end is the originator's outbound
/// link, which is waiting on exactly this `db.result` to mark itself
/// verified.
async fn receiver_handshake(
    router: Arc<Router>,
    inbound_writer: FrameWriter,
    inbound_stream: String,
    from: String,
    to: String,
    key: String,
) {
    let ctx = router.get_context(&to).await;
    let link = ctx.outbound_link(&from).await;

    // Subscribe before the verify goes out so a fast verdict cannot slip by.
    let mut verdicts = link.subscribe_verified();
    link.send_when_online(Frame::dialback_verify(
        to.as_str(),
        from.as_str(),
        inbound_stream.as_str(),
        key,
    ))
    .await;

    loop {
        tokio::select! {
            verdict = verdicts.recv() => match verdict {
                Ok(notice) if notice.stream_id == inbound_stream => {
                    let _ = inbound_writer.send(Frame::dialback_result(
                        to.as_str(),
                        from.as_str(),
                        notice.valid,
                    ));
                    if notice.valid {
                        ctx.register_inbound(
                            &from,
                            InboundPeer { stream_id: inbound_stream, writer: inbound_writer },
                        )
                        .await;
                        info!(host = %to, remote = %from, "inbound connection verified");
                    } else {
                        warn!(host = %to, remote = %from, "dialback key rejected by authoritative server");
                    }
                    return;
                }
                // Verdict for a different handshake sharing this link.
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "verdict subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            // The link toward the claimed origin died; nothing can finish
            // this handshake anymore.
            _ = link.failed() => {
                debug!(host = %to, remote = %from, "verification link failed before a verdict");
                return;
            }
        }
    }
}
