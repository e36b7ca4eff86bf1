//! Per-hosted-domain federation state.
//!
//! A [`DomainContext`] owns every outbound link from one locally hosted
//! domain, creating them lazily on first use and evicting them on failure so
//! a broken connection never lingers as a false cache hit. It also keeps the
//! registry of inbound peers that have completed dialback toward this domain.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use herald_proto::{Frame, Stanza};

use crate::dialback;
use crate::error::FederationError;
use crate::link::{LinkEvent, OutboundLink, VerifiedNotice};
use crate::transport::{Connection, ConnectionEvent, Connector, FrameWriter};

/// A remote domain whose inbound connection toward us has passed dialback.
#[derive(Debug, Clone)]
pub struct InboundPeer {
    /// Stream id we assigned to the inbound connection.
    pub stream_id: String,
    pub(crate) writer: FrameWriter,
}

impl InboundPeer {
    /// Write a frame to the verified inbound connection.
    pub fn send(&self, frame: Frame) -> Result<(), crate::error::TransportError> {
        self.writer.send(frame)
    }
}

/// State for one locally hosted domain: its outbound links to federated
/// peers and the inbound peers verified against it.
pub struct DomainContext {
    domain: String,
    connector: Arc<dyn Connector>,
    outbound: RwLock<HashMap<String, Arc<OutboundLink>>>,
    inbound: RwLock<HashMap<String, InboundPeer>>,
}

impl DomainContext {
    pub(crate) fn new(domain: String, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            domain,
            connector,
            outbound: RwLock::new(HashMap::new()),
            inbound: RwLock::new(HashMap::new()),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Queued send: transmits immediately over a verified link, buffers in
    /// FIFO order otherwise. The pending queue is unbounded; callers that
    /// care about memory must throttle above this layer.
    pub async fn send(self: &Arc<Self>, stanza: Stanza) -> Result<(), FederationError> {
        let dest = stanza.to_domain()?;

        // A link that failed between lookup and use is evicted and redialed
        // once instead of surfacing the race to the caller.
        for _ in 0..2 {
            let link = self.outbound_link(&dest).await;
            match link.enqueue_or_send(stanza.clone()).await {
                Err(FederationError::LinkClosed(_)) => {
                    self.evict(&link).await;
                }
                other => return other,
            }
        }
        Err(FederationError::LinkClosed(dest))
    }

    /// Raw send for dialback control traffic: never enters the pending
    /// queue, defers (once) until the link comes online instead. Returns the
    /// link so the caller can watch it for the handshake's next message.
    pub async fn send_raw(self: &Arc<Self>, frame: Frame, dest: &str) -> Arc<OutboundLink> {
        let link = self.outbound_link(dest).await;
        link.send_when_online(frame).await;
        link
    }

    /// Fetch or lazily create the outbound link toward `domain`, spawning
    /// its dispatch loop on creation.
    pub async fn outbound_link(self: &Arc<Self>, domain: &str) -> Arc<OutboundLink> {
        if let Some(link) = self.outbound.read().await.get(domain) {
            return Arc::clone(link);
        }

        let mut outbound = self.outbound.write().await;
        // Someone else may have created it while we waited for the lock.
        if let Some(link) = outbound.get(domain) {
            return Arc::clone(link);
        }

        let Connection { writer, events } = self.connector.connect(&self.domain, domain);
        let link = Arc::new(OutboundLink::new(self.domain.clone(), domain.to_owned(), writer));
        outbound.insert(domain.to_owned(), Arc::clone(&link));
        debug!(host = %self.domain, remote = %domain, "opened outbound link");
        tokio::spawn(run_link(Arc::clone(self), Arc::clone(&link), events));
        link
    }

    /// Authoritative dialback check: true iff we hold an outbound record
    /// toward `remote_domain` whose stream id and generated key match the
    /// arguments exactly. When such a record exists, the verdict is also
    /// announced to the remote with a `db.result` on that link, whatever the
    /// outcome; with no record there is nothing to reply on.
    pub async fn verify_dialback(&self, remote_domain: &str, stream_id: &str, key: &str) -> bool {
        let link = self.outbound.read().await.get(remote_domain).cloned();
        match link {
            Some(link) => {
                let valid = link.matches(stream_id, key).await;
                link.send_when_online(Frame::dialback_result(
                    self.domain.clone(),
                    remote_domain,
                    valid,
                ))
                .await;
                valid
            }
            None => false,
        }
    }

    pub async fn has_outbound(&self, domain: &str) -> bool {
        self.outbound.read().await.contains_key(domain)
    }

    /// Drop `link` from the outbound map. Identity-checked so a failed link
    /// can never evict the fresh one that already replaced it.
    pub(crate) async fn evict(&self, link: &Arc<OutboundLink>) {
        let mut outbound = self.outbound.write().await;
        if outbound.get(link.remote()).is_some_and(|current| Arc::ptr_eq(current, link)) {
            outbound.remove(link.remote());
            debug!(host = %self.domain, remote = %link.remote(), "evicted outbound link");
        }
    }

    /// Record a remote domain whose inbound connection completed dialback.
    pub(crate) async fn register_inbound(&self, domain: &str, peer: InboundPeer) {
        self.inbound.write().await.insert(domain.to_owned(), peer);
    }

    pub async fn has_inbound(&self, domain: &str) -> bool {
        self.inbound.read().await.contains_key(domain)
    }

    /// The verified inbound peer for `domain`, if one has completed dialback.
    pub async fn inbound_peer(&self, domain: &str) -> Option<InboundPeer> {
        self.inbound.read().await.get(domain).cloned()
    }
}

impl std::fmt::Debug for DomainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainContext").field("domain", &self.domain).finish_non_exhaustive()
    }
}

/// Per-link dispatch loop: feeds connection events through the link's state
/// machine in arrival order and finishes the resulting actions. Ends when
/// the link is evicted or its event stream dries up.
async fn run_link(
    ctx: Arc<DomainContext>,
    link: Arc<OutboundLink>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let applied = match event {
            ConnectionEvent::Online { stream_id } => {
                let key = dialback::generate_key();
                link.apply(LinkEvent::Online { stream_id, key }).await
            }
            ConnectionEvent::Frame(Frame::DialbackResult { valid, .. }) => {
                if !valid {
                    let err = FederationError::DialbackMismatch(link.remote().to_owned());
                    warn!(host = %ctx.domain, %err, "authoritative server refused our key");
                }
                link.apply(LinkEvent::Result { valid }).await
            }
            ConnectionEvent::Frame(Frame::DialbackVerified { from, to, id, valid }) => {
                // Verdict for a Receiver-role handshake riding this link.
                link.publish_verified(VerifiedNotice { from, to, stream_id: id, valid });
                continue;
            }
            ConnectionEvent::Frame(frame) => {
                trace!(host = %ctx.domain, remote = %link.remote(), ?frame, "ignoring frame on outbound link");
                continue;
            }
            ConnectionEvent::Error(err) => {
                warn!(host = %ctx.domain, remote = %link.remote(), %err, "outbound link failed");
                link.apply(LinkEvent::ConnectionLost).await
            }
            ConnectionEvent::Closed => {
                debug!(host = %ctx.domain, remote = %link.remote(), "outbound link closed by peer");
                link.apply(LinkEvent::ConnectionLost).await
            }
        };

        if applied.sent_key {
            debug!(host = %ctx.domain, remote = %link.remote(), "presented dialback key");
        }
        if applied.flushed > 0 {
            debug!(host = %ctx.domain, remote = %link.remote(), count = applied.flushed,
                "link verified; flushed pending queue");
        }
        if let Some(dropped) = applied.evicted {
            if dropped > 0 {
                warn!(host = %ctx.domain, remote = %link.remote(), dropped,
                    "dropping queued stanzas with failed link");
            }
            ctx.evict(&link).await;
            return;
        }
    }

    // Event stream ended without an explicit close: treat as lost.
    link.apply(LinkEvent::ConnectionLost).await;
    ctx.evict(&link).await;
}
