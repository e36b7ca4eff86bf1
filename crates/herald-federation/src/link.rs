//! Outbound link state.
//!
//! One [`OutboundLink`] wraps one transport connection from a hosted domain
//! toward one remote domain and tracks its progress through the dialback
//! lifecycle:
//!
//! ```text
//! Connecting ──online──► Online ──result(valid)──► Verified
//!     │                    │
//!     └────── error ───────┴── error / result(invalid) ──► Failed
//! ```
//!
//! Transitions are a pure function of (state, event) in [`LinkState::apply`];
//! the per-link dispatch loop in [`crate::context`] feeds connection events
//! in arrival order and finishes the returned actions. Stanzas submitted
//! before verification queue in FIFO order and flush exactly once, atomically
//! with the switch to `Verified`: the flush happens while the state lock is
//! held, so no concurrent send can observe `Verified` ahead of the queue.
//!
//! There is no handshake timeout and no queue cap: a stalled handshake leaves
//! the link `Online`/unverified with a growing queue until the transport
//! reports an error. Deployments needing stronger bounds must throttle above
//! this layer.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::warn;

use herald_proto::{Frame, Stanza};

use crate::error::FederationError;
use crate::transport::FrameWriter;

/// Lifecycle phase of an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// The transport is still dialing.
    Connecting,
    /// The transport is ready and our dialback key has been presented;
    /// ordinary traffic still queues.
    Online,
    /// The remote's authoritative server confirmed our key; traffic flows.
    Verified,
    /// Transport error or dialback refusal; the link awaits eviction.
    Failed,
}

/// A `db.verified` verdict observed on this link, republished to
/// Receiver-role waiters.
#[derive(Debug, Clone)]
pub struct VerifiedNotice {
    pub from: String,
    pub to: String,
    pub stream_id: String,
    pub valid: bool,
}

#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// Transport readiness, carrying the negotiated stream id and the
    /// dialback key generated for this link.
    Online { stream_id: String, key: String },
    /// A `db.result` verdict for this link arrived from the receiver.
    Result { valid: bool },
    /// Transport error or close.
    ConnectionLost,
}

#[derive(Debug, PartialEq)]
pub(crate) enum LinkAction {
    /// Present the dialback key to the remote domain.
    SendKey { key: String },
    /// Transmit the pending queue, in order.
    Flush(Vec<Stanza>),
    /// Remove this link from its owning context; `dropped` counts queued
    /// stanzas lost with it.
    Evict { dropped: usize },
}

#[derive(Debug)]
pub(crate) struct LinkState {
    phase: LinkPhase,
    stream_id: Option<String>,
    secret: Option<String>,
    queue: VecDeque<Stanza>,
}

impl LinkState {
    pub(crate) fn new() -> Self {
        Self { phase: LinkPhase::Connecting, stream_id: None, secret: None, queue: VecDeque::new() }
    }

    /// Pure transition: mutates the state and names the side effects, but
    /// performs none of them.
    pub(crate) fn apply(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        match (self.phase, event) {
            (LinkPhase::Connecting, LinkEvent::Online { stream_id, key }) => {
                self.phase = LinkPhase::Online;
                self.stream_id = Some(stream_id);
                self.secret = Some(key.clone());
                vec![LinkAction::SendKey { key }]
            }
            (LinkPhase::Online, LinkEvent::Result { valid: true }) => {
                self.phase = LinkPhase::Verified;
                vec![LinkAction::Flush(self.queue.drain(..).collect())]
            }
            // A refusal is treated exactly like a transport error: the link
            // dies and the next send dials a clean one.
            (LinkPhase::Online, LinkEvent::Result { valid: false }) => self.fail(),
            (_, LinkEvent::ConnectionLost) => self.fail(),
            // Anything else is late or out of order and changes nothing.
            (_, _) => Vec::new(),
        }
    }

    fn fail(&mut self) -> Vec<LinkAction> {
        if self.phase == LinkPhase::Failed {
            return Vec::new();
        }
        self.phase = LinkPhase::Failed;
        let dropped = self.queue.len();
        self.queue.clear();
        vec![LinkAction::Evict { dropped }]
    }
}

/// Summary of the side effects performed while applying one event.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub sent_key: bool,
    pub flushed: usize,
    /// `Some(dropped_queue_len)` when the link must be evicted.
    pub evicted: Option<usize>,
}

/// Handle to one outbound connection and its dialback state.
///
/// Shared between the owning [`crate::context::DomainContext`], the link's
/// dispatch loop, and any Receiver-role handshakes watching it for verdicts.
pub struct OutboundLink {
    local: String,
    remote: String,
    writer: FrameWriter,
    state: Mutex<LinkState>,
    phase_tx: watch::Sender<LinkPhase>,
    verified_tx: broadcast::Sender<VerifiedNotice>,
}

impl OutboundLink {
    pub(crate) fn new(local: String, remote: String, writer: FrameWriter) -> Self {
        let (phase_tx, _) = watch::channel(LinkPhase::Connecting);
        let (verified_tx, _) = broadcast::channel(32);
        Self { local, remote, writer, state: Mutex::new(LinkState::new()), phase_tx, verified_tx }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase_tx.borrow()
    }

    pub async fn stream_id(&self) -> Option<String> {
        self.state.lock().await.stream_id.clone()
    }

    pub(crate) async fn secret(&self) -> Option<String> {
        self.state.lock().await.secret.clone()
    }

    #[cfg(test)]
    pub(crate) async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Feed one event through the state machine. Wire effects (key
    /// presentation, queue flush) happen under the state lock; eviction is
    /// reported back for the dispatch loop to finish.
    pub(crate) async fn apply(&self, event: LinkEvent) -> Applied {
        let mut state = self.state.lock().await;
        let actions = state.apply(event);
        self.phase_tx.send_replace(state.phase);

        let mut applied = Applied::default();
        for action in actions {
            match action {
                LinkAction::SendKey { key } => {
                    let frame = Frame::dialback_key(self.local.clone(), self.remote.clone(), key);
                    if let Err(err) = self.writer.send(frame) {
                        warn!(remote = %self.remote, %err, "failed to present dialback key");
                    }
                    applied.sent_key = true;
                }
                LinkAction::Flush(stanzas) => {
                    applied.flushed = stanzas.len();
                    for stanza in stanzas {
                        if let Err(err) = self.writer.send(Frame::Stanza(stanza)) {
                            warn!(remote = %self.remote, %err, "dropping stanza during flush");
                        }
                    }
                }
                LinkAction::Evict { dropped } => applied.evicted = Some(dropped),
            }
        }
        applied
    }

    /// Queued send: transmit immediately on a verified link, FIFO-queue
    /// otherwise. Fails only when the link has already died.
    pub(crate) async fn enqueue_or_send(&self, stanza: Stanza) -> Result<(), FederationError> {
        let mut state = self.state.lock().await;
        match state.phase {
            LinkPhase::Verified => {
                self.writer.send(Frame::Stanza(stanza))?;
                Ok(())
            }
            LinkPhase::Connecting | LinkPhase::Online => {
                state.queue.push_back(stanza);
                Ok(())
            }
            LinkPhase::Failed => Err(FederationError::LinkClosed(self.remote.clone())),
        }
    }

    /// Raw send for dialback control traffic: immediate when the transport is
    /// ready, otherwise a single deferred send once it comes online. Frames
    /// for a link that already failed are dropped with a warning.
    pub(crate) async fn send_when_online(self: &Arc<Self>, frame: Frame) {
        let state = self.state.lock().await;
        match state.phase {
            LinkPhase::Online | LinkPhase::Verified => {
                if let Err(err) = self.writer.send(frame) {
                    warn!(remote = %self.remote, %err, "dropping raw frame: writer closed");
                }
            }
            LinkPhase::Connecting => {
                drop(state);
                let link = Arc::clone(self);
                tokio::spawn(async move {
                    match link.await_online().await {
                        Ok(()) => {
                            if let Err(err) = link.writer.send(frame) {
                                warn!(remote = %link.remote, %err, "dropping raw frame: writer closed");
                            }
                        }
                        Err(_) => warn!(
                            remote = %link.remote,
                            "dropping raw frame: link failed before coming online"
                        ),
                    }
                });
            }
            LinkPhase::Failed => {
                warn!(remote = %self.remote, "dropping raw frame: link already failed");
            }
        }
    }

    /// Wait until the transport reports readiness.
    pub async fn await_online(&self) -> Result<(), FederationError> {
        let mut rx = self.phase_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LinkPhase::Online | LinkPhase::Verified => return Ok(()),
                LinkPhase::Failed => return Err(FederationError::LinkClosed(self.remote.clone())),
                LinkPhase::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(FederationError::LinkClosed(self.remote.clone()));
            }
        }
    }

    /// Wait until the link is verified. Primarily for embedders and tests;
    /// routing never blocks on this.
    pub async fn await_verified(&self) -> Result<(), FederationError> {
        let mut rx = self.phase_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LinkPhase::Verified => return Ok(()),
                LinkPhase::Failed => return Err(FederationError::LinkClosed(self.remote.clone())),
                LinkPhase::Connecting | LinkPhase::Online => {}
            }
            if rx.changed().await.is_err() {
                return Err(FederationError::LinkClosed(self.remote.clone()));
            }
        }
    }

    /// Resolve once the link fails. Releases Receiver-role waiters whose
    /// verification link died before a verdict arrived.
    pub async fn failed(&self) {
        let mut rx = self.phase_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == LinkPhase::Failed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Authoritative lookup: byte-equality on the recorded stream id and the
    /// key this side generated.
    pub(crate) async fn matches(&self, stream_id: &str, key: &str) -> bool {
        let state = self.state.lock().await;
        state.stream_id.as_deref() == Some(stream_id) && state.secret.as_deref() == Some(key)
    }

    pub fn subscribe_verified(&self) -> broadcast::Receiver<VerifiedNotice> {
        self.verified_tx.subscribe()
    }

    pub(crate) fn publish_verified(&self, notice: VerifiedNotice) {
        let _ = self.verified_tx.send(notice);
    }
}

impl std::fmt::Debug for OutboundLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundLink")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_proto::StanzaKind;

    fn stanza(id: &str) -> Stanza {
        Stanza::new(StanzaKind::Message, "alice@a.example", "bob@b.example").with_id(id)
    }

    fn online_state(queue: &[Stanza]) -> LinkState {
        let mut state = LinkState::new();
        let actions = state.apply(LinkEvent::Online {
            stream_id: "s1".into(),
            key: "1111222233334444".into(),
        });
        assert_eq!(actions, vec![LinkAction::SendKey { key: "1111222233334444".into() }]);
        state.queue.extend(queue.iter().cloned());
        state
    }

    #[test]
    fn coming_online_records_the_id_and_presents_the_key() {
        let state = online_state(&[]);
        assert_eq!(state.phase, LinkPhase::Online);
        assert_eq!(state.stream_id.as_deref(), Some("s1"));
        assert_eq!(state.secret.as_deref(), Some("1111222233334444"));
    }

    #[test]
    fn positive_result_flushes_the_queue_in_order_exactly_once() {
        let mut state = online_state(&[stanza("m1"), stanza("m2")]);

        let actions = state.apply(LinkEvent::Result { valid: true });
        assert_eq!(state.phase, LinkPhase::Verified);
        assert_eq!(actions, vec![LinkAction::Flush(vec![stanza("m1"), stanza("m2")])]);
        assert!(state.queue.is_empty());

        // A duplicate verdict must not flush again.
        assert!(state.apply(LinkEvent::Result { valid: true }).is_empty());
    }

    #[test]
    fn negative_result_fails_and_discards_the_queue() {
        let mut state = online_state(&[stanza("m1")]);
        let actions = state.apply(LinkEvent::Result { valid: false });
        assert_eq!(state.phase, LinkPhase::Failed);
        assert_eq!(actions, vec![LinkAction::Evict { dropped: 1 }]);
    }

    #[test]
    fn connection_loss_fails_from_any_phase_once() {
        let builders: [fn() -> LinkState; 2] = [LinkState::new, || online_state(&[])];
        for build in builders {
            let mut state = build();
            assert_eq!(state.apply(LinkEvent::ConnectionLost), vec![LinkAction::Evict { dropped: 0 }]);
            assert_eq!(state.phase, LinkPhase::Failed);
            // Further events on a failed link are inert.
            assert!(state.apply(LinkEvent::ConnectionLost).is_empty());
            assert!(state.apply(LinkEvent::Result { valid: true }).is_empty());
        }
    }

    #[tokio::test]
    async fn wire_order_is_key_then_flushed_queue() {
        let (conn, mut written, _events) = crate::transport::Connection::pipe();
        let link = OutboundLink::new("a.example".into(), "b.example".into(), conn.writer.clone());

        link.enqueue_or_send(stanza("m1")).await.unwrap();
        link.enqueue_or_send(stanza("m2")).await.unwrap();
        assert_eq!(link.queue_len().await, 2);

        link.apply(LinkEvent::Online { stream_id: "s1".into(), key: "9".repeat(16) }).await;
        let applied = link.apply(LinkEvent::Result { valid: true }).await;
        assert_eq!(applied.flushed, 2);

        match written.recv().await.unwrap() {
            Frame::DialbackKey { from, to, .. } => {
                assert_eq!(from, "a.example");
                assert_eq!(to, "b.example");
            }
            other => panic!("expected db.key first, got {other:?}"),
        }
        for expected in ["m1", "m2"] {
            match written.recv().await.unwrap() {
                Frame::Stanza(s) => assert_eq!(s.id.as_deref(), Some(expected)),
                other => panic!("expected stanza, got {other:?}"),
            }
        }

        // Verified now: sends bypass the queue.
        link.enqueue_or_send(stanza("m3")).await.unwrap();
        assert_eq!(link.queue_len().await, 0);
    }
}
