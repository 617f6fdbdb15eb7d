//! Per-peer connection state machine (spec.md §4.2).
//!
//! One [`Peer`] owns one `compio::net::TcpStream` and runs two cooperative
//! tasks against it: a reader that decodes frames and dispatches them via
//! [`PeerEvents`], and a writer that drains a bounded send queue. This
//! mirrors the teacher's `actor.rs` split-pump design, generalized from
//! raw bytes to framed messages.

use crate::client::RpcRequestFrame;
use crate::codec::{self, Frame, PROTOCOL_VERSION};
use crate::identity::PeerIdentity;
use crate::subscription::Subscription;
use crate::tcp::enable_tcp_nodelay;
use crate::value::{KwArgs, Value};
use async_trait::async_trait;
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The peer connection state machine (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Constructed but not yet started.
    Init,
    /// Outbound: TCP connect in flight.
    Connecting,
    /// HANDSHAKE sent, awaiting the peer's.
    HandshakeSent,
    /// Handshake exchanged; normal operation.
    Established,
    /// Shutting down; send queue draining best-effort.
    Closing,
    /// Unrecoverable error (DNS, refused, handshake timeout, version
    /// mismatch, protocol violation).
    Failed,
    /// Terminal; the socket is gone.
    Closed,
}

/// Callbacks invoked by a peer's reader task as frames arrive, and once
/// when its connection is lost. Implemented by the dispatcher; kept as a
/// trait here so `peer` has no dependency on `dispatcher`.
#[async_trait]
pub trait PeerEvents: Send + Sync {
    /// The peer's HANDSHAKE was accepted (matching protocol version). Carries
    /// the [`Peer`] handle itself so the dispatcher can re-key its peer map
    /// from whatever provisional key it attached under to the identity the
    /// peer just announced (only known once the handshake completes).
    async fn on_established(&self, handle: Peer, peer: PeerIdentity, subscriptions: Vec<Subscription>);
    /// An ANNOUNCE arrived.
    async fn on_announce(&self, peer: PeerIdentity, subscriptions: Vec<Subscription>);
    /// An UNANNOUNCE arrived.
    async fn on_unannounce(&self, peer: PeerIdentity, subscriptions: Vec<Subscription>);
    /// A PUBLISH arrived.
    #[allow(clippy::too_many_arguments)]
    async fn on_publish(
        &self,
        from: PeerIdentity,
        service: crate::value::Label,
        method: crate::value::Label,
        routing_id: crate::subscription::RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    );
    /// An RPC_REQUEST arrived; returns the `(rc, result)` to answer with.
    async fn on_rpc_request(&self, from: PeerIdentity, request: RpcRequestFrame) -> (u32, Value);
    /// An RPC_RESPONSE arrived.
    fn on_rpc_response(&self, from: PeerIdentity, counter: u64, rc: u32, result: Value);
    /// The connection transitioned ESTABLISHED → CLOSED. Carries the
    /// subscriptions the peer had registered at the time of loss.
    async fn on_closed(&self, peer: PeerIdentity, subscriptions_at_loss: Vec<Subscription>);
}

struct EstablishSignal {
    fired: AtomicBool,
    ok: AtomicBool,
    waiters: Mutex<Vec<futures::channel::oneshot::Sender<bool>>>,
}

impl EstablishSignal {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            ok: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn fire(&self, ok: bool) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.ok.store(ok, Ordering::Release);
            for tx in self.waiters.lock().drain(..) {
                let _ = tx.send(ok);
            }
        }
    }

    async fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return self.ok.load(Ordering::Acquire);
        }
        let (tx, rx) = futures::channel::oneshot::channel();
        self.waiters.lock().push(tx);
        // fire() may have run between the load above and the push
        if self.fired.load(Ordering::Acquire) {
            return self.ok.load(Ordering::Acquire);
        }
        match timeout {
            None => rx.await.unwrap_or(false),
            Some(d) => compio::time::timeout(d, rx)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or(false),
        }
    }
}

struct PeerShared {
    state: Mutex<PeerState>,
    identity: Mutex<Option<PeerIdentity>>,
    send_tx: Sender<Frame>,
    established: EstablishSignal,
    subscriptions_at_loss: Mutex<Vec<Subscription>>,
    closing: Mutex<Option<futures::channel::oneshot::Sender<()>>>,
}

/// A handle to one peer connection. Cheaply cloneable; internally shared.
#[derive(Clone)]
pub struct Peer(Arc<PeerShared>);

/// Configuration for a peer connection's handshake and send queue.
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// How long to wait for the peer's HANDSHAKE before failing.
    pub handshake_timeout: Duration,
    /// Bound on the outbound send queue (spec.md §5 "the send queue is
    /// the only producer/consumer boundary between user tasks and peer
    /// I/O").
    pub send_queue_depth: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            send_queue_depth: 1024,
        }
    }
}

impl Peer {
    /// Spawn the reader/writer tasks for an already-connected socket and
    /// drive it through the handshake. `own_identity`/`own_subs` are sent
    /// in our own HANDSHAKE frame. Returns the peer handle immediately;
    /// callers `wait_established` to learn the outcome.
    pub fn spawn(
        stream: TcpStream,
        own_identity: PeerIdentity,
        own_subs: Vec<Subscription>,
        config: PeerConfig,
        events: Arc<dyn PeerEvents>,
    ) -> Self {
        let _ = enable_tcp_nodelay(&stream);
        let (send_tx, send_rx) = flume::bounded(config.send_queue_depth);
        let (closing_tx, closing_rx) = futures::channel::oneshot::channel();

        let shared = Arc::new(PeerShared {
            state: Mutex::new(PeerState::HandshakeSent),
            identity: Mutex::new(None),
            send_tx,
            established: EstablishSignal::new(),
            subscriptions_at_loss: Mutex::new(Vec::new()),
            closing: Mutex::new(Some(closing_tx)),
        });

        let peer = Self(shared);
        let peer_for_task = peer.clone();
        compio::runtime::spawn(async move {
            peer_for_task
                .run(stream, send_rx, closing_rx, own_identity, own_subs, config, events)
                .await;
        })
        .detach();

        peer
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        *self.0.state.lock()
    }

    /// Whether `self` and `other` are handles to the same underlying
    /// connection. Used by the dispatcher to re-key its peer map once a
    /// handshake reveals a peer's real identity.
    #[must_use]
    pub fn is_same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The peer's advertised identity, once known (after HANDSHAKE).
    #[must_use]
    pub fn identity(&self) -> Option<PeerIdentity> {
        *self.0.identity.lock()
    }

    /// Block until the peer reaches ESTABLISHED or FAILED, or `timeout`
    /// elapses. Returns `true` if established.
    pub async fn wait_established(&self, timeout: Option<Duration>) -> bool {
        self.0.established.wait(timeout).await
    }

    /// Enqueue a frame for the writer task. Silently dropped if the peer
    /// isn't ESTABLISHED (PUBLISH semantics); RPC callers check
    /// `state()` themselves to report a routing miss instead.
    pub fn enqueue(&self, frame: Frame) {
        if *self.0.state.lock() != PeerState::Established {
            tracing::debug!("dropping frame: peer not established");
            return;
        }
        self.enqueue_unconditionally(frame);
    }

    /// Begin orderly shutdown: stop accepting new sends, drain the queue
    /// best-effort, then close. Wakes the reader task so the connection
    /// actually tears down instead of idling on its next read.
    pub fn close(&self) {
        let mut state = self.0.state.lock();
        if matches!(*state, PeerState::Established | PeerState::HandshakeSent) {
            *state = PeerState::Closing;
            drop(state);
            if let Some(tx) = self.0.closing.lock().take() {
                let _ = tx.send(());
            }
        }
    }

    fn enqueue_unconditionally(&self, frame: Frame) {
        if self.0.send_tx.try_send(frame).is_err() {
            tracing::warn!("peer send queue full or closed, dropping frame");
        }
    }

    async fn run(
        self,
        stream: TcpStream,
        send_rx: Receiver<Frame>,
        closing_rx: futures::channel::oneshot::Receiver<()>,
        own_identity: PeerIdentity,
        own_subs: Vec<Subscription>,
        config: PeerConfig,
        events: Arc<dyn PeerEvents>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();

        let writer = {
            let shared = Arc::clone(&self.0);
            async move {
                while let Ok(frame) = send_rx.recv_async().await {
                    if *shared.state.lock() == PeerState::Closed {
                        break;
                    }
                    if let Err(e) = codec::write_frame(&mut write_half, &frame).await {
                        tracing::debug!(error = %e, "peer write failed");
                        break;
                    }
                }
            }
        };
        let writer_task = compio::runtime::spawn(writer);

        self.enqueue_unconditionally(Frame::Handshake {
            version: PROTOCOL_VERSION,
            identity: own_identity,
            subscriptions: own_subs,
        });

        let handshake_result = compio::time::timeout(config.handshake_timeout, async {
            loop {
                match codec::read_frame(&mut read_half).await {
                    Ok(Frame::Handshake {
                        version,
                        identity,
                        subscriptions,
                    }) => return Ok((version, identity, subscriptions)),
                    Ok(_other) => continue, // ignore anything before HANDSHAKE
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        let (peer_identity, peer_subs) = match handshake_result {
            Ok(Ok((version, identity, subs))) if version == PROTOCOL_VERSION => (identity, subs),
            Ok(Ok((version, _identity, _subs))) => {
                tracing::warn!(
                    local = PROTOCOL_VERSION,
                    remote = version,
                    "protocol version mismatch"
                );
                *self.0.state.lock() = PeerState::Failed;
                self.0.established.fire(false);
                writer_task.detach();
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "handshake read failed");
                *self.0.state.lock() = PeerState::Failed;
                self.0.established.fire(false);
                writer_task.detach();
                return;
            }
            Err(_elapsed) => {
                tracing::warn!(timeout = ?config.handshake_timeout, "handshake timed out");
                *self.0.state.lock() = PeerState::Failed;
                self.0.established.fire(false);
                writer_task.detach();
                return;
            }
        };

        *self.0.identity.lock() = Some(peer_identity);
        *self.0.state.lock() = PeerState::Established;
        *self.0.subscriptions_at_loss.lock() = peer_subs.clone();
        self.0.established.fire(true);
        events.on_established(self.clone(), peer_identity, peer_subs).await;

        use futures::{FutureExt, select};
        let mut closing_rx = closing_rx.fuse();

        loop {
            if *self.0.state.lock() == PeerState::Closing {
                break;
            }
            let read_outcome = select! {
                frame = codec::read_frame(&mut read_half).fuse() => frame,
                _ = closing_rx => break,
            };
            match read_outcome {
                Ok(Frame::Handshake { .. }) => {
                    tracing::debug!("ignoring duplicate HANDSHAKE on established peer");
                }
                Ok(Frame::Announce(subs)) => {
                    *self.0.subscriptions_at_loss.lock() = subs.clone();
                    events.on_announce(peer_identity, subs).await;
                }
                Ok(Frame::Unannounce(subs)) => {
                    events.on_unannounce(peer_identity, subs).await;
                }
                Ok(Frame::Publish {
                    service,
                    method,
                    routing_id,
                    args,
                    kwargs,
                }) => {
                    events
                        .on_publish(peer_identity, service, method, routing_id, args, kwargs)
                        .await;
                }
                Ok(Frame::RpcRequest(req)) => {
                    let counter = req.counter;
                    let (rc, result) = events.on_rpc_request(peer_identity, req).await;
                    self.enqueue_unconditionally(Frame::RpcResponse {
                        counter,
                        rc,
                        result,
                    });
                }
                Ok(Frame::RpcResponse { counter, rc, result }) => {
                    events.on_rpc_response(peer_identity, counter, rc, result);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "peer read loop ending");
                    break;
                }
            }
        }

        *self.0.state.lock() = PeerState::Closed;
        writer_task.detach();
        let subs = self.0.subscriptions_at_loss.lock().clone();
        events.on_closed(peer_identity, subs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = PeerConfig::default();
        assert!(cfg.handshake_timeout > Duration::ZERO);
        assert!(cfg.send_queue_depth > 0);
    }
}
