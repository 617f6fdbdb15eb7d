//! The `Node` embedding API (spec.md §6): binds a listener, dials a
//! static peer list, and exposes `publish`/`rpc` over the resulting
//! mesh. Everything below is a thin async wrapper around
//! [`meshlink_core::dispatcher::Dispatcher`] — this module owns the
//! sockets, the dispatcher owns the routing.

use meshlink_core::client::Client;
use meshlink_core::dispatcher::Dispatcher;
use meshlink_core::error::{RpcError, RpcOutcome};
use meshlink_core::future::{AnyFuture, Rpc};
use meshlink_core::hooks::{DefaultHooks, Hooks};
use meshlink_core::identity::PeerIdentity;
use meshlink_core::peer::PeerConfig;
use meshlink_core::subscription::{Handler, MessageKind, RoutingId, ScheduleFlag, Subscription};
use meshlink_core::value::{KwArgs, Label, Value};
use compio::net::{TcpListener, TcpStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Knobs for a [`Node`]'s peer connections. No environment/file config is
/// read here — a host builds this in code (spec.md §6: "no environment
/// variables at the core boundary").
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// How long to wait for a peer's HANDSHAKE before failing it.
    pub handshake_timeout: Duration,
    /// Bound on each peer's outbound send queue.
    pub send_queue_depth: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            send_queue_depth: 1024,
        }
    }
}

impl From<NodeConfig> for PeerConfig {
    fn from(cfg: NodeConfig) -> Self {
        Self {
            handshake_timeout: cfg.handshake_timeout,
            send_queue_depth: cfg.send_queue_depth,
        }
    }
}

/// Failures raised directly by [`Node`] operations that sit above
/// [`RpcError`] (binding the listener, dialing a static peer).
#[derive(Debug, Error)]
pub enum NodeError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address the node tried to bind.
        addr: SocketAddr,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

struct NodeInner {
    addr: SocketAddr,
    static_peers: Vec<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    peer_config: PeerConfig,
    shutting_down: AtomicBool,
}

/// One mesh participant: a bound TCP listener, a fixed set of dialed
/// static peers, and the routing table/RPC client behind them. Cheaply
/// cloneable; internally shared (spec.md §6).
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    /// A node listening at `addr` that will also dial each address in
    /// `static_peers` once [`Node::start`] runs, using the default
    /// (no-op) hook policy.
    #[must_use]
    pub fn new(addr: SocketAddr, static_peers: Vec<SocketAddr>, config: NodeConfig) -> Self {
        Self::with_hooks(addr, static_peers, config, Arc::new(DefaultHooks))
    }

    /// As [`Node::new`], with a host-supplied [`Hooks`] policy.
    #[must_use]
    pub fn with_hooks(
        addr: SocketAddr,
        static_peers: Vec<SocketAddr>,
        config: NodeConfig,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        let peer_config: PeerConfig = config.into();
        let dispatcher = Arc::new(Dispatcher::new(PeerIdentity::Remote(addr), hooks, peer_config));
        Self(Arc::new(NodeInner {
            addr,
            static_peers,
            dispatcher,
            peer_config,
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// The RPC client backing this node, for blocking on futures it
    /// produces (`client().wait(...)`, `wait_any`, etc).
    #[must_use]
    pub fn client(&self) -> &Client {
        self.0.dispatcher.client()
    }

    /// Bind the listener and start accepting inbound connections, and
    /// dial every configured static peer in the background. Returns once
    /// the listener is bound; connections (inbound or outbound) continue
    /// establishing concurrently — use [`Node::wait_on_connections`] to
    /// block until specific peers come up.
    ///
    /// # Errors
    /// [`NodeError::Bind`] if the listening address can't be bound.
    pub async fn start(&self) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.0.addr)
            .await
            .map_err(|source| NodeError::Bind { addr: self.0.addr, source })?;

        let dispatcher = self.0.dispatcher.clone();
        compio::runtime::spawn(accept_loop(listener, dispatcher)).detach();

        for peer_addr in &self.0.static_peers {
            let dispatcher = self.0.dispatcher.clone();
            let peer_addr = *peer_addr;
            compio::runtime::spawn(dial(peer_addr, dispatcher)).detach();
        }

        Ok(())
    }

    /// Block until every peer in `conns` (or, if `None`, every
    /// configured static peer) reaches ESTABLISHED, or `timeout` elapses.
    /// Returns `true` if something did not come up in time, `false` if
    /// all requested connections established (spec.md §6 "Supplemented
    /// features": matches `junction/node.py`'s `wait_on_connections`
    /// return convention).
    pub async fn wait_on_connections(
        &self,
        conns: Option<&[SocketAddr]>,
        timeout: Option<Duration>,
    ) -> bool {
        let targets: Vec<SocketAddr> = conns
            .map(<[SocketAddr]>::to_vec)
            .unwrap_or_else(|| self.0.static_peers.clone());
        if targets.is_empty() {
            return false;
        }

        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        for addr in targets {
            let identity = PeerIdentity::Remote(addr);
            loop {
                if let Some(peer) = self.0.dispatcher.peer(identity) {
                    let remaining = deadline.map(|d| d.saturating_duration_since(std::time::Instant::now()));
                    if !peer.wait_established(remaining).await {
                        return true;
                    }
                    break;
                }
                if let Some(d) = deadline {
                    if std::time::Instant::now() >= d {
                        return true;
                    }
                }
                compio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        false
    }

    /// Register a local handler for one-way PUBLISH traffic matching
    /// `(service, method, mask, value)`. `schedule` controls whether a
    /// matching delivery runs inline on the peer's receive task or is
    /// spawned onto a fresh cooperative task (spec.md §3's schedule
    /// flag; the embedding API's conventional default is `false` for
    /// publish handlers). Returns `true` if accepted — rejected if the
    /// predicate is unsatisfiable or overlaps an existing local
    /// registration for the same `(service, method)`.
    pub fn accept_publish<F>(
        &self,
        service: Label,
        method: Label,
        mask: RoutingId,
        value: RoutingId,
        handler: F,
        schedule: bool,
    ) -> bool
    where
        F: Fn(PeerIdentity, RoutingId, Vec<Value>, KwArgs) + Send + Sync + 'static,
    {
        let sub = Subscription {
            kind: MessageKind::Publish,
            service,
            method,
            mask,
            value,
        };
        let accepted = self.0.dispatcher.add_local_regs(
            Handler::Publish(Arc::new(handler), ScheduleFlag(schedule)),
            vec![sub],
        );
        !accepted.is_empty()
    }

    /// Register a local handler for RPC_REQUEST traffic matching
    /// `(service, method, mask, value)`. `schedule` defaults to `true`
    /// in the embedding API's conventional usage (an RPC handler may
    /// block without stalling the peer's receive loop), but is always an
    /// explicit argument here. Returns `true` if accepted.
    pub fn accept_rpc<F>(
        &self,
        service: Label,
        method: Label,
        mask: RoutingId,
        value: RoutingId,
        handler: F,
        schedule: bool,
    ) -> bool
    where
        F: Fn(
                PeerIdentity,
                RoutingId,
                Vec<Value>,
                KwArgs,
            ) -> Result<Value, meshlink_core::error::RemoteHandlerError>
            + Send
            + Sync
            + 'static,
    {
        let sub = Subscription {
            kind: MessageKind::RpcRequest,
            service,
            method,
            mask,
            value,
        };
        let accepted = self.0.dispatcher.add_local_regs(
            Handler::Rpc(Arc::new(handler), ScheduleFlag(schedule)),
            vec![sub],
        );
        !accepted.is_empty()
    }

    /// Publish a one-way message to every peer (including a local
    /// handler) whose subscription admits `routing_id`.
    ///
    /// # Errors
    /// [`RpcError::Unroutable`] if nothing matched — no frame was sent
    /// anywhere.
    pub fn publish(
        &self,
        service: Label,
        method: Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) -> Result<(), RpcError> {
        let sent = self
            .0
            .dispatcher
            .send_publish(service, method, routing_id, args, kwargs);
        if sent {
            Ok(())
        } else {
            Err(RpcError::Unroutable)
        }
    }

    /// Fan an RPC request out to every matching peer (including a local
    /// handler) and return the pending [`Rpc`] future immediately,
    /// without blocking for any response.
    ///
    /// # Errors
    /// [`RpcError::Unroutable`] if nothing matched.
    pub fn send_rpc(
        &self,
        service: Label,
        method: Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) -> Result<Rpc, RpcError> {
        self.0.dispatcher.send_rpc(service, method, routing_id, args, kwargs)
    }

    /// `send_rpc` followed by a blocking wait for every target's
    /// response, up to `timeout`.
    ///
    /// # Errors
    /// [`RpcError::Unroutable`] if nothing matched; [`RpcError::WaitTimeout`]
    /// if `timeout` expires before every target responds.
    pub async fn rpc(
        &self,
        service: Label,
        method: Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
        timeout: Option<Duration>,
    ) -> Result<Vec<RpcOutcome>, RpcError> {
        let rpc = self.send_rpc(service, method, routing_id, args, kwargs)?;
        self.client().wait(&[rpc.clone()], timeout).await?;
        Ok(rpc.results().expect("wait resolved without completion"))
    }

    /// Block until any of `futures` produces a first completion, or
    /// `timeout` elapses.
    ///
    /// # Errors
    /// [`RpcError::WaitTimeout`] on expiry.
    pub async fn wait_any_rpc(
        &self,
        futures: &[AnyFuture],
        timeout: Option<Duration>,
    ) -> Result<AnyFuture, RpcError> {
        self.client().wait_any(futures, timeout).await
    }

    /// Mark the node as shutting down and close every established peer
    /// connection. Idempotent.
    pub fn shutdown(&self) {
        if self.0.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for identity in self.0.dispatcher.peer_identities() {
            if let Some(peer) = self.0.dispatcher.peer(identity) {
                peer.close();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted inbound connection");
                dispatcher.attach(stream, PeerIdentity::Remote(addr));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, listener loop ending");
                break;
            }
        }
    }
}

async fn dial(addr: SocketAddr, dispatcher: Arc<Dispatcher>) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            dispatcher.attach(stream, PeerIdentity::Remote(addr));
        }
        Err(e) => {
            tracing::warn!(%addr, error = %e, "failed to dial static peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = NodeConfig::default();
        assert!(cfg.handshake_timeout > Duration::ZERO);
        assert!(cfg.send_queue_depth > 0);
    }

    #[test]
    fn publish_with_no_subscribers_is_unroutable() {
        let node = Node::new("127.0.0.1:0".parse().unwrap(), vec![], NodeConfig::default());
        let err = node
            .publish(Label::Int(1), Label::Text("x".into()), 0, vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, RpcError::Unroutable));
    }

    #[test]
    fn accept_rpc_then_local_send_rpc_round_trips() {
        let node = Node::new("127.0.0.1:0".parse().unwrap(), vec![], NodeConfig::default());
        let accepted = node.accept_rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            0,
            |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
            true,
        );
        assert!(accepted);

        let rpc = node
            .send_rpc(
                Label::Int(1),
                Label::Text("echo".into()),
                0,
                vec![Value::Text("hi".into())],
                vec![],
            )
            .unwrap();
        assert!(rpc.complete());
        assert_eq!(
            rpc.results().unwrap(),
            vec![RpcOutcome::Ok(Value::Text("hi".into()))]
        );
    }

    #[test]
    fn shutdown_is_idempotent() {
        let node = Node::new("127.0.0.1:0".parse().unwrap(), vec![], NodeConfig::default());
        node.shutdown();
        node.shutdown();
    }
}
