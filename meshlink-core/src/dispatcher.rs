//! Wires the peer set, the subscription table, the RPC client, and the
//! hook policies together (spec.md §4.1).
//!
//! This is the node-facing seam: [`Dispatcher`] implements [`PeerEvents`]
//! so a [`crate::peer::Peer`]'s reader task can call straight into it, and
//! exposes the handful of operations [`crate::node`] builds `Node` out of.
//! Grounded on the teacher's `router.rs` peer-map-plus-event-handling shape,
//! generalized from a single ROUTER socket's peer table to a full mesh with
//! a predicate-matched subscription table in front of it.

use crate::client::{rc, Client, RpcRequestFrame};
use crate::codec::Frame;
use crate::error::{RemoteHandlerError, RpcError};
use crate::future::Rpc;
use crate::hooks::{GuardedHooks, Hooks};
use crate::identity::PeerIdentity;
use crate::peer::{Peer, PeerConfig, PeerEvents};
use crate::subscription::{Handler, MessageKind, RegistrationTable, RoutingId, Subscription};
use crate::value::{KwArgs, Value};
use async_trait::async_trait;
use compio::net::TcpStream;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

struct DispatcherInner {
    own_identity: PeerIdentity,
    table: RwLock<RegistrationTable>,
    peers: DashMap<PeerIdentity, Peer>,
    client: Client,
    hooks: GuardedHooks,
    peer_config: PeerConfig,
}

/// Routes outgoing PUBLISH/RPC_REQUEST traffic to matching peers, delivers
/// incoming frames, and keeps the subscription table and in-flight RPC
/// client in sync with peer lifecycle (spec.md §4.1, §4.2's `connection_lost`
/// handoff to the RPC client per §4.3 `retire_peer`).
#[derive(Clone)]
pub struct Dispatcher(Arc<DispatcherInner>);

impl Dispatcher {
    /// A fresh dispatcher for a node listening/dialing as `own_identity`.
    #[must_use]
    pub fn new(own_identity: PeerIdentity, hooks: Arc<dyn Hooks>, peer_config: PeerConfig) -> Self {
        Self(Arc::new(DispatcherInner {
            own_identity,
            table: RwLock::new(RegistrationTable::new()),
            peers: DashMap::new(),
            client: Client::new(),
            hooks: GuardedHooks::new(hooks),
            peer_config,
        }))
    }

    /// The RPC client backing this dispatcher.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.0.client
    }

    /// Spawn a peer connection over an already-connected socket and start
    /// tracking it under a placeholder key until its HANDSHAKE reveals its
    /// real identity (`on_established` promotes it).
    pub fn attach(self: &Arc<Self>, stream: TcpStream, provisional: PeerIdentity) -> Peer {
        let subs = self.0.table.read().local_subscriptions();
        let peer = Peer::spawn(
            stream,
            self.0.own_identity,
            subs,
            self.0.peer_config,
            self.clone() as Arc<dyn PeerEvents>,
        );
        self.0.peers.insert(provisional, peer.clone());
        peer
    }

    /// Every currently known peer identity (established or still
    /// handshaking), excluding the local sentinel.
    #[must_use]
    pub fn peer_identities(&self) -> Vec<PeerIdentity> {
        self.0.peers.iter().map(|e| *e.key()).collect()
    }

    /// The peer handle tracked under `identity`, if any.
    #[must_use]
    pub fn peer(&self, identity: PeerIdentity) -> Option<Peer> {
        self.0.peers.get(&identity).map(|e| e.clone())
    }

    /// Register local subscriptions for `handler`, rejecting overlaps and
    /// unsatisfiable predicates, and broadcast whatever was accepted to
    /// every established peer as an ANNOUNCE (spec.md §4.1 `add_local_regs`).
    pub fn add_local_regs(&self, handler: Handler, subs: Vec<Subscription>) -> Vec<Subscription> {
        let accepted = self.0.table.write().add_local(handler, subs);
        if !accepted.is_empty() {
            self.broadcast(Frame::Announce(accepted.clone()));
        }
        accepted
    }

    /// Register subscriptions a peer announced (ANNOUNCE, or the initial
    /// list in its HANDSHAKE).
    pub fn add_remote_regs(&self, peer: PeerIdentity, subs: Vec<Subscription>) {
        self.0.table.write().add_remote(peer, subs);
    }

    /// Drop subscriptions a peer UNANNOUNCEd.
    pub fn drop_remote_regs(&self, peer: PeerIdentity, subs: &[Subscription]) {
        self.0.table.write().drop_remote(peer, subs);
    }

    /// Every peer (including the local sentinel) whose predicate admits
    /// `routing_id` for this `(kind, service, method)` (spec.md §4.1
    /// `find_peer_routes`).
    #[must_use]
    pub fn find_peer_routes(
        &self,
        kind: MessageKind,
        service: &crate::value::Label,
        method: &crate::value::Label,
        routing_id: RoutingId,
    ) -> SmallVec<[PeerIdentity; 4]> {
        self.0.table.read().find_routes(kind, service, method, routing_id)
    }

    /// Pick one peer from `routes` for a singular-target RPC, via the
    /// configured hook (spec.md §4.1 `select_peer_for_rpc`). Not used by
    /// [`crate::node::Node::send_rpc`]'s default fan-out path — exposed for
    /// hosts that want unicast RPC semantics over a predicate match that
    /// admits several peers.
    #[must_use]
    pub fn select_peer_for_rpc(
        &self,
        routes: &[PeerIdentity],
        service: &crate::value::Label,
        routing_id: RoutingId,
        method: &crate::value::Label,
    ) -> Option<PeerIdentity> {
        if routes.is_empty() {
            return None;
        }
        Some(self.0.hooks.select_peer(routes, service, routing_id, method))
    }

    /// Route and send a PUBLISH to every matching peer (remote peers get a
    /// frame; a matching local subscription is delivered inline or
    /// scheduled per its `schedule_flag`). Returns `true` iff at least one
    /// delivery was attempted (spec.md §4.1 `send_publish`).
    pub fn send_publish(
        &self,
        service: crate::value::Label,
        method: crate::value::Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) -> bool {
        let routes = self.find_peer_routes(MessageKind::Publish, &service, &method, routing_id);
        if routes.is_empty() {
            return false;
        }

        for target in routes {
            match target {
                PeerIdentity::Local => {
                    self.deliver_local_publish(
                        PeerIdentity::Local,
                        service.clone(),
                        method.clone(),
                        routing_id,
                        args.clone(),
                        kwargs.clone(),
                    );
                }
                remote => {
                    if let Some(peer) = self.0.peers.get(&remote) {
                        peer.enqueue(Frame::Publish {
                            service: service.clone(),
                            method: method.clone(),
                            routing_id,
                            args: args.clone(),
                            kwargs: kwargs.clone(),
                        });
                    }
                }
            }
        }
        true
    }

    fn deliver_local_publish(
        &self,
        from: PeerIdentity,
        service: crate::value::Label,
        method: crate::value::Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) {
        let handler = self
            .0
            .table
            .read()
            .local_handler(MessageKind::Publish, &service, &method, routing_id);
        let Some(Handler::Publish(f, schedule)) = handler else {
            return;
        };
        if schedule.0 {
            compio::runtime::spawn(async move {
                f(from, routing_id, args, kwargs);
            })
            .detach();
        } else {
            f(from, routing_id, args, kwargs);
        }
    }

    /// Send an RPC fanned out to every peer matching `(service, method,
    /// routing_id)`, including a local handler if one matches.
    ///
    /// # Errors
    /// [`RpcError::Unroutable`] if no peer (including local) matches.
    pub fn send_rpc(
        &self,
        service: crate::value::Label,
        method: crate::value::Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) -> Result<Rpc, RpcError> {
        let targets =
            self.find_peer_routes(MessageKind::RpcRequest, &service, &method, routing_id);
        if targets.is_empty() {
            return Err(RpcError::Unroutable);
        }

        let this = self.clone();
        let rpc = self.0.client.request(
            &targets,
            service,
            method,
            routing_id,
            args,
            kwargs,
            move |peer, frame| this.dispatch_rpc_request(peer, frame),
        );
        rpc.ok_or(RpcError::Unroutable)
    }

    fn dispatch_rpc_request(&self, target: PeerIdentity, frame: RpcRequestFrame) {
        match target {
            PeerIdentity::Local => self.serve_local_rpc(PeerIdentity::Local, frame),
            remote => match self.0.peers.get(&remote) {
                Some(peer) if peer.state() == crate::peer::PeerState::Established => {
                    peer.enqueue(Frame::RpcRequest(frame));
                }
                _ => {
                    tracing::debug!(%remote, "rpc target not established, synthesizing lost connection");
                    self.0.client.response(remote, frame.counter, rc::LOST_CONN, Value::Null);
                }
            },
        }
    }

    fn serve_local_rpc(&self, from: PeerIdentity, frame: RpcRequestFrame) {
        let counter = frame.counter;
        let client = self.0.client.clone();
        let (rc, result) = self.run_rpc_handler(from, frame);
        client.response(PeerIdentity::Local, counter, rc, result);
    }

    fn run_rpc_handler(&self, from: PeerIdentity, frame: RpcRequestFrame) -> (u32, Value) {
        let handler = self.0.table.read().local_handler(
            MessageKind::RpcRequest,
            &frame.service,
            &frame.method,
            frame.routing_id,
        );
        let Some(Handler::Rpc(f, _schedule)) = handler else {
            return (rc::NO_HANDLER, Value::Null);
        };
        match f(from, frame.routing_id, frame.args, frame.kwargs) {
            Ok(value) => (rc::OK, value),
            Err(RemoteHandlerError::Known(code, args)) => {
                (rc::KNOWN_ERR, Value::List(vec![Value::Int(i64::from(code)), Value::List(args)]))
            }
            Err(RemoteHandlerError::Unknown(msg)) => (rc::UNKNOWN_ERR, Value::Text(msg)),
        }
    }

    fn broadcast(&self, frame: Frame) {
        for entry in &self.0.peers {
            if entry.value().state() == crate::peer::PeerState::Established {
                entry.value().enqueue(frame.clone());
            }
        }
    }
}

#[async_trait]
impl PeerEvents for Dispatcher {
    async fn on_established(&self, handle: Peer, peer: PeerIdentity, subscriptions: Vec<Subscription>) {
        // Re-key from whatever provisional identity `attach` inserted this
        // peer under (for inbound connections, the ephemeral socket peer
        // address) to the identity it just announced in its HANDSHAKE.
        let provisional_key = self
            .0
            .peers
            .iter()
            .find(|e| e.value().is_same_connection(&handle))
            .map(|e| *e.key());
        if let Some(key) = provisional_key {
            if key != peer {
                self.0.peers.remove(&key);
            }
        }
        self.0.peers.insert(peer, handle);
        self.add_remote_regs(peer, subscriptions);
        tracing::info!(%peer, "peer established");
    }

    async fn on_announce(&self, peer: PeerIdentity, subscriptions: Vec<Subscription>) {
        self.add_remote_regs(peer, subscriptions);
    }

    async fn on_unannounce(&self, peer: PeerIdentity, subscriptions: Vec<Subscription>) {
        self.drop_remote_regs(peer, &subscriptions);
    }

    async fn on_publish(
        &self,
        from: PeerIdentity,
        service: crate::value::Label,
        method: crate::value::Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
    ) {
        self.deliver_local_publish(from, service, method, routing_id, args, kwargs);
    }

    async fn on_rpc_request(&self, from: PeerIdentity, request: RpcRequestFrame) -> (u32, Value) {
        self.run_rpc_handler(from, request)
    }

    fn on_rpc_response(&self, from: PeerIdentity, counter: u64, rc: u32, result: Value) {
        self.0.client.response(from, counter, rc, result);
    }

    async fn on_closed(&self, peer: PeerIdentity, subscriptions_at_loss: Vec<Subscription>) {
        self.0.peers.remove(&peer);
        let dropped = self.0.table.write().remove_peer(peer);
        self.0.client.retire_peer(peer);
        self.0.hooks.connection_lost(peer, &subscriptions_at_loss);
        tracing::info!(%peer, dropped = dropped.len(), "peer connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultHooks;
    use crate::subscription::ScheduleFlag;
    use crate::value::Label;
    use std::sync::Arc as StdArc;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(PeerIdentity::Local, StdArc::new(DefaultHooks), PeerConfig::default())
    }

    #[test]
    fn publish_with_no_subscribers_returns_false() {
        let d = dispatcher();
        let sent = d.send_publish(Label::Int(1), Label::Text("x".into()), 0, vec![], vec![]);
        assert!(!sent);
    }

    #[test]
    fn local_rpc_handler_serves_without_any_peer() {
        let d = dispatcher();
        let handler = Handler::Rpc(
            StdArc::new(|_, _, args, _| Ok(args.into_iter().next().unwrap_or(Value::Null))),
            ScheduleFlag(true),
        );
        d.add_local_regs(
            handler,
            vec![Subscription {
                kind: MessageKind::RpcRequest,
                service: Label::Int(1),
                method: Label::Text("echo".into()),
                mask: 0,
                value: 0,
            }],
        );

        let rpc = d
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
            vec![crate::error::RpcOutcome::Ok(Value::Text("hi".into()))]
        );
    }

    #[test]
    fn rpc_with_no_route_is_unroutable() {
        let d = dispatcher();
        let err = d
            .send_rpc(Label::Int(9), Label::Text("x".into()), 0, vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, RpcError::Unroutable));
    }
}
