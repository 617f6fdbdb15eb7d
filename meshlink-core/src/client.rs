//! The RPC client: counter allocation, in-flight fan-out tracking, and
//! response demultiplexing (spec.md §3 "RPC future" lifecycle; §4.3).

use crate::error::{RpcError, RpcOutcome};
use crate::future::{AnyFuture, Completion, Dependent, FutureNode, Rpc};
use crate::identity::PeerIdentity;
use crate::registry;
use crate::subscription::{Label, RoutingId};
use crate::value::{KwArgs, Value};
use crate::waiter::Waiter;
use dashmap::DashMap;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Return codes carried in an `RPC_RESPONSE` frame (spec.md §6).
pub mod rc {
    /// Success; the payload is the handler's return value verbatim.
    pub const OK: u32 = 0;
    /// The target had no subscription matching the request.
    pub const NO_HANDLER: u32 = 1;
    /// The handler raised a registered typed error.
    pub const KNOWN_ERR: u32 = 2;
    /// The handler raised an error with no registered reconstructor.
    pub const UNKNOWN_ERR: u32 = 3;
    /// The target's connection dropped before it responded (never sent
    /// over the wire — synthesized locally by `retire_peer`).
    pub const LOST_CONN: u32 = 4;
}

/// A decoded `RPC_REQUEST` payload, ready to hand to a peer's send queue
/// or to a local handler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcRequestFrame {
    /// The RPC's counter, echoed back in the response.
    pub counter: u64,
    /// The service label.
    pub service: Label,
    /// The method label.
    pub method: Label,
    /// The routing id.
    pub routing_id: RoutingId,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: KwArgs,
}

struct Inflight {
    targets: Mutex<HashSet<PeerIdentity>>,
    rpc: Rpc,
}

pub(crate) struct ClientInner {
    counter: AtomicU64,
    inflight: DashMap<u64, Inflight>,
}

/// Allocates RPC counters, tracks in-flight fan-out per spec.md §4.3, and
/// demultiplexes responses back onto the right [`Rpc`].
#[derive(Clone)]
pub struct Client(Arc<ClientInner>);

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A fresh client with its counter starting at 1 (spec.md §3: counters
    /// allocated by one client are strictly monotonic).
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(ClientInner {
            counter: AtomicU64::new(1),
            inflight: DashMap::new(),
        }))
    }

    pub(crate) fn next_counter(&self) -> u64 {
        self.0.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn weak(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.0)
    }

    /// Allocate a counter, build the target set, and enqueue an
    /// `RPC_REQUEST` with `enqueue` for every target (spec.md §4.3
    /// `request`). Returns `None` ("unroutable") if `targets` is empty.
    pub fn request<F>(
        &self,
        targets: &[PeerIdentity],
        service: Label,
        method: Label,
        routing_id: RoutingId,
        args: Vec<Value>,
        kwargs: KwArgs,
        mut enqueue: F,
    ) -> Option<Rpc>
    where
        F: FnMut(PeerIdentity, RpcRequestFrame),
    {
        if targets.is_empty() {
            return None;
        }

        let counter = self.next_counter();
        let target_set: HashSet<PeerIdentity> = targets.iter().copied().collect();
        let target_count = target_set.len() as u32;

        let rpc = Rpc::new(counter, target_count, self.weak());
        self.0.inflight.insert(
            counter,
            Inflight {
                targets: Mutex::new(target_set),
                rpc: rpc.clone(),
            },
        );

        let frame = RpcRequestFrame {
            counter,
            service,
            method,
            routing_id,
            args,
            kwargs,
        };
        for &peer in targets {
            enqueue(peer, frame.clone());
        }

        Some(rpc)
    }

    /// Record a decoded `(counter, rc, result)` response from `peer`
    /// (spec.md §4.3 `response`). Malformed/duplicate/stray responses —
    /// an unknown counter, or a peer not (or no longer) in that counter's
    /// target set — are silently dropped.
    pub fn response(&self, peer: PeerIdentity, counter: u64, rc: u32, result: Value) {
        let Some(entry) = self.0.inflight.get(&counter) else {
            tracing::debug!(counter, "dropping response for unknown/retired counter");
            return;
        };
        if !entry.targets.lock().remove(&peer) {
            tracing::debug!(counter, %peer, "dropping stray/duplicate response");
            return;
        }

        entry.rpc.push_outcome(format_outcome(peer, rc, result));
        let emptied = entry.targets.lock().is_empty();
        let rpc = entry.rpc.clone();
        drop(entry);

        if emptied {
            self.0.inflight.remove(&counter);
            rpc.complete_now();
        }
    }

    /// Inject a [`RpcOutcome::LostConnection`] for `peer` into every
    /// in-flight RPC whose target set contains it, completing any whose
    /// target set becomes empty (spec.md §4.3 `retire_peer`; invoked by
    /// the dispatcher's `connection_lost` handling, spec.md §4.2).
    pub fn retire_peer(&self, peer: PeerIdentity) {
        let affected: Vec<u64> = self
            .0
            .inflight
            .iter()
            .filter(|e| e.value().targets.lock().contains(&peer))
            .map(|e| *e.key())
            .collect();

        for counter in affected {
            let Some(entry) = self.0.inflight.get(&counter) else {
                continue;
            };
            if !entry.targets.lock().remove(&peer) {
                continue;
            }
            entry.rpc.push_outcome(RpcOutcome::LostConnection(peer));
            let emptied = entry.targets.lock().is_empty();
            let rpc = entry.rpc.clone();
            drop(entry);
            if emptied {
                self.0.inflight.remove(&counter);
                rpc.complete_now();
            }
        }
    }

    /// Block until any of `rpcs` completes, or `timeout` elapses
    /// (spec.md §4.3 `wait`, §4.4 "Waiter semantics").
    ///
    /// # Errors
    /// [`RpcError::WaitTimeout`] if `timeout` is `Some` and expires
    /// before any future completes.
    pub async fn wait(
        &self,
        rpcs: &[Rpc],
        timeout: Option<std::time::Duration>,
    ) -> Result<Rpc, RpcError> {
        for rpc in rpcs {
            if rpc.complete() {
                return Ok(rpc.clone());
            }
        }

        let waiter = Waiter::new(rpcs.iter().map(Rpc::counter).collect());
        for rpc in rpcs {
            rpc.as_node_for_wait().add_waiter(waiter.clone());
        }

        let outcome = waiter.wait(timeout).await;
        for rpc in rpcs {
            rpc.as_node_for_wait().remove_waiter(&waiter);
        }

        match outcome {
            Some(counter) => rpcs
                .iter()
                .find(|r| r.counter() == counter)
                .cloned()
                .ok_or(RpcError::WaitTimeout),
            None => Err(RpcError::WaitTimeout),
        }
    }

    /// Block until `any` (a mixed list of RPCs and Dependents) produces a
    /// first completion. This is the general form behind
    /// `Node::wait_any_rpc`, extended to Dependents per spec.md §6's
    /// `after`-returned handles also being waitable as a group.
    ///
    /// # Errors
    /// [`RpcError::WaitTimeout`] on expiry.
    pub async fn wait_any(
        &self,
        any: &[AnyFuture],
        timeout: Option<std::time::Duration>,
    ) -> Result<AnyFuture, RpcError> {
        for f in any {
            if is_complete(f) {
                return Ok(f.clone());
            }
        }

        let waiter = Waiter::new(any.iter().map(counter_of).collect());
        for f in any {
            node_of(f).add_waiter(waiter.clone());
        }

        let outcome = waiter.wait(timeout).await;
        for f in any {
            node_of(f).remove_waiter(&waiter);
        }

        match outcome {
            Some(counter) => any
                .iter()
                .find(|f| counter_of(f) == counter)
                .cloned()
                .ok_or(RpcError::WaitTimeout),
            None => Err(RpcError::WaitTimeout),
        }
    }

    /// Block until `dep` completes.
    ///
    /// # Errors
    /// [`RpcError::WaitTimeout`] on expiry.
    pub async fn wait_dependent(
        &self,
        dep: &Dependent,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), RpcError> {
        if dep.complete() {
            return Ok(());
        }
        let waiter = Waiter::new(vec![dep.counter()]);
        dep.as_node().add_waiter(waiter.clone());
        let outcome = waiter.wait(timeout).await;
        dep.as_node().remove_waiter(&waiter);
        match outcome {
            Some(_) => Ok(()),
            None => Err(RpcError::WaitTimeout),
        }
    }
}

fn counter_of(f: &AnyFuture) -> u64 {
    match f {
        AnyFuture::Rpc(r) => r.counter(),
        AnyFuture::Dependent(d) => d.counter(),
    }
}

fn is_complete(f: &AnyFuture) -> bool {
    match f {
        AnyFuture::Rpc(r) => r.complete(),
        AnyFuture::Dependent(d) => d.complete(),
    }
}

fn node_of(f: &AnyFuture) -> Arc<dyn FutureNode> {
    match f {
        AnyFuture::Rpc(r) => r.as_node_for_wait(),
        AnyFuture::Dependent(d) => d.as_node(),
    }
}

/// Format a raw `(rc, result)` pair into the typed outcome per spec.md
/// §4.3 "Result formatting by return-code".
fn format_outcome(peer: PeerIdentity, rc: u32, result: Value) -> RpcOutcome {
    match rc {
        rc::OK => RpcOutcome::Ok(result),
        rc::NO_HANDLER => RpcOutcome::NoRemoteHandler(peer),
        rc::KNOWN_ERR => {
            let (code, args) = match result {
                Value::List(mut v) if v.len() == 2 => {
                    let args = match v.pop() {
                        Some(Value::List(a)) => a,
                        Some(other) => vec![other],
                        None => vec![],
                    };
                    let code = match v.pop() {
                        Some(Value::Int(c)) => c as u32,
                        _ => 0,
                    };
                    (code, args)
                }
                other => (0, vec![other]),
            };
            RpcOutcome::Handled(registry::reconstruct(peer, code, args))
        }
        rc::UNKNOWN_ERR => {
            let trace = match result {
                Value::Text(t) => t,
                other => format!("{other:?}"),
            };
            RpcOutcome::RemoteException { peer, trace }
        }
        rc::LOST_CONN => RpcOutcome::LostConnection(peer),
        other => RpcOutcome::UnrecognizedRemoteProblem {
            peer,
            rc: other,
            result,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_no_targets_is_unroutable() {
        let client = Client::new();
        let rpc = client.request(&[], 1.into(), "m".into(), 0, vec![], vec![], |_, _| {});
        assert!(rpc.is_none());
    }

    #[test]
    fn counters_are_strictly_monotonic() {
        let client = Client::new();
        let a = client.next_counter();
        let b = client.next_counter();
        assert!(b > a);
    }

    #[test]
    fn duplicate_and_stray_responses_are_dropped() {
        let client = Client::new();
        let peer_a = PeerIdentity::Remote("127.0.0.1:1".parse().unwrap());
        let peer_b = PeerIdentity::Remote("127.0.0.1:2".parse().unwrap());
        let rpc = client
            .request(
                &[peer_a],
                1.into(),
                "m".into(),
                0,
                vec![],
                vec![],
                |_, _| {},
            )
            .unwrap();

        // stray: peer_b never a target
        client.response(peer_b, rpc.counter(), rc::OK, Value::Int(1));
        assert_eq!(rpc.partial_results().len(), 0);

        client.response(peer_a, rpc.counter(), rc::OK, Value::Int(2));
        // duplicate
        client.response(peer_a, rpc.counter(), rc::OK, Value::Int(3));
        assert_eq!(rpc.partial_results().len(), 1);
        assert!(rpc.complete());
    }

    #[test]
    fn retire_peer_completes_rpcs_waiting_only_on_it() {
        let client = Client::new();
        let peer_a = PeerIdentity::Remote("127.0.0.1:3".parse().unwrap());
        let peer_b = PeerIdentity::Remote("127.0.0.1:4".parse().unwrap());

        let lone = client
            .request(&[peer_a], 1.into(), "m".into(), 0, vec![], vec![], |_, _| {})
            .unwrap();
        let paired = client
            .request(
                &[peer_a, peer_b],
                1.into(),
                "m".into(),
                0,
                vec![],
                vec![],
                |_, _| {},
            )
            .unwrap();

        client.retire_peer(peer_a);

        assert!(lone.complete());
        assert_eq!(
            lone.results().unwrap(),
            vec![RpcOutcome::LostConnection(peer_a)]
        );
        assert!(!paired.complete());
        assert_eq!(paired.partial_results().len(), 1);
    }
}
