//! Subscription predicates and the local/remote registration table
//! (spec.md §3 "Subscription", "Registration table"; §4.1).

use crate::error::RemoteHandlerError;
use crate::identity::PeerIdentity;
use crate::value::{KwArgs, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

/// The two message kinds a subscription can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// One-way delivery; no response expected.
    Publish,
    /// Request/response; the target must send an `RPC_RESPONSE`.
    RpcRequest,
}

/// A hashable, serializable routing label (service or method name).
pub type Label = crate::value::Label;

/// The numeric id a request is routed by, matched against a predicate's
/// `(mask, value)` pair: `routing_id & mask == value`.
pub type RoutingId = u64;

/// A `(message_kind, service, method, mask, value)` predicate, as carried
/// on the wire (spec.md §6 — the schedule flag is local-only and never
/// serialized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// PUBLISH or RPC_REQUEST.
    pub kind: MessageKind,
    /// The service label (routing top level).
    pub service: Label,
    /// The method label.
    pub method: Label,
    /// Bitmask applied to an incoming routing id before comparing to
    /// `value`.
    pub mask: RoutingId,
    /// The value an incoming `routing_id & mask` must equal to match.
    pub value: RoutingId,
}

impl Subscription {
    /// A predicate can never match anything if `value` has bits set
    /// outside `mask` — those bits can never come back masked to zero.
    #[must_use]
    pub const fn is_satisfiable(&self) -> bool {
        self.value & !self.mask == 0
    }

    /// Whether `routing_id` matches this predicate.
    #[must_use]
    pub const fn matches(&self, routing_id: RoutingId) -> bool {
        routing_id & self.mask == self.value
    }

    /// Two predicates overlap iff some routing id matches both — spec.md
    /// §9's closed form: `(v1 & m1 & m2) == (v2 & m1 & m2)`.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        let shared = self.mask & other.mask;
        (self.value & shared) == (other.value & shared)
    }
}

/// Local-only flag: whether a matching message runs the handler inline on
/// the receive path, or is scheduled onto a fresh cooperative task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleFlag(pub bool);

/// A locally registered publish handler.
pub type PublishHandler =
    Arc<dyn Fn(PeerIdentity, RoutingId, Vec<Value>, KwArgs) + Send + Sync>;

/// A locally registered RPC handler. Returns the response payload, or a
/// [`RemoteHandlerError`] that becomes `KNOWN_ERR`/`UNKNOWN_ERR` on the
/// wire.
pub type RpcHandler = Arc<
    dyn Fn(PeerIdentity, RoutingId, Vec<Value>, KwArgs) -> Result<Value, RemoteHandlerError>
        + Send
        + Sync,
>;

/// Either flavor of local handler, tagged with its schedule flag.
#[derive(Clone)]
pub enum Handler {
    /// Fires for PUBLISH.
    Publish(PublishHandler, ScheduleFlag),
    /// Fires for RPC_REQUEST.
    Rpc(RpcHandler, ScheduleFlag),
}

impl Handler {
    /// The message kind this handler was registered under.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Publish(..) => MessageKind::Publish,
            Self::Rpc(..) => MessageKind::RpcRequest,
        }
    }

    /// The schedule flag this handler was registered with.
    #[must_use]
    pub const fn schedule(&self) -> ScheduleFlag {
        match self {
            Self::Publish(_, s) | Self::Rpc(_, s) => *s,
        }
    }
}

/// Grouping key shared by every subscription on the same `(kind, service,
/// method)` triple — overlap is only checked within a group.
pub type GroupKey = (MessageKind, Label, Label);

fn group_key(sub: &Subscription) -> GroupKey {
    (sub.kind, sub.service.clone(), sub.method.clone())
}

/// Holds both the node's own subscriptions (with their handlers) and the
/// subscriptions every connected peer has announced (spec.md §3
/// "Registration table").
#[derive(Default)]
pub struct RegistrationTable {
    local: HashMap<GroupKey, Vec<(Subscription, Handler)>>,
    remote: HashMap<PeerIdentity, HashMap<GroupKey, Vec<Subscription>>>,
}

impl RegistrationTable {
    /// New, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register local subscriptions, rejecting any that are unsatisfiable
    /// or overlap an existing local registration in the same group.
    /// Returns the subset actually stored, in the order given.
    pub fn add_local(
        &mut self,
        handler: Handler,
        subs: Vec<Subscription>,
    ) -> Vec<Subscription> {
        let mut accepted = Vec::with_capacity(subs.len());
        for sub in subs {
            if sub.kind != handler.kind() {
                continue;
            }
            if !sub.is_satisfiable() {
                continue;
            }
            let key = group_key(&sub);
            let existing = self.local.entry(key.clone()).or_default();
            if existing.iter().any(|(s, _)| s.overlaps(&sub)) {
                continue;
            }
            existing.push((sub.clone(), handler.clone()));
            accepted.push(sub);
        }
        accepted
    }

    /// Every locally registered subscription, flattened — used to build
    /// the outgoing HANDSHAKE/ANNOUNCE subscription list.
    #[must_use]
    pub fn local_subscriptions(&self) -> Vec<Subscription> {
        self.local
            .values()
            .flat_map(|v| v.iter().map(|(s, _)| s.clone()))
            .collect()
    }

    /// Register subscriptions a peer announced (ANNOUNCE or the
    /// HANDSHAKE's initial list). No overlap check: peers may conflict
    /// freely, resolution happens at peer-selection time.
    pub fn add_remote(&mut self, peer: PeerIdentity, subs: Vec<Subscription>) {
        let table = self.remote.entry(peer).or_default();
        for sub in subs {
            table.entry(group_key(&sub)).or_default().push(sub);
        }
    }

    /// Remove subscriptions a peer UNANNOUNCEd.
    pub fn drop_remote(&mut self, peer: PeerIdentity, subs: &[Subscription]) {
        if let Some(table) = self.remote.get_mut(&peer) {
            for sub in subs {
                let key = group_key(sub);
                if let Some(list) = table.get_mut(&key) {
                    list.retain(|s| s != sub);
                }
            }
        }
    }

    /// Drop every subscription for a peer at once (connection loss).
    /// Returns what the peer had, for the `connection_lost` hook.
    pub fn remove_peer(&mut self, peer: PeerIdentity) -> Vec<Subscription> {
        self.remote
            .remove(&peer)
            .map(|table| table.into_values().flatten().collect())
            .unwrap_or_default()
    }

    /// Every peer (including [`PeerIdentity::Local`] if a local
    /// subscription matches) whose predicate admits `routing_id` for this
    /// `(kind, service, method)`. Order is unspecified.
    #[must_use]
    pub fn find_routes(
        &self,
        kind: MessageKind,
        service: &Label,
        method: &Label,
        routing_id: RoutingId,
    ) -> SmallVec<[PeerIdentity; 4]> {
        let key = (kind, service.clone(), method.clone());
        let mut out = SmallVec::new();

        if let Some(list) = self.local.get(&key) {
            if list.iter().any(|(s, _)| s.matches(routing_id)) {
                out.push(PeerIdentity::Local);
            }
        }

        for (peer, table) in &self.remote {
            if let Some(list) = table.get(&key) {
                if list.iter().any(|s| s.matches(routing_id)) {
                    out.push(*peer);
                }
            }
        }

        out
    }

    /// The local handler for a matching `(kind, service, method,
    /// routing_id)`, if any. Used by the dispatcher to deliver locally.
    #[must_use]
    pub fn local_handler(
        &self,
        kind: MessageKind,
        service: &Label,
        method: &Label,
        routing_id: RoutingId,
    ) -> Option<Handler> {
        let key = (kind, service.clone(), method.clone());
        self.local.get(&key)?.iter().find_map(|(s, h)| {
            if s.matches(routing_id) {
                Some(h.clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(mask: u64, value: u64) -> Subscription {
        Subscription {
            kind: MessageKind::RpcRequest,
            service: Label::Int(1),
            method: Label::Text("echo".into()),
            mask,
            value,
        }
    }

    #[test]
    fn unsatisfiable_predicate_is_rejected() {
        let s = sub(0x0F, 0x10);
        assert!(!s.is_satisfiable());
    }

    #[test]
    fn identical_predicates_overlap() {
        let a = sub(0xF0, 0x10);
        let b = sub(0xF0, 0x10);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn disjoint_predicates_do_not_overlap() {
        // a matches any id with high nibble 0x1_; b matches only 0x20
        // exactly, whose high nibble is 0x2 — no id satisfies both.
        let a = sub(0xF0, 0x10);
        let b = sub(0xFF, 0x20);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn overlap_rejection_then_disjoint_acceptance() {
        let mut table = RegistrationTable::new();
        let handler = Handler::Rpc(Arc::new(|_, _, _, _| Ok(Value::Null)), ScheduleFlag(true));

        let accepted = table.add_local(handler.clone(), vec![sub(0xF0, 0x10)]);
        assert_eq!(accepted.len(), 1);

        let rejected = table.add_local(handler.clone(), vec![sub(0xF0, 0x10)]);
        assert!(rejected.is_empty());

        let accepted2 = table.add_local(handler, vec![sub(0xFF, 0x20)]);
        assert_eq!(accepted2.len(), 1);
    }

    #[test]
    fn find_routes_includes_local_sentinel() {
        let mut table = RegistrationTable::new();
        let handler = Handler::Rpc(Arc::new(|_, _, _, _| Ok(Value::Null)), ScheduleFlag(true));
        table.add_local(handler, vec![sub(0, 0)]);

        let routes = table.find_routes(
            MessageKind::RpcRequest,
            &Label::Int(1),
            &Label::Text("echo".into()),
            42,
        );
        assert_eq!(routes.as_slice(), &[PeerIdentity::Local]);
    }
}
