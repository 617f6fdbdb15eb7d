//! Pluggable peer-selection and connection-loss policies (spec.md §4.5).
//!
//! A host supplies a [`Hooks`] implementation; any method it doesn't
//! override falls back to the default behavior described below. A hook
//! that panics is caught and logged, falling back the same way a missing
//! hook would — a faulty host policy must never take down a peer's
//! receive task.

use crate::identity::PeerIdentity;
use crate::subscription::{RoutingId, Subscription};
use crate::value::Label;
use rand::seq::SliceRandom;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Host-supplied policy for peer selection and connection-loss
/// notification. Every method has a default so a host only overrides
/// what it cares about.
pub trait Hooks: Send + Sync {
    /// Pick one peer from `addrs` to carry a singular-target RPC. The
    /// default prefers [`PeerIdentity::Local`] if present, otherwise
    /// picks uniformly at random.
    fn select_peer(
        &self,
        addrs: &[PeerIdentity],
        _service: &Label,
        _routing_id: RoutingId,
        _method: &Label,
    ) -> PeerIdentity {
        default_select_peer(addrs)
    }

    /// Invoked after a peer's connection transitions ESTABLISHED →
    /// CLOSED, with the subscriptions it had registered at the time of
    /// loss. The default does nothing.
    fn connection_lost(&self, _peer: PeerIdentity, _subscriptions: &[Subscription]) {}
}

fn default_select_peer(addrs: &[PeerIdentity]) -> PeerIdentity {
    if let Some(local) = addrs.iter().find(|p| p.is_local()) {
        return *local;
    }
    addrs
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(PeerIdentity::Local)
}

/// A no-op [`Hooks`] implementation used when a node is constructed
/// without a host-supplied policy.
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// Wraps a host-supplied [`Hooks`] so a panicking hook is caught, logged,
/// and the default behavior substituted (spec.md §4.1 "Failure of the
/// hook callback is logged and falls back to the default").
pub struct GuardedHooks {
    inner: Arc<dyn Hooks>,
}

impl GuardedHooks {
    /// Wrap `hooks` for safe invocation.
    #[must_use]
    pub fn new(hooks: Arc<dyn Hooks>) -> Self {
        Self { inner: hooks }
    }

    /// The default, no-op policy.
    #[must_use]
    pub fn default_hooks() -> Self {
        Self::new(Arc::new(DefaultHooks))
    }

    /// Guarded `select_peer`.
    #[must_use]
    pub fn select_peer(
        &self,
        addrs: &[PeerIdentity],
        service: &Label,
        routing_id: RoutingId,
        method: &Label,
    ) -> PeerIdentity {
        tracing::debug!(%service, %method, routing_id, "invoking select_peer hook");
        let inner = &self.inner;
        match catch_unwind(AssertUnwindSafe(|| {
            inner.select_peer(addrs, service, routing_id, method)
        })) {
            Ok(peer) => peer,
            Err(_) => {
                tracing::warn!("select_peer hook panicked, falling back to default");
                default_select_peer(addrs)
            }
        }
    }

    /// Guarded `connection_lost`.
    pub fn connection_lost(&self, peer: PeerIdentity, subscriptions: &[Subscription]) {
        tracing::debug!(%peer, "invoking connection_lost hook");
        let inner = &self.inner;
        if catch_unwind(AssertUnwindSafe(|| inner.connection_lost(peer, subscriptions))).is_err()
        {
            tracing::warn!(%peer, "connection_lost hook panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::MessageKind;

    #[test]
    fn default_select_peer_prefers_local() {
        let addrs = [
            PeerIdentity::Remote("127.0.0.1:1".parse().unwrap()),
            PeerIdentity::Local,
        ];
        assert_eq!(default_select_peer(&addrs), PeerIdentity::Local);
    }

    #[test]
    fn default_select_peer_picks_from_remotes_when_no_local() {
        let only = PeerIdentity::Remote("127.0.0.1:1".parse().unwrap());
        assert_eq!(default_select_peer(&[only]), only);
    }

    struct PanicyHooks;
    impl Hooks for PanicyHooks {
        fn select_peer(
            &self,
            _addrs: &[PeerIdentity],
            _service: &Label,
            _routing_id: RoutingId,
            _method: &Label,
        ) -> PeerIdentity {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_select_peer_falls_back_to_default() {
        let guarded = GuardedHooks::new(Arc::new(PanicyHooks));
        let addrs = [PeerIdentity::Local];
        let peer = guarded.select_peer(&addrs, &Label::Int(1), 0, &Label::Int(1));
        assert_eq!(peer, PeerIdentity::Local);
    }

    #[test]
    fn default_hooks_connection_lost_is_a_no_op() {
        let guarded = GuardedHooks::default_hooks();
        let sub = Subscription {
            kind: MessageKind::Publish,
            service: Label::Int(1),
            method: Label::Int(1),
            mask: 0,
            value: 0,
        };
        guarded.connection_lost(PeerIdentity::Local, &[sub]);
    }
}
