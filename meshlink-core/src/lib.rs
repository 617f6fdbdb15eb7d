//! Meshlink Core
//!
//! The runtime-agnostic kernel of the meshlink fabric: a peer-to-peer
//! RPC and publish/subscribe mesh over `io_uring`-backed TCP (spec.md).
//!
//! - `identity`/`value`/`subscription`: the wire-level vocabulary — peer
//!   identities, the dynamically-typed payload, and predicate-matched
//!   subscriptions plus the registration table they're stored in.
//! - `codec`: length-prefixed `bincode` framing.
//! - `peer`: one TCP connection's handshake and reader/writer tasks.
//! - `dispatcher`: wires peers, the subscription table, the RPC client,
//!   and host-supplied hooks together.
//! - `client`/`future`/`waiter`: RPC counter allocation, in-flight
//!   fan-out tracking, and the `Rpc`/`Dependent` future graph.
//! - `hooks`: pluggable peer-selection and connection-loss policy.
//! - `registry`: typed remote error reconstruction.
//! - `error`: the crate's error taxonomy.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod future;
pub mod hooks;
pub mod identity;
pub mod peer;
pub mod registry;
pub mod subscription;
pub mod tcp;
pub mod value;
pub mod waiter;

/// A small prelude to make downstream crates ergonomic. Keep it minimal
/// to avoid API lock-in.
pub mod prelude {
    pub use crate::client::{rc, Client, RpcRequestFrame};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{HandledError, RemoteHandlerError, RpcError, RpcOutcome, TransportError};
    pub use crate::future::{AnyFuture, CallbackOutput, Completion, Dependent, Rpc};
    pub use crate::hooks::{DefaultHooks, GuardedHooks, Hooks};
    pub use crate::identity::PeerIdentity;
    pub use crate::peer::{Peer, PeerConfig, PeerEvents, PeerState};
    pub use crate::subscription::{
        Handler, MessageKind, PublishHandler, RegistrationTable, RoutingId, RpcHandler,
        ScheduleFlag, Subscription,
    };
    pub use crate::value::{KwArgs, Label, Value};
}
