//! # Meshlink
//!
//! A peer-to-peer RPC and publish/subscribe messaging fabric built on
//! `io_uring`.
//!
//! Every [`Node`] binds one TCP listener and dials a fixed set of static
//! peers; once connected, any node can `publish` one-way messages or
//! `rpc` fan out a request to every peer (including itself) whose
//! subscription matches, and collect per-peer results as an
//! [`Rpc`](meshlink_core::future::Rpc) future.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use meshlink::{Node, NodeConfig};
//! use meshlink_core::value::{Label, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::new("127.0.0.1:9000".parse()?, vec![], NodeConfig::default());
//! node.start().await?;
//!
//! node.accept_rpc(Label::from("calc"), Label::from("add"), 0, 0, |_from, _rid, args, _kw| {
//!     let sum: i64 = args.iter().filter_map(|v| match v {
//!         Value::Int(n) => Some(*n),
//!         _ => None,
//!     }).sum();
//!     Ok(Value::Int(sum))
//! }, true);
//!
//! let rpc = node.send_rpc(Label::from("calc"), Label::from("add"), 0, vec![Value::Int(1), Value::Int(2)], vec![])?;
//! let results = node.client().wait(&[rpc.clone()], None).await?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`meshlink-core`**: peer connection state machine, wire codec,
//!   subscription table, RPC future graph, and the dispatcher that wires
//!   them together — runtime-agnostic aside from its `compio` I/O.
//! - **`meshlink`** (this crate): the embedding surface, `Node`, built
//!   on top of `meshlink-core`'s `Dispatcher`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub use meshlink_core as core;
pub use meshlink_core::error::{HandledError, RemoteHandlerError, RpcError, RpcOutcome};
pub use meshlink_core::future::{AnyFuture, CallbackOutput, Completion, Dependent, Rpc};
pub use meshlink_core::hooks::{DefaultHooks, Hooks};
pub use meshlink_core::identity::PeerIdentity;
pub use meshlink_core::registry::{register_error_code, unregister_error_code};
pub use meshlink_core::subscription::{MessageKind, RoutingId, Subscription};
pub use meshlink_core::value::{KwArgs, Label, Value};

pub mod node;
pub use node::{Node, NodeConfig, NodeError};

/// Development helpers (benches/tests).
pub mod dev_tracing;
