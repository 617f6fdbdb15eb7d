//! Error taxonomy (spec.md §7).
//!
//! Two families: [`RpcError`] is raised from blocking calls (`wait`,
//! `send_rpc`, `abort`). [`RpcOutcome`] is never raised — it's the typed
//! value that lands in an [`crate::future::Rpc`]'s `results` list when a
//! particular target didn't return `rc == 0`.

use crate::identity::PeerIdentity;
use std::io;
use thiserror::Error;

/// Errors raised directly by blocking/fallible public operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No peer (including local) had a subscription matching the request
    /// at the time it was sent; no frame was ever written to the wire.
    #[error("no peer is routable for this request")]
    Unroutable,

    /// A blocking wait exceeded its deadline. The underlying RPC keeps
    /// running; a later `wait` on the same future can still succeed.
    #[error("wait timed out")]
    WaitTimeout,

    /// `abort` was called on a future that had already completed.
    #[error("future is already complete")]
    AlreadyComplete,

    /// Transport-level failure while encoding/writing a request.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// A remote handler raised a typed error that the caller should be able to
/// reconstruct locally by its registered code (spec.md §9 "Typed remote
/// errors").
#[derive(Error, Debug, Clone, PartialEq)]
#[error("handled error {code} from {peer}: {args:?}")]
pub struct HandledError {
    /// The peer that raised the error.
    pub peer: PeerIdentity,
    /// The registered error code.
    pub code: u32,
    /// The constructor arguments carried on the wire.
    pub args: Vec<crate::value::Value>,
}

/// One per-peer outcome of an RPC (spec.md §3 `RPC future.results` and
/// §7's in-results error kinds). Exactly one of these is produced per
/// target that contributes a response (or a lost-connection / abort
/// substitute).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    /// The target returned `rc == 0`: the payload verbatim.
    #[error("ok")]
    Ok(crate::value::Value),

    /// The target had no subscription matching the request when it
    /// arrived (`rc == NO_HANDLER`).
    #[error("no remote handler on {0}")]
    NoRemoteHandler(PeerIdentity),

    /// The target's handler raised a registered typed error
    /// (`rc == KNOWN_ERR`).
    #[error(transparent)]
    Handled(HandledError),

    /// The target's handler raised an error with no registered
    /// reconstructor (`rc == UNKNOWN_ERR`).
    #[error("remote exception on {peer}: {trace}")]
    RemoteException {
        /// The peer whose handler raised.
        peer: PeerIdentity,
        /// The formatted remote traceback/message.
        trace: String,
    },

    /// The target's connection dropped before it responded.
    #[error("lost connection to {0}")]
    LostConnection(PeerIdentity),

    /// The target returned an `rc` outside the known set.
    #[error("unrecognized remote problem from {peer}: rc={rc}")]
    UnrecognizedRemoteProblem {
        /// The peer that returned the unrecognized code.
        peer: PeerIdentity,
        /// The unrecognized return code.
        rc: u32,
        /// The raw payload that came with it.
        result: crate::value::Value,
    },

    /// A [`crate::future::Dependent`]'s callback panicked or otherwise
    /// raised; this is the value installed as that Dependent's (and its
    /// descendents') result.
    #[error("dependent callback failed: {0}")]
    DependentCallbackException(String),
}

/// Internal, non-spec errors surfaced from the peer connection and codec
/// layers (wire/IO failures below the RPC-result boundary). Modeled after
/// the teacher's flat per-crate error enum.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed to decode (malformed length prefix, unknown message
    /// kind, or a codec deserialization failure).
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer's HANDSHAKE carried a protocol version we don't speak.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// This node's protocol version.
        local: u32,
        /// The version the peer announced.
        remote: u32,
    },

    /// No HANDSHAKE arrived before the configured deadline.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The peer's socket is not in a state that can accept this frame.
    #[error("peer is not established")]
    NotEstablished,
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// What a local handler may raise to signal failure back to the caller.
/// `Known` becomes `rc == KNOWN_ERR` on the wire (reconstructed locally by
/// the registry on the caller's side); `Unknown` becomes `rc ==
/// UNKNOWN_ERR` carrying just a formatted message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteHandlerError {
    /// A registered error code plus its constructor arguments.
    #[error("known handler error {0}")]
    Known(u32, Vec<crate::value::Value>),
    /// An unregistered failure; only a message crosses the wire.
    #[error("unknown handler error: {0}")]
    Unknown(String),
}

impl TransportError {
    /// Whether this failure should retire the peer (vs. being a one-off
    /// recoverable hiccup). Kept for parity with the teacher's
    /// `is_recoverable`/`is_connection_error` predicates even though, per
    /// spec.md §4.2, nearly every transport error here does retire the
    /// peer — there's no reconnect path in this fabric.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::VersionMismatch { .. }
                | Self::HandshakeTimeout(_)
                | Self::Codec(_)
        )
    }
}
