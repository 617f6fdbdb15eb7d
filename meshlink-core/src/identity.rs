//! Peer identity: the `(host, port)` a peer announces during handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identifies a peer within a node's view of the mesh.
///
/// `Local` is the sentinel that denotes the owning node itself, returned
/// from route lookups alongside remote peers so a single code path can
/// treat "deliver to myself" and "deliver to a peer" uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerIdentity {
    /// The node's own process.
    Local,
    /// A remote peer, identified by the address it announced in its
    /// HANDSHAKE frame (not necessarily the socket's peer address, e.g.
    /// behind NAT the advertised address is authoritative).
    Remote(SocketAddr),
}

impl PeerIdentity {
    /// True for the `Local` sentinel.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// The remote socket address, if this isn't the local sentinel.
    #[must_use]
    pub const fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Local => None,
            Self::Remote(addr) => Some(*addr),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote(addr) => write!(f, "{addr}"),
        }
    }
}

impl From<SocketAddr> for PeerIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self::Remote(addr)
    }
}
