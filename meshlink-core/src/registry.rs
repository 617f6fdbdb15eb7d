//! Process-wide registry of typed remote error constructors.
//!
//! spec.md §9 "Typed remote errors": a remote handler may raise a typed
//! error that the caller reconstructs locally. The wire only carries
//! `(code, args)`; this registry maps a code back to a constructor so
//! [`crate::error::HandledError`] can be built with that code attached.
//! Unregistered codes still reconstruct — they just carry the code as an
//! opaque `u32` instead of the registrant's name, matching the original's
//! `HANDLED_ERROR_TYPES.get(err_code, errors.HandledError)` fallback.

use crate::error::HandledError;
use crate::identity::PeerIdentity;
use crate::value::Value;
use dashmap::DashMap;
use once_cell::sync::Lazy;

/// A constructor for a registered error code.
pub type ErrorCtor = fn(PeerIdentity, Vec<Value>) -> HandledError;

fn default_ctor(peer: PeerIdentity, code: u32, args: Vec<Value>) -> HandledError {
    HandledError { peer, code, args }
}

static REGISTRY: Lazy<DashMap<u32, ErrorCtor>> = Lazy::new(DashMap::new);

/// Register a constructor for `code`. Overwrites any previous registration
/// for the same code.
pub fn register_error_code(code: u32, ctor: ErrorCtor) {
    REGISTRY.insert(code, ctor);
}

/// Remove a registration, if any.
pub fn unregister_error_code(code: u32) {
    REGISTRY.remove(&code);
}

/// Reconstruct a [`HandledError`] for `code`, falling back to the generic
/// constructor when nothing is registered.
#[must_use]
pub fn reconstruct(peer: PeerIdentity, code: u32, args: Vec<Value>) -> HandledError {
    match REGISTRY.get(&code) {
        Some(ctor) => ctor(peer, args),
        None => default_ctor(peer, code, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_generic_for_unregistered_code() {
        let err = reconstruct(PeerIdentity::Local, 9999, vec![Value::Int(1)]);
        assert_eq!(err.code, 9999);
        assert_eq!(err.args, vec![Value::Int(1)]);
    }

    #[test]
    fn registered_ctor_is_used() {
        fn ctor(peer: PeerIdentity, args: Vec<Value>) -> HandledError {
            HandledError {
                peer,
                code: 42,
                args,
            }
        }
        register_error_code(42, ctor);
        let err = reconstruct(PeerIdentity::Local, 42, vec![]);
        assert_eq!(err.code, 42);
        unregister_error_code(42);
    }
}
