//! Wire framing: a length-prefixed, `bincode`-serialized envelope around
//! one of the six frame kinds (spec.md §6).

use crate::client::RpcRequestFrame;
use crate::error::TransportError;
use crate::identity::PeerIdentity;
use crate::subscription::Subscription;
use crate::value::{KwArgs, Value};
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};

/// The protocol version this build speaks. A peer whose HANDSHAKE
/// carries a different value fails the connection (spec.md §4.2).
pub const PROTOCOL_VERSION: u32 = 1;

/// Ceiling on a single frame's encoded length, guarding against a
/// corrupt or hostile length prefix causing an unbounded allocation.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One of the six wire frame kinds (spec.md §6's framing table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// `(version, (host, port), [subscription...])`.
    Handshake {
        /// The sender's protocol version.
        version: u32,
        /// The sender's advertised identity.
        identity: PeerIdentity,
        /// The sender's full local subscription list at connect time.
        subscriptions: Vec<Subscription>,
    },
    /// Subscriptions newly registered since the last announce/handshake.
    Announce(Vec<Subscription>),
    /// Subscriptions no longer registered.
    Unannounce(Vec<Subscription>),
    /// `(service, method, routing_id, args, kwargs)`.
    Publish {
        /// The service label.
        service: crate::value::Label,
        /// The method label.
        method: crate::value::Label,
        /// The routing id.
        routing_id: crate::subscription::RoutingId,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: KwArgs,
    },
    /// A decoded RPC request.
    RpcRequest(RpcRequestFrame),
    /// `(counter, rc, result)`.
    RpcResponse {
        /// The counter being answered.
        counter: u64,
        /// The return code (see [`crate::client::rc`]).
        rc: u32,
        /// The response payload (shape depends on `rc`).
        result: Value,
    },
}

/// Serialize `frame` to its `bincode` encoding (no length prefix).
///
/// # Errors
/// Propagates `bincode` encode failures.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(frame)?)
}

/// Deserialize a `bincode`-encoded frame payload.
///
/// # Errors
/// Propagates `bincode` decode failures.
pub fn decode_frame(payload: &[u8]) -> Result<Frame, TransportError> {
    Ok(bincode::deserialize(payload)?)
}

/// Encode `frame` as a 4-byte big-endian length prefix followed by its
/// `bincode` encoding, and write it to `stream`.
///
/// # Errors
/// Propagates encode failures and I/O errors from the underlying write.
pub async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let payload = encode_frame(frame)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Codec("frame too large to encode".into()))?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);

    let compio::buf::BufResult(res, _) = stream.write_all(buf).await;
    res?;
    Ok(())
}

/// Read one length-prefixed `bincode`-encoded frame from `stream`.
///
/// # Errors
/// [`TransportError::Io`] on a clean EOF or I/O failure, and
/// [`TransportError::Codec`] if the length prefix exceeds the maximum
/// frame size or the payload fails to decode.
pub async fn read_frame<S>(stream: &mut S) -> Result<Frame, TransportError>
where
    S: AsyncRead + Unpin,
{
    let len_buf = vec![0u8; 4];
    let compio::buf::BufResult(res, len_buf) = stream.read_exact(len_buf).await;
    res?;
    let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Codec(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }

    let payload_buf = vec![0u8; len as usize];
    let compio::buf::BufResult(res, payload_buf) = stream.read_exact(payload_buf).await;
    res?;

    decode_frame(&payload_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_publish_frame() {
        let frame = Frame::Publish {
            service: crate::value::Label::Int(1),
            method: crate::value::Label::Text("echo".into()),
            routing_id: 0,
            args: vec![Value::Text("hello".into())],
            kwargs: vec![],
        };

        let encoded = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&encoded).unwrap();

        match decoded {
            Frame::Publish {
                routing_id, args, ..
            } => {
                assert_eq!(routing_id, 0);
                assert_eq!(args, vec![Value::Text("hello".into())]);
            }
            _ => panic!("unexpected frame kind"),
        }
    }

    #[test]
    fn round_trips_a_handshake_frame() {
        let frame = Frame::Handshake {
            version: PROTOCOL_VERSION,
            identity: PeerIdentity::Remote("127.0.0.1:9000".parse().unwrap()),
            subscriptions: vec![Subscription {
                kind: crate::subscription::MessageKind::RpcRequest,
                service: crate::value::Label::Int(1),
                method: crate::value::Label::Text("echo".into()),
                mask: 0,
                value: 0,
            }],
        };
        let encoded = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        match decoded {
            Frame::Handshake {
                version,
                subscriptions,
                ..
            } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(subscriptions.len(), 1);
            }
            _ => panic!("unexpected frame kind"),
        }
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let err = decode_frame(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
