//! Wire Codec
//!
//! Envelopes travel as JSON, one serialized envelope per length-prefixed
//! frame. Transports own the `u32` big-endian length prefix; this module
//! owns the body encoding, decode validation, and the frame-size guard.

use crate::envelope::Envelope;
use crate::{ProtocolError, Result};
use bytes::Bytes;

/// Bytes in the frame length prefix transports write before each body
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default ceiling on a single decoded frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialize an envelope to its wire body
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let body = serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::malformed_with_source("Failed to serialize envelope", e))?;
    Ok(Bytes::from(body))
}

/// Deserialize a wire body into an envelope
///
/// Unknown `messageType` values and structurally invalid bodies surface as
/// [`ProtocolError::Malformed`]; decode never panics on peer input.
pub fn decode(body: &[u8]) -> Result<Envelope> {
    decode_limited(body, DEFAULT_MAX_FRAME_SIZE)
}

/// Deserialize a wire body, rejecting frames over `max_frame_size`
pub fn decode_limited(body: &[u8], max_frame_size: usize) -> Result<Envelope> {
    if body.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            limit: max_frame_size,
        });
    }

    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::malformed_with_source("Failed to parse envelope", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Environment};
    use crate::correlation::CorrelationId;
    use serde_json::json;

    #[test]
    fn test_encode_decode_round_trip() {
        let ctx = Context::new(Environment::Browser);
        let req = Envelope::request(
            &ctx,
            "ui/panel",
            "server/commands/ping",
            json!({"echo": "hi"}),
            Some(CorrelationId::from("req_1_abc")),
        );

        let body = encode(&req).unwrap();
        let decoded = decode(&body).unwrap();

        assert_eq!(decoded, req);
        assert_eq!(decoded.correlation_id().unwrap().as_str(), "req_1_abc");
    }

    #[test]
    fn test_decode_rejects_unknown_message_type() {
        let body = br#"{
            "messageType": "telegram",
            "context": {"uuid": "9f0e1d2c-3b4a-5968-8776-5a4b3c2d1e0f", "environment": "server"},
            "origin": "a", "endpoint": "b", "payload": {}
        }"#;

        let err = decode(body).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let err = decode_limited(&[0u8; 128], 64).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size: 128, limit: 64 }
        ));
    }
}
