use shared::protocol::{BackendFrame, OutgoingEnvelope};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Byte-level (de)serialization of wire frames. The multiplexer treats it as
/// an opaque pair.
pub trait WireCodec: Send + Sync {
    fn encode(&self, envelope: &OutgoingEnvelope) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<BackendFrame, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode(&self, envelope: &OutgoingEnvelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(envelope).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<BackendFrame, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use shared::{domain::MessageId, protocol::ContentMessage};

    use super::*;

    #[test]
    fn encodes_plaintext_envelope_with_type_tag() {
        let envelope = OutgoingEnvelope::Message {
            message: ContentMessage::plaintext(MessageId::from("m1"), "hi"),
        };
        let bytes = JsonCodec.encode(&envelope).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

        assert_eq!(value["type"], "message");
        assert_eq!(value["payload"]["message"]["id"], "m1");
        assert_eq!(value["payload"]["message"]["payload"]["text"], "hi");
    }

    #[test]
    fn decodes_ack_frame() {
        let frame = JsonCodec
            .decode(
                br#"{"type":"ack","payload":{"local_id":"m1","canonical_id":"m101","timestamp":"2024-01-01T00:00:00Z"}}"#,
            )
            .expect("decode");
        match frame {
            BackendFrame::Ack {
                local_id,
                canonical_id,
                ..
            } => {
                assert_eq!(local_id.as_str(), "m1");
                assert_eq!(canonical_id.as_str(), "m101");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_as_decode_error() {
        let err = JsonCodec.decode(b"not json").expect_err("must fail");
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
