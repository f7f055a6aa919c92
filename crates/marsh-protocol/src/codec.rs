//! Length-prefixed JSON framing.

use crate::error::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame accepted by default (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Build the frame codec used on both ends of the connection.
///
/// Frames carry a 4-byte big-endian length prefix. Frames larger than
/// `max_frame_length` are rejected by the decoder.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Serialize a message into a frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Deserialize a frame payload.
///
/// Decoding is kept separate from the codec so that one malformed frame
/// does not terminate the framed stream.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallId, CallResponse, HostMessage, ProtocolError};
    use bytes::BytesMut;
    use serde_json::json;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_has_length_prefix() {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_LENGTH);
        let payload = encode(&HostMessage::Shutdown).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();

        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"kind":"shutdown"}"#);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_LENGTH);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, b'{'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = frame_codec(8);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_malformed() {
        let result = decode::<CallResponse>(b"not json");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let result = decode::<CallResponse>(br#"{"callId": 1, "kind": "bogus"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_response() {
        let frame = serde_json::to_vec(&json!({"callId": 9, "kind": "result", "value": [1, 2]})).unwrap();
        let response: CallResponse = decode(&frame).unwrap();
        assert_eq!(response.call_id, CallId::new(9));
    }
}
