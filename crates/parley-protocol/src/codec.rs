//! Codec for live-channel events.
//!
//! Two encodings are supported. JSON travels in text frames and MessagePack
//! (with string keys and string identifiers) travels in binary frames.
//! Clients pick the encoding of server events at handshake time; inbound
//! frames are decoded according to their frame type.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded event size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Unknown encoding name.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Encoding used for frames sent to a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl std::str::FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::Msgpack),
            other => Err(ProtocolError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// An encoded event ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a value with the given encoding.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    let frame = match encoding {
        Encoding::Json => WireFrame::Text(serde_json::to_string(value)?),
        Encoding::Msgpack => {
            let mut buf = Vec::with_capacity(128);
            let mut serializer = rmp_serde::Serializer::new(&mut buf)
                .with_struct_map()
                .with_human_readable();
            value.serialize(&mut serializer)?;
            WireFrame::Binary(Bytes::from(buf))
        }
    };

    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }

    Ok(frame)
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode a MessagePack binary frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    let mut deserializer = rmp_serde::Deserializer::new(data).with_human_readable();
    Ok(T::deserialize(&mut deserializer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, MessageDraft, ServerEvent};
    use crate::model::PresenceStatus;
    use uuid::Uuid;

    #[test]
    fn test_json_is_text_frame() {
        let event = ServerEvent::status(Uuid::new_v4(), PresenceStatus::Online);
        match encode(&event, Encoding::Json).unwrap() {
            WireFrame::Text(text) => assert!(text.contains("\"user:status\"")),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_msgpack_client_event() {
        let event = ClientEvent::MessageSend {
            chat_id: Uuid::new_v4(),
            message: MessageDraft::text("hello"),
            ack: Some(3),
        };

        let WireFrame::Binary(data) = encode(&event, Encoding::Msgpack).unwrap() else {
            panic!("Expected binary frame");
        };
        let decoded: ClientEvent = decode_binary(&data).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_text::<ClientEvent>("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(decode_binary::<ClientEvent>(&[0xc1]).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let event = ClientEvent::MessageSend {
            chat_id: Uuid::new_v4(),
            message: MessageDraft::text("x".repeat(MAX_FRAME_SIZE + 1)),
            ack: None,
        };

        match encode(&event, Encoding::Json) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("MsgPack".parse::<Encoding>().unwrap(), Encoding::Msgpack);
        assert!("xml".parse::<Encoding>().is_err());
    }
}
