//! Frame codec.
//!
//! Each frame carries exactly one [`Message`]:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The payload layout is delegated to a [`Serializer`]; [`JsonSerializer`]
//! is the default. Framing errors (oversized or truncated length prefix) are
//! fatal to the connection. A payload that frames correctly but fails to
//! deserialize is surfaced as [`InboundFrame::Malformed`] so the session can
//! log and drop it without closing.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossline_core::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O or framing failure.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
    /// Payload could not be deserialized.
    #[error("failed to deserialize payload: {0}")]
    Deserialize(String),
}

/// Converts messages to and from frame payload bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a message into payload bytes.
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError>;
    /// Decode payload bytes into a message.
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// JSON payload serializer.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// One decoded inbound frame.
#[derive(Debug)]
pub enum InboundFrame {
    /// A well-formed message.
    Message(Message),
    /// A frame whose payload could not be decoded.
    Malformed {
        /// Payload length in bytes.
        len: usize,
        /// Decoder error text.
        reason: String,
    },
}

/// Length-prefixed message codec.
pub struct MessageCodec {
    framing: LengthDelimitedCodec,
    serializer: Arc<dyn Serializer>,
}

impl MessageCodec {
    /// Create a codec with the given serializer and frame size limit.
    pub fn new(serializer: Arc<dyn Serializer>, max_frame_bytes: usize) -> Self {
        let framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            framing,
            serializer,
        }
    }

    /// JSON codec with the given frame size limit.
    pub fn json(max_frame_bytes: usize) -> Self {
        Self::new(Arc::new(JsonSerializer), max_frame_bytes)
    }
}

impl Decoder for MessageCodec {
    type Item = InboundFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        let decoded = match self.serializer.decode(&frame) {
            Ok(message) => InboundFrame::Message(message),
            Err(e) => InboundFrame::Malformed {
                len: frame.len(),
                reason: e.to_string(),
            },
        };
        Ok(Some(decoded))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.serializer.encode(&item)?;
        self.framing.encode(payload, dst)?;
        Ok(())
    }
}
