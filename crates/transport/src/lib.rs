//! Voice Session Transport Layer
//!
//! Outbound and inbound audio plumbing for one client connection:
//! - Binary wire framing (16-byte relay header and the gateway sequence header)
//! - Timestamp-keyed reorder buffer for transports that deliver out of order
//! - Paced, serialized output controller
//! - Opus encode/decode and resampling

pub mod codec;
pub mod framing;
pub mod pacer;
pub mod reorder;

pub use codec::{AudioCodec, OpusDecoder, OpusEncoder, Resampler};
pub use framing::{FrameHeader, GatewayHeader, PacketKind, WireFraming, FRAME_HEADER_LEN, GATEWAY_HEADER_LEN};
pub use pacer::{OutboundPacket, OutputController, PacketSink, Pacer, PacerOptions};
pub use reorder::ReorderBuffer;

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for voice_session_core::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Codec(msg) | TransportError::UnsupportedFormat(msg) => {
                voice_session_core::AudioError::Codec(msg).into()
            }
            other => voice_session_core::Error::other(other.to_string()),
        }
    }
}
