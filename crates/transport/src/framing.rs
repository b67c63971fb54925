//! Binary wire framing
//!
//! Relay header (16 bytes):
//! ```text
//! [type:1][tag:1][payload_len:4 BE][reserved:10]
//! ```
//! Gateway header (16 bytes), for transports that may reorder packets:
//! ```text
//! [type:1][reserved:1][payload_len:2 BE][sequence:4 BE][timestamp:4 BE][payload_len:4 BE]
//! ```

use crate::TransportError;

pub const FRAME_HEADER_LEN: usize = 16;
pub const GATEWAY_HEADER_LEN: usize = 16;

/// Payload type carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Audio = 1,
    Json = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Audio),
            2 => Ok(PacketKind::Json),
            other => Err(TransportError::InvalidFrame(format!("unknown packet type {}", other))),
        }
    }
}

/// Relay frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: PacketKind,
    pub tag: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(kind: PacketKind, payload_len: usize) -> Self {
        Self {
            kind,
            tag: 0,
            payload_len: payload_len as u32,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.tag;
        buf[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Prepend the header to a payload
    pub fn frame(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
        let header = Self::new(kind, payload.len()).encode();
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    /// Parse a framed packet into its header and payload
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), TransportError> {
        if packet.len() < FRAME_HEADER_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "packet of {} bytes is shorter than the header",
                packet.len()
            )));
        }

        let kind = PacketKind::try_from(packet[0])?;
        let payload_len = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
        let payload = &packet[FRAME_HEADER_LEN..];
        if payload.len() != payload_len as usize {
            return Err(TransportError::InvalidFrame(format!(
                "header says {} payload bytes, got {}",
                payload_len,
                payload.len()
            )));
        }

        Ok((
            Self {
                kind,
                tag: packet[1],
                payload_len,
            },
            payload,
        ))
    }
}

/// Gateway header with sequence and timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayHeader {
    pub kind: PacketKind,
    pub payload_len: u16,
    pub sequence: u32,
    /// Milliseconds since the start of the stream
    pub timestamp: u32,
}

impl GatewayHeader {
    pub fn encode(&self) -> [u8; GATEWAY_HEADER_LEN] {
        let mut buf = [0u8; GATEWAY_HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[2..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[12..16].copy_from_slice(&(self.payload_len as u32).to_be_bytes());
        buf
    }

    pub fn frame(kind: PacketKind, sequence: u32, timestamp: u32, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let payload_len = u16::try_from(payload.len()).map_err(|_| {
            TransportError::InvalidFrame(format!("payload of {} bytes exceeds gateway limit", payload.len()))
        })?;
        let header = Self {
            kind,
            payload_len,
            sequence,
            timestamp,
        };

        let mut out = Vec::with_capacity(GATEWAY_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(payload);
        Ok(out)
    }

    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), TransportError> {
        if packet.len() < GATEWAY_HEADER_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "packet of {} bytes is shorter than the gateway header",
                packet.len()
            )));
        }

        let kind = PacketKind::try_from(packet[0])?;
        let payload_len = u16::from_be_bytes([packet[2], packet[3]]);
        let sequence = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let timestamp = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let len_dup = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);

        if len_dup != payload_len as u32 {
            return Err(TransportError::InvalidFrame(format!(
                "length fields disagree: {} vs {}",
                payload_len, len_dup
            )));
        }
        let payload = &packet[GATEWAY_HEADER_LEN..];
        if payload.len() != payload_len as usize {
            return Err(TransportError::InvalidFrame(format!(
                "header says {} payload bytes, got {}",
                payload_len,
                payload.len()
            )));
        }

        Ok((
            Self {
                kind,
                payload_len,
                sequence,
                timestamp,
            },
            payload,
        ))
    }
}

/// How binary packets are wrapped for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFraming {
    /// Bare payloads
    #[default]
    Raw,
    /// 16-byte relay header
    Relay,
    /// Gateway header with sequence/timestamp; receiver reorders
    Gateway,
}

impl WireFraming {
    /// Map the `transport` field of a client hello
    pub fn from_transport(transport: &str) -> Self {
        match transport {
            "gateway" => WireFraming::Relay,
            "gateway-unordered" => WireFraming::Gateway,
            _ => WireFraming::Raw,
        }
    }
}
