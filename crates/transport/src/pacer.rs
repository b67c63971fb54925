//! Paced audio output
//!
//! The client plays audio in real time, so sending it all at once only grows the client's
//! buffer and delays interruption. The pacer lets `prebuffer` packets through immediately and
//! then schedules each packet slightly faster than real time. Overruns move the schedule
//! forward instead of bursting to catch up.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::framing::{FrameHeader, GatewayHeader, PacketKind, WireFraming};
use crate::TransportError;

/// Pacing parameters
#[derive(Debug, Clone)]
pub struct PacerOptions {
    /// Playback duration of one audio packet
    pub packet_duration: Duration,
    /// Send interval as a fraction of `packet_duration`
    pub pace_ratio: f64,
    /// Packets sent without waiting at the start of each reply
    pub prebuffer: usize,
}

impl Default for PacerOptions {
    fn default() -> Self {
        Self {
            packet_duration: Duration::from_millis(60),
            pace_ratio: 0.95,
            prebuffer: 5,
        }
    }
}

/// Drift-corrected send scheduler
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    prebuffer: usize,
    origin: Option<Instant>,
    sent: usize,
}

impl Pacer {
    pub fn new(options: &PacerOptions) -> Self {
        let nanos = options.packet_duration.as_nanos() as f64 * options.pace_ratio.clamp(0.1, 1.0);
        Self {
            interval: Duration::from_nanos(nanos.round() as u64),
            prebuffer: options.prebuffer,
            origin: None,
            sent: 0,
        }
    }

    /// Time between paced packets
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to wait before sending the next packet
    pub fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        let origin = *self.origin.get_or_insert(now);
        let index = self.sent;
        self.sent += 1;

        if index < self.prebuffer {
            return Duration::ZERO;
        }

        let slots = (index + 1 - self.prebuffer) as u32;
        let expected = origin + self.interval * slots;
        if expected > now {
            expected - now
        } else {
            // Absorb the overrun into the schedule
            self.origin = Some(origin + (now - expected));
            Duration::ZERO
        }
    }

    /// Sleep until the next packet is due
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Start a new schedule (called at the start of every reply)
    pub fn reset(&mut self) {
        self.origin = None;
        self.sent = 0;
    }
}

/// A packet ready for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Binary(Vec<u8>),
    Text(String),
}

/// Where the output controller writes
#[async_trait]
pub trait PacketSink: Send {
    async fn send_packet(&mut self, packet: OutboundPacket) -> Result<(), TransportError>;

    /// Close the underlying connection
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl PacketSink for Box<dyn PacketSink> {
    async fn send_packet(&mut self, packet: OutboundPacket) -> Result<(), TransportError> {
        (**self).send_packet(packet).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

/// Serialized, paced writer for one client connection
///
/// Every send takes `&mut self`, so each send completes before the next begins. Callers
/// sharing a controller across tasks hold it behind an async mutex.
pub struct OutputController<S> {
    sink: S,
    pacer: Pacer,
    framing: WireFraming,
    packet_ms: u32,
    sequence: u32,
    timestamp: u32,
}

impl<S: PacketSink> OutputController<S> {
    pub fn new(sink: S, framing: WireFraming, options: &PacerOptions) -> Self {
        Self {
            sink,
            pacer: Pacer::new(options),
            framing,
            packet_ms: options.packet_duration.as_millis() as u32,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Restart pacing for a new reply
    pub fn begin_reply(&mut self) {
        self.pacer.reset();
    }

    /// Send one encoded audio packet, waiting for its slot
    pub async fn send_audio(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.pacer.wait().await;

        let packet = match self.framing {
            WireFraming::Raw => payload.to_vec(),
            WireFraming::Relay => FrameHeader::frame(PacketKind::Audio, payload),
            WireFraming::Gateway => {
                let framed =
                    GatewayHeader::frame(PacketKind::Audio, self.sequence, self.timestamp, payload)?;
                self.sequence = self.sequence.wrapping_add(1);
                self.timestamp = self.timestamp.wrapping_add(self.packet_ms);
                framed
            }
        };

        self.sink.send_packet(OutboundPacket::Binary(packet)).await
    }

    /// Send a control message immediately
    pub async fn send_json(&mut self, text: String) -> Result<(), TransportError> {
        self.sink.send_packet(OutboundPacket::Text(text)).await
    }

    /// Close the connection; later sends fail at the sink
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
