//! WebSocket Handler
//!
//! One connection per session: the client opens with a `hello`, then streams audio as binary
//! messages and control messages as JSON text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use voice_session_transport::{
    FrameHeader, GatewayHeader, OutboundPacket, PacketKind, PacketSink, ReorderBuffer,
    TransportError, WireFraming,
};

use crate::metrics;
use crate::orchestrator::{SessionParams, VoiceSession};
use crate::protocol::{ClientMessage, ListenState};
use crate::rate_limit::RateLimiter;
use crate::session::SessionEntry;
use crate::state::AppState;

/// Connections that do not say hello in time are dropped
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle WebSocket upgrade
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Outbound half of the socket
struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl PacketSink for WsSink {
    async fn send_packet(&mut self, packet: OutboundPacket) -> Result<(), TransportError> {
        let message = match packet {
            OutboundPacket::Binary(data) => Message::Binary(data),
            OutboundPacket::Text(text) => Message::Text(text),
        };
        self.sender
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.sender.send(Message::Close(None)).await;
        self.sender
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Strips the per-transport binary framing from inbound audio
///
/// Unordered gateways go through a reorder buffer. Packets held behind a gap are released by
/// [`flush`](Self::flush) once the client has been quiet for a packet's duration.
pub enum InboundAudio {
    Raw,
    Relay,
    Gateway {
        reorder: ReorderBuffer<Vec<u8>>,
        packet: Duration,
    },
}

impl InboundAudio {
    pub fn new(framing: WireFraming, reorder_capacity: usize, packet_ms: u32) -> Self {
        match framing {
            WireFraming::Raw => InboundAudio::Raw,
            WireFraming::Relay => InboundAudio::Relay,
            WireFraming::Gateway => InboundAudio::Gateway {
                reorder: ReorderBuffer::new(reorder_capacity, packet_ms),
                packet: Duration::from_millis(packet_ms.max(1) as u64),
            },
        }
    }

    /// Audio payloads ready for decoding, in order
    pub fn payloads(&mut self, packet: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        match self {
            InboundAudio::Raw => Ok(vec![packet]),
            InboundAudio::Relay => {
                let (header, payload) = FrameHeader::decode(&packet)?;
                if header.kind != PacketKind::Audio {
                    return Ok(Vec::new());
                }
                Ok(vec![payload.to_vec()])
            }
            InboundAudio::Gateway { reorder, .. } => {
                let (header, payload) = GatewayHeader::decode(&packet)?;
                if header.kind != PacketKind::Audio {
                    return Ok(Vec::new());
                }
                Ok(reorder.push(header.timestamp, payload.to_vec()))
            }
        }
    }

    /// Release every held payload in timestamp order, skipping unfilled gaps
    pub fn flush(&mut self) -> Vec<Vec<u8>> {
        match self {
            InboundAudio::Gateway { reorder, .. } => reorder.flush(),
            InboundAudio::Raw | InboundAudio::Relay => Vec::new(),
        }
    }

    /// How long to wait for a missing packet before flushing; `None` when nothing is held
    pub fn idle_flush_after(&self) -> Option<Duration> {
        match self {
            InboundAudio::Gateway { reorder, packet } if reorder.waiting() > 0 => Some(*packet),
            _ => None,
        }
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let entry = match state.sessions.register() {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!("Rejecting connection: {}", e);
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (sender, mut receiver) = socket.split();
    let mut limiter = RateLimiter::new(&state.config.server.rate_limit);

    let params = match tokio::time::timeout(
        HELLO_TIMEOUT,
        await_hello(&mut receiver, &entry, &mut limiter),
    )
    .await
    {
        Ok(Some(params)) => params,
        Ok(None) => {
            tracing::info!(session_id = %entry.id, "Connection closed before hello");
            state.sessions.remove(&entry.id);
            return;
        }
        Err(_) => {
            tracing::info!(session_id = %entry.id, "No hello within {:?}", HELLO_TIMEOUT);
            state.sessions.remove(&entry.id);
            return;
        }
    };

    let framing = WireFraming::from_transport(&params.transport);
    let packet_ms = params.audio.frame_duration;
    let session = match VoiceSession::start(state.clone(), params, Box::new(WsSink { sender })).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(session_id = %entry.id, "Failed to start session: {}", e);
            state.sessions.remove(&entry.id);
            return;
        }
    };

    let mut inbound = InboundAudio::new(framing, state.config.pipeline.output.reorder_capacity, packet_ms);

    loop {
        let idle_flush = inbound.idle_flush_after();
        tokio::select! {
            _ = entry.stopped() => {
                tracing::info!(session_id = %entry.id, "Session stopped by server");
                break;
            }
            _ = session.closed() => break,
            _ = tokio::time::sleep(idle_flush.unwrap_or_default()), if idle_flush.is_some() => {
                let held = inbound.flush();
                tracing::debug!(session_id = %entry.id, packets = held.len(), "Gap not filled, releasing held audio");
                deliver(&session, held).await;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    entry.touch();
                    handle_audio(&session, &mut inbound, &mut limiter, data).await;
                }
                Some(Ok(Message::Text(text))) => {
                    entry.touch();
                    handle_text(&session, &mut inbound, &mut limiter, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %entry.id, "WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    deliver(&session, inbound.flush()).await;
    session.close().await;
    state.sessions.remove(&entry.id);
    tracing::info!(session_id = %entry.id, "WebSocket closed");
}

/// Read until the client hello; other messages before it are ignored
async fn await_hello(
    receiver: &mut SplitStream<WebSocket>,
    entry: &Arc<SessionEntry>,
    limiter: &mut RateLimiter,
) -> Option<SessionParams> {
    loop {
        match receiver.next().await? {
            Ok(Message::Text(text)) => {
                entry.touch();
                if let Err(e) = limiter.check_message() {
                    tracing::warn!(session_id = %entry.id, "Rate limit exceeded: {}", e);
                    metrics::record_protocol_error("rate_limited");
                    continue;
                }
                match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Hello {
                        version,
                        transport,
                        audio_params,
                        agent_id,
                        device_id,
                        features,
                    }) => {
                        tracing::debug!(session_id = %entry.id, version, features = ?features, "Client hello");
                        return Some(SessionParams {
                            session_id: entry.id.clone(),
                            transport,
                            audio: audio_params,
                            agent_id,
                            device_id,
                        });
                    }
                    Ok(_) => {
                        tracing::debug!(session_id = %entry.id, "Ignoring message before hello");
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %entry.id, "Malformed message: {}", e);
                        metrics::record_protocol_error("malformed");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn handle_audio(
    session: &VoiceSession,
    inbound: &mut InboundAudio,
    limiter: &mut RateLimiter,
    data: Vec<u8>,
) {
    if let Err(e) = limiter.check_audio(data.len()) {
        tracing::warn!(session_id = %session.id(), bytes = data.len(), "Audio rate limit exceeded: {}", e);
        metrics::record_protocol_error("rate_limited");
        return;
    }

    let payloads = match inbound.payloads(data) {
        Ok(payloads) => payloads,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), "Malformed audio packet: {}", e);
            metrics::record_protocol_error("malformed");
            return;
        }
    };

    deliver(session, payloads).await;
}

async fn deliver(session: &VoiceSession, payloads: Vec<Vec<u8>>) {
    for payload in payloads {
        if let Err(e) = session.receive_audio(payload).await {
            tracing::debug!(session_id = %session.id(), "Dropping audio packet: {}", e);
        }
    }
}

async fn handle_text(session: &VoiceSession, inbound: &mut InboundAudio, limiter: &mut RateLimiter, text: &str) {
    if let Err(e) = limiter.check_message() {
        tracing::warn!(session_id = %session.id(), "Rate limit exceeded: {}", e);
        metrics::record_protocol_error("rate_limited");
        return;
    }

    match ClientMessage::parse(text) {
        Ok(message) => {
            // The utterance's tail must reach recognition before the manual commit
            if matches!(message, ClientMessage::Listen { state: ListenState::Stop, .. }) {
                deliver(session, inbound.flush()).await;
            }
            session.handle_message(message)
        }
        Err(e) => {
            tracing::warn!(session_id = %session.id(), "Malformed message: {}", e);
            metrics::record_protocol_error("malformed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_framing_is_stripped() {
        let mut inbound = InboundAudio::new(WireFraming::Relay, 4, 60);
        let packet = FrameHeader::frame(PacketKind::Audio, &[1, 2, 3]);
        assert_eq!(inbound.payloads(packet).unwrap(), vec![vec![1, 2, 3]]);

        let control = FrameHeader::frame(PacketKind::Json, b"{}");
        assert!(inbound.payloads(control).unwrap().is_empty());

        assert!(inbound.payloads(vec![1, 2]).is_err());
    }

    #[test]
    fn test_gateway_packets_are_reordered() {
        let mut inbound = InboundAudio::new(WireFraming::Gateway, 4, 60);
        let packet = |seq: u32, ts: u32, byte: u8| {
            GatewayHeader::frame(PacketKind::Audio, seq, ts, &[byte]).unwrap()
        };

        assert_eq!(inbound.payloads(packet(0, 0, 10)).unwrap(), vec![vec![10]]);
        // 120 arrives before 60
        assert!(inbound.payloads(packet(2, 120, 30)).unwrap().is_empty());
        assert_eq!(
            inbound.payloads(packet(1, 60, 20)).unwrap(),
            vec![vec![20], vec![30]]
        );
    }

    #[test]
    fn test_gap_then_silence_releases_held_packets() {
        let mut inbound = InboundAudio::new(WireFraming::Gateway, 8, 60);
        let packet = |seq: u32, ts: u32, byte: u8| {
            GatewayHeader::frame(PacketKind::Audio, seq, ts, &[byte]).unwrap()
        };

        assert_eq!(inbound.payloads(packet(0, 0, 1)).unwrap(), vec![vec![1]]);
        assert_eq!(inbound.idle_flush_after(), None);

        // 60 is lost; the rest of the utterance waits behind it
        assert!(inbound.payloads(packet(2, 120, 3)).unwrap().is_empty());
        assert!(inbound.payloads(packet(3, 180, 4)).unwrap().is_empty());
        assert_eq!(inbound.idle_flush_after(), Some(Duration::from_millis(60)));

        assert_eq!(inbound.flush(), vec![vec![3], vec![4]]);
        assert_eq!(inbound.idle_flush_after(), None);

        // The stream continues after the skipped gap
        assert_eq!(inbound.payloads(packet(4, 240, 5)).unwrap(), vec![vec![5]]);
    }

    #[test]
    fn test_ordered_transports_hold_nothing() {
        let mut relay = InboundAudio::new(WireFraming::Relay, 8, 60);
        assert!(relay.flush().is_empty());
        assert_eq!(relay.idle_flush_after(), None);
    }

    #[test]
    fn test_raw_passthrough() {
        let mut inbound = InboundAudio::new(WireFraming::Raw, 4, 60);
        assert_eq!(inbound.payloads(vec![7, 7]).unwrap(), vec![vec![7, 7]]);
    }
}
