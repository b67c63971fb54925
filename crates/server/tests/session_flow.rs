//! Whole-session flows against scripted engines: hello, turns, replies, interruption, close

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use voice_session_config::Settings;
use voice_session_core::{
    channel, AudioEncoding, AudioFormat, AudioFrame, AudioStream, ChatDelta, ChatStream,
    DialogueContext, Error, LanguageModel, Receiver, Sender, SpeechData, SpeechEvent,
    SpeechToText, SttCapabilities, TextToSpeech, TtsCapabilities,
};
use voice_session_server::options::energy_vad_factory;
use voice_session_server::providers::TtsFactory;
use voice_session_server::{
    AppState, ClientMessage, ListenState, Providers, SessionParams, VoiceSession,
};
use voice_session_server::InboundAudio;
use voice_session_transport::{
    GatewayHeader, OpusEncoder, OutboundPacket, PacketKind, PacketSink, TransportError, WireFraming,
};

struct FixedStt;

#[async_trait]
impl SpeechToText for FixedStt {
    fn name(&self) -> &str {
        "fixed"
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: false,
            interim_results: false,
        }
    }

    async fn recognize(&self, _audio: &AudioFrame, _language: Option<&str>) -> Result<SpeechEvent, Error> {
        Ok(SpeechEvent::final_transcript(SpeechData::new("hello there", 0.9)))
    }
}

/// Replies from a script, word by word; falls back to a short answer
struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<DialogueContext>>,
}

impl ScriptedLlm {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, context: &DialogueContext) -> Result<ChatStream, Error> {
        self.prompts.lock().push(context.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| "Okay.".to_string());
        let deltas: Vec<Result<ChatDelta, Error>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(ChatDelta::text(word)))
            .collect();
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// 300 ms of tone per segment
struct ToneTts;

#[async_trait]
impl TextToSpeech for ToneTts {
    fn name(&self) -> &str {
        "tone"
    }

    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming: false,
            sample_rate: 16000,
        }
    }

    async fn synthesize(&self, _text: &str) -> Result<AudioStream, Error> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frame = AudioFrame::new(vec![2000; 4800], 16000, 1)?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(frame)])))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Json(serde_json::Value),
    Audio(usize),
    Closed,
}

impl Sent {
    /// `type` or `type:state` for JSON, `audio` or `closed` otherwise
    fn label(&self) -> String {
        match self {
            Sent::Json(value) => {
                let kind = value["type"].as_str().unwrap_or_default();
                match value["state"].as_str() {
                    Some(state) => format!("{}:{}", kind, state),
                    None => kind.to_string(),
                }
            }
            Sent::Audio(_) => "audio".to_string(),
            Sent::Closed => "closed".to_string(),
        }
    }
}

struct RecordingSink {
    sent: Sender<Sent>,
}

#[async_trait]
impl PacketSink for RecordingSink {
    async fn send_packet(&mut self, packet: OutboundPacket) -> Result<(), TransportError> {
        let sent = match packet {
            OutboundPacket::Binary(data) => Sent::Audio(data.len()),
            OutboundPacket::Text(text) => Sent::Json(
                serde_json::from_str(&text).map_err(|e| TransportError::Send(e.to_string()))?,
            ),
        };
        self.sent
            .send(sent)
            .map_err(|_| TransportError::Send("receiver dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.sent.send(Sent::Closed);
        Ok(())
    }
}

fn pcm_format() -> AudioFormat {
    AudioFormat {
        encoding: AudioEncoding::Pcm,
        sample_rate: 16000,
        channels: 1,
        frame_duration: 60,
    }
}

fn app_state(llm: Arc<ScriptedLlm>) -> AppState {
    app_state_with(llm, Settings::default())
}

fn app_state_with(llm: Arc<ScriptedLlm>, settings: Settings) -> AppState {
    let tts: TtsFactory = Arc::new(|_voice| Arc::new(ToneTts) as Arc<dyn TextToSpeech>);
    let providers = Providers {
        stt: Arc::new(FixedStt),
        llm,
        tts,
        vad: energy_vad_factory(&settings.pipeline.vad),
        classifier: None,
        lookup: None,
    };
    AppState::with_providers(settings, reqwest::Client::new(), providers)
}

async fn open(state: AppState, agent_id: Option<&str>) -> (VoiceSession, Receiver<Sent>) {
    open_with(state, agent_id, "websocket", pcm_format()).await
}

async fn open_with(
    state: AppState,
    agent_id: Option<&str>,
    transport: &str,
    audio: AudioFormat,
) -> (VoiceSession, Receiver<Sent>) {
    let (tx, rx) = channel();
    let params = SessionParams {
        session_id: "test-session".to_string(),
        transport: transport.to_string(),
        audio,
        agent_id: agent_id.map(str::to_string),
        device_id: None,
    };
    let session = VoiceSession::start(state, params, Box::new(RecordingSink { sent: tx }))
        .await
        .unwrap();
    (session, rx)
}

/// Everything sent up to and including the first packet labeled `until`
async fn collect_until(rx: &mut Receiver<Sent>, until: &str) -> Vec<Sent> {
    let mut seen = Vec::new();
    loop {
        let sent = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("never saw {}; got {:?}", until, seen))
            .unwrap_or_else(|| panic!("sink dropped before {}; got {:?}", until, seen));
        let done = sent.label() == until;
        seen.push(sent);
        if done {
            return seen;
        }
    }
}

fn labels(sent: &[Sent]) -> Vec<String> {
    let mut labels: Vec<String> = sent.iter().map(Sent::label).collect();
    labels.dedup_by(|a, b| a == "audio" && b == "audio");
    labels
}

fn tone_packet(level: i16) -> Vec<u8> {
    let samples: Vec<i16> = (0..960)
        .map(|i| if i % 2 == 0 { level } else { -level })
        .collect();
    AudioFrame::new(samples, 16000, 1).unwrap().to_pcm16_le()
}

/// 60 ms of a 440 Hz tone; `offset` keeps the phase continuous across packets
fn sine_samples(offset: usize, level: f32) -> Vec<i16> {
    (offset..offset + 960)
        .map(|i| ((i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16000.0).sin() * level) as i16)
        .collect()
}

/// Lets the session's event task catch up with what was just observed
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn count(sent: &[Sent], label: &str) -> usize {
    sent.iter().filter(|s| s.label() == label).count()
}

fn detect(text: &str) -> ClientMessage {
    ClientMessage::Listen {
        state: ListenState::Detect,
        mode: None,
        text: Some(text.to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_injected_turn_reply_order() {
    let llm = ScriptedLlm::new(&["Sure, I can help with that. What is your order number?"]);
    let (session, mut rx) = open(app_state(llm.clone()), None).await;

    let hello = collect_until(&mut rx, "hello").await;
    assert_eq!(hello.len(), 1);
    let Sent::Json(hello) = &hello[0] else {
        panic!("hello must be JSON");
    };
    assert_eq!(hello["session_id"], "test-session");
    assert!(session.agent_ready().await);

    session.handle_message(detect("where is my parcel"));
    let sent = collect_until(&mut rx, "tts:stop").await;
    let order = labels(&sent);

    assert_eq!(order[0], "stt");
    assert_eq!(sent[0], Sent::Json(serde_json::json!({"type": "stt", "text": "where is my parcel"})));
    assert_eq!(order[1], "tts:start");
    assert_eq!(order[2], "tts:sentence_start");
    assert_eq!(order.last().map(String::as_str), Some("tts:stop"));

    // Every sentence is framed by start/end with its audio in between
    let starts = order.iter().filter(|l| *l == "tts:sentence_start").count();
    let ends = order.iter().filter(|l| *l == "tts:sentence_end").count();
    assert!(starts >= 1);
    assert_eq!(starts, ends);
    for window in order.windows(2) {
        if window[0] == "tts:sentence_start" {
            assert_eq!(window[1], "audio");
        }
    }
    settle().await;
    assert!(!session.is_speaking());

    // The model saw the injected text as the latest user message
    let prompts = llm.prompts.lock();
    let last = prompts[0].last_user_message().unwrap_or_default();
    assert_eq!(last, "where is my parcel");
    drop(prompts);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_spoken_turn_is_answered() {
    let llm = ScriptedLlm::new(&["Hi! How can I help?"]);
    let (session, mut rx) = open(app_state(llm), None).await;
    collect_until(&mut rx, "hello").await;

    // 1.2 s of speech, then silence past the endpoint window
    for _ in 0..20 {
        session.receive_audio(tone_packet(8000)).await.unwrap();
    }
    for _ in 0..25 {
        session.receive_audio(tone_packet(0)).await.unwrap();
    }

    let sent = collect_until(&mut rx, "tts:stop").await;
    assert_eq!(
        sent[0],
        Sent::Json(serde_json::json!({"type": "stt", "text": "hello there"}))
    );
    assert!(labels(&sent).contains(&"tts:sentence_end".to_string()));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_user_speech_interrupts_reply() {
    let long_reply = [
        "The first thing to know is that parcels ship daily.",
        "Most orders leave the warehouse within a day.",
        "Tracking numbers arrive by email once shipped.",
        "Delivery usually takes three to five days.",
        "Remote areas can take a little longer.",
        "You can change the address before shipping.",
        "Returns are free within thirty days.",
        "Is there anything else I can check for you?",
    ]
    .join(" ");
    let llm = ScriptedLlm::new(&["Hello.", long_reply.as_str()]);
    let (session, mut rx) = open(app_state(llm), None).await;
    collect_until(&mut rx, "hello").await;

    // Interruption is only allowed once the first reply has played
    session.handle_message(detect("hi"));
    collect_until(&mut rx, "tts:stop").await;

    session.handle_message(detect("tell me about shipping"));
    collect_until(&mut rx, "tts:start").await;
    settle().await;
    assert!(session.is_speaking());

    for _ in 0..20 {
        session.receive_audio(tone_packet(8000)).await.unwrap();
    }

    let sent = collect_until(&mut rx, "tts:stop").await;
    let starts = sent
        .iter()
        .filter(|s| s.label() == "tts:sentence_start")
        .count();
    assert!(starts < long_reply.matches('.').count(), "reply was not cut: {} sentences", starts);
    settle().await;
    assert!(!session.is_speaking());

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_client_abort_stops_playback() {
    let llm = ScriptedLlm::new(&[
        "This is a long answer. It has several sentences. Each one takes a while to play. \
         There is more after this one. And one more here.",
    ]);
    let (session, mut rx) = open(app_state(llm), None).await;
    collect_until(&mut rx, "hello").await;

    session.handle_message(detect("explain"));
    collect_until(&mut rx, "tts:sentence_start").await;
    session.handle_message(ClientMessage::Abort {
        reason: Some("wake_word_detected".to_string()),
    });

    let sent = collect_until(&mut rx, "tts:stop").await;
    assert!(count(&sent, "tts:sentence_start") < 4);

    // Markers queued behind the abort are dropped: no segment is announced and then ended
    // without audio, and nothing follows the stop
    let order = labels(&sent);
    assert!(
        !order.windows(2).any(|w| w[0] == "tts:sentence_start" && w[1] == "tts:sentence_end"),
        "segment markers sent after abort: {:?}",
        order
    );
    settle().await;
    assert!(!session.is_speaking());
    assert!(rx.try_recv().is_none());

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_utterance_during_reply_waits_when_interruption_disabled() {
    let long_reply = [
        "Our store opens at nine every weekday morning.",
        "On Saturdays the doors open an hour later.",
        "Sundays we are closed for inventory.",
        "Holiday hours are posted a week ahead.",
        "Is there anything else I can check for you?",
    ]
    .join(" ");
    let mut settings = Settings::default();
    settings.pipeline.interruption.enabled = false;
    let llm = ScriptedLlm::new(&["Hello.", long_reply.as_str(), "Sure."]);
    let (session, mut rx) = open(app_state_with(llm, settings), None).await;
    collect_until(&mut rx, "hello").await;

    session.handle_message(detect("hi"));
    collect_until(&mut rx, "tts:stop").await;

    session.handle_message(detect("when are you open"));
    collect_until(&mut rx, "tts:start").await;

    // A short utterance that completes its turn while the reply is still playing
    for _ in 0..6 {
        session.receive_audio(tone_packet(8000)).await.unwrap();
    }
    for _ in 0..15 {
        session.receive_audio(tone_packet(0)).await.unwrap();
    }

    let sent = collect_until(&mut rx, "tts:stop").await;
    let order = labels(&sent);
    assert!(!order.contains(&"stt".to_string()), "turn ran before the reply ended: {:?}", order);
    assert_eq!(count(&sent, "tts:sentence_start"), count(&sent, "tts:sentence_end"));
    let last_end = sent
        .iter()
        .filter_map(|s| match s {
            Sent::Json(value) if value["state"] == "sentence_end" => value["text"].as_str(),
            _ => None,
        })
        .last()
        .unwrap_or_default();
    assert!(last_end.ends_with("check for you?"), "reply cut at {:?}", last_end);

    // The committed turn is answered once the reply has played out
    let next = collect_until(&mut rx, "tts:stop").await;
    assert_eq!(
        next[0],
        Sent::Json(serde_json::json!({"type": "stt", "text": "hello there"}))
    );

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_spoken_turn_over_opus() {
    let format = AudioFormat {
        encoding: AudioEncoding::Opus,
        sample_rate: 16000,
        channels: 1,
        frame_duration: 60,
    };
    let llm = ScriptedLlm::new(&["Hi! How can I help?"]);
    let (session, mut rx) = open_with(app_state(llm), None, "websocket", format).await;
    collect_until(&mut rx, "hello").await;

    let encoder = OpusEncoder::new(16000, 1, 60).unwrap();
    for packet in 0..20 {
        let opus = encoder.encode(&sine_samples(packet * 960, 8000.0)).unwrap();
        session.receive_audio(opus).await.unwrap();
    }
    for _ in 0..25 {
        let opus = encoder.encode(&[0i16; 960]).unwrap();
        session.receive_audio(opus).await.unwrap();
    }

    let sent = collect_until(&mut rx, "tts:stop").await;
    assert_eq!(
        sent[0],
        Sent::Json(serde_json::json!({"type": "stt", "text": "hello there"}))
    );
    assert!(count(&sent, "tts:sentence_end") >= 1);

    // Replies go out as Opus packets, well under the 1920 bytes of raw PCM
    let audio: Vec<usize> = sent
        .iter()
        .filter_map(|s| match s {
            Sent::Audio(len) => Some(*len),
            _ => None,
        })
        .collect();
    assert!(!audio.is_empty());
    assert!(audio.iter().all(|&len| len > 0 && len < 1920));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_gateway_gap_is_flushed_to_recognition() {
    let format = pcm_format();
    let llm = ScriptedLlm::new(&["Got it."]);
    let (session, mut rx) = open_with(app_state(llm), None, "gateway-unordered", format).await;
    collect_until(&mut rx, "hello").await;
    assert!(session.agent_ready().await);

    let mut inbound = InboundAudio::new(WireFraming::Gateway, 64, 60);
    let mut delivered = 0;
    for seq in 0..45u32 {
        // Packet 5 is lost in transit
        if seq == 5 {
            continue;
        }
        let level = if seq < 20 { 8000 } else { 0 };
        let packet = GatewayHeader::frame(PacketKind::Audio, seq, seq * 60, &tone_packet(level)).unwrap();
        for payload in inbound.payloads(packet).unwrap() {
            session.receive_audio(payload).await.unwrap();
            delivered += 1;
        }
    }

    // Everything after the gap is held, so the utterance never ends
    assert_eq!(delivered, 5);
    assert_eq!(inbound.idle_flush_after(), Some(Duration::from_millis(60)));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_none());

    for payload in inbound.flush() {
        session.receive_audio(payload).await.unwrap();
    }
    let sent = collect_until(&mut rx, "tts:stop").await;
    assert_eq!(
        sent[0],
        Sent::Json(serde_json::json!({"type": "stt", "text": "hello there"}))
    );

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_agent_is_signaled_then_closed() {
    // No agent service configured, so any explicit agent id fails
    let (session, mut rx) = open(app_state(ScriptedLlm::new(&[])), Some("ghost")).await;

    let sent = collect_until(&mut rx, "tts:stop").await;
    let order = labels(&sent);
    assert_eq!(order, vec!["hello", "tts:start", "tts:sentence_start", "tts:stop"]);
    let Sent::Json(reason) = &sent[2] else {
        panic!("sentence_start must be JSON");
    };
    assert_eq!(
        reason["text"],
        Settings::default().session.unavailable_message.as_str()
    );

    assert!(!session.agent_ready().await);
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();

    session.close().await;
    assert_eq!(collect_until(&mut rx, "closed").await, vec![Sent::Closed]);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let (session, mut rx) = open(app_state(ScriptedLlm::new(&[])), None).await;
    collect_until(&mut rx, "hello").await;
    assert!(session.agent_ready().await);

    session.close().await;
    session.close().await;
    tokio::time::timeout(Duration::from_secs(1), session.closed())
        .await
        .unwrap();

    assert_eq!(collect_until(&mut rx, "closed").await, vec![Sent::Closed]);
    assert!(rx.try_recv().is_none());
    assert!(session.push_audio(AudioFrame::new(vec![0; 960], 16000, 1).unwrap()).is_err());
}
