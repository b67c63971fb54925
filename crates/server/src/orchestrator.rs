//! Session orchestrator
//!
//! One [`VoiceSession`] per connection. It owns the recognition coordinator, the per-agent
//! synthesis pipeline and the paced output, and serializes user turns: each turn task waits
//! for the previous one before it talks to the language model.
//!
//! Per-agent setup (profile lookup, pipeline construction, STT stream) runs in the
//! background after the hello exchange. Everything that processes a turn waits on the
//! agent-ready gate first; inbound audio is buffered until recognition is running.
//!
//! Session flags have a single writer, the event task. Recognition hooks, playback, turn
//! tasks and client commands report to it through [`SessionEvent`]s. Playback is only cut by
//! the interruption gate or an explicit client request; a turn that ends while the agent is
//! still talking waits for the reply in front of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use voice_session_config::{ListenMode, PipelineSettings};
use voice_session_core::{
    channel, retry_with_backoff, AudioFormat, AudioFrame, ChatDelta, ChatStream, DialogueContext,
    DialogueItem, Error, Receiver, RetryPolicy, Role, Sender, SpeechData,
};
use voice_session_llm::{AssembledReply, PromptBuilder, ReplyAssembler};
use voice_session_pipeline::{
    open_recognition, AbortFlag, CommittedTurn, InterruptionDetector, InterruptionInput,
    RecognitionCoordinator, RecognitionHandle, RecognitionHooks, StreamAdapter, SynthesisEvent,
    SynthesisPipeline, TurnCompletion, VadEvent, VadStream,
};
use voice_session_transport::{AudioCodec, OutputController, PacketSink, WireFraming};

use crate::agent_config::AgentProfile;
use crate::history::{ChatReport, HistoryReporter};
use crate::metrics;
use crate::options::{
    endpoint_options, interruption_options, pacer_options, retry_policy, synthesis_options,
    vad_options,
};
use crate::protocol::{ClientMessage, ListenState, ServerMessage};
use crate::reply_cache::ReplyCache;
use crate::state::AppState;
use crate::ServerError;

/// How long a closing session waits for the running turn to wind down
const TURN_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Rendered greetings are refreshed after this long
const GREETING_CACHE_TTL: Duration = Duration::from_secs(600);

const TOOL_UNAVAILABLE: &str = r#"{"error":"tool not available"}"#;

/// What the client negotiated in its hello
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub transport: String,
    pub audio: AudioFormat,
    pub agent_id: Option<String>,
    pub device_id: Option<String>,
}

/// Agent-ready gate value: unset until initialization finishes
type AgentSlot = Option<Result<Arc<AgentProfile>, String>>;

enum TurnInput {
    Spoken(CommittedTurn),
    /// Wake word or typed text from `listen detect`
    Injected(String),
    Greeting(String),
}

/// Everything that changes session flags, handled in order by the event task
enum SessionEvent {
    SpeechStarted,
    SpeechActive { speech_duration: Duration },
    SpeechEnded,
    Interim { live_words: usize },
    Final { words: usize },
    EndOfTurn(CommittedTurn),
    RecognitionError(String),
    /// `tts start` is about to go out
    PlaybackStarted,
    PlaybackEnded,
    Processing(bool),
    Listen {
        state: ListenState,
        mode: Option<ListenMode>,
        text: Option<String>,
    },
    ClientAbort { reason: Option<String> },
}

/// Written only by the event task
#[derive(Debug)]
struct Flags {
    speaking: bool,
    processing: bool,
    listen_mode: ListenMode,
    first_reply_done: bool,
    speech_duration: Duration,
    committed_words: usize,
    live_words: usize,
}

/// Everything built from the agent profile
struct Runtime {
    profile: Arc<AgentProfile>,
    settings: PipelineSettings,
    system_prompt: String,
    language: String,
    voice: String,
    greeting: Option<String>,
    retry: RetryPolicy,
    synthesis: SynthesisPipeline,
    interruption: InterruptionDetector,
    stt_streaming: bool,
}

struct Shared {
    id: String,
    app: AppState,
    audio: AudioFormat,
    codec: AudioCodec,
    output: tokio::sync::Mutex<OutputController<Box<dyn PacketSink>>>,
    abort: AbortFlag,
    generation: AtomicU64,
    flags: Mutex<Flags>,
    events: Sender<SessionEvent>,
    agent: watch::Sender<AgentSlot>,
    runtime: OnceLock<Arc<Runtime>>,
    recognition: Mutex<Option<RecognitionHandle>>,
    context: Arc<Mutex<DialogueContext>>,
    history: tokio::sync::Mutex<HistoryReporter>,
    audio_in: Sender<AudioFrame>,
    last_turn: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: watch::Sender<bool>,
    closed: AtomicBool,
}

/// Handle to one connection's dialogue session
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    /// Answer the client hello and start per-agent initialization in the background
    pub async fn start(
        app: AppState,
        params: SessionParams,
        sink: Box<dyn PacketSink>,
    ) -> Result<Self, ServerError> {
        let codec = AudioCodec::new(params.audio)?;
        let framing = WireFraming::from_transport(&params.transport);
        let output = OutputController::new(
            sink,
            framing,
            &pacer_options(&app.config.pipeline, params.audio.frame_duration),
        );

        let history = match &app.history {
            Some(sink) => {
                let retry = RetryPolicy {
                    max_attempts: app.config.history.max_attempts.max(1),
                    ..retry_policy(&app.config.providers.retry)
                };
                HistoryReporter::spawn(sink.clone(), retry)
            }
            None => HistoryReporter::disabled(),
        };

        let context = DialogueContext::new().with_max_items(app.config.session.max_context_items);
        let (audio_in, audio_rx) = channel::<AudioFrame>();
        let (events_tx, events_rx) = channel::<SessionEvent>();
        let listen_mode = app.config.session.listen_mode;

        let shared = Arc::new(Shared {
            id: params.session_id.clone(),
            app,
            audio: params.audio,
            codec,
            output: tokio::sync::Mutex::new(output),
            abort: AbortFlag::new(),
            generation: AtomicU64::new(0),
            flags: Mutex::new(Flags {
                speaking: false,
                processing: false,
                listen_mode,
                first_reply_done: false,
                speech_duration: Duration::ZERO,
                committed_words: 0,
                live_words: 0,
            }),
            events: events_tx.clone(),
            agent: watch::channel(None).0,
            runtime: OnceLock::new(),
            recognition: Mutex::new(None),
            context: Arc::new(Mutex::new(context)),
            history: tokio::sync::Mutex::new(history),
            audio_in,
            last_turn: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closing: watch::channel(false).0,
            closed: AtomicBool::new(false),
        });

        shared
            .send_message(ServerMessage::Hello {
                session_id: params.session_id.clone(),
                transport: params.transport.clone(),
                audio_params: params.audio,
            })
            .await;

        tracing::info!(
            session_id = %params.session_id,
            transport = %params.transport,
            agent_id = params.agent_id.as_deref().unwrap_or("default"),
            device_id = params.device_id.as_deref().unwrap_or(""),
            format = ?params.audio.encoding,
            sample_rate = params.audio.sample_rate,
            framing = ?framing,
            "Session started"
        );

        let hooks = Arc::new(SessionHooks {
            events: events_tx,
            context: shared.context.clone(),
        });
        let events = tokio::spawn(shared.clone().run_events(events_rx));
        let init = tokio::spawn(shared.clone().initialize(params.agent_id, audio_rx, hooks));
        shared.tasks.lock().extend([events, init]);

        Ok(Self { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Queue one decoded client frame for recognition
    pub fn push_audio(&self, frame: AudioFrame) -> Result<(), ServerError> {
        self.shared
            .audio_in
            .send(frame)
            .map_err(|_| ServerError::Session(format!("session {} is closed", self.shared.id)))
    }

    /// Decode one client audio payload (framing already removed) and queue it
    pub async fn receive_audio(&self, payload: Vec<u8>) -> Result<(), ServerError> {
        let frame = self.shared.codec.decode(payload).await?;
        self.push_audio(frame)
    }

    pub fn handle_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::Hello { .. } => {
                tracing::debug!(session_id = %self.shared.id, "Ignoring repeated hello");
            }
            ClientMessage::Listen { state, mode, text } => {
                self.shared.post(SessionEvent::Listen { state, mode, text })
            }
            ClientMessage::Abort { reason } => self.shared.post(SessionEvent::ClientAbort { reason }),
        }
    }

    /// Wait for the agent-ready gate; `false` if the agent failed or the wait timed out
    pub async fn agent_ready(&self) -> bool {
        self.shared.wait_ready().await.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.flags.lock().speaking
    }

    /// Resolves when the session asks its connection to close
    pub async fn closed(&self) {
        let mut rx = self.shared.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Shut the session down. Safe to call more than once.
    ///
    /// Order: recognition (with any pending turn completion), the running reply, background
    /// tasks, chat-history drain, then the network connection.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown().await;
    }
}

impl Shared {
    async fn initialize(
        self: Arc<Self>,
        agent_id: Option<String>,
        audio: Receiver<AudioFrame>,
        hooks: Arc<SessionHooks>,
    ) {
        let profile = match agent_id.as_deref().filter(|id| !id.is_empty()) {
            None => Ok(Arc::new(AgentProfile::default_for(&self.app.config.session))),
            Some(id) => self.app.agents.fetch(id).await,
        };
        let profile = match profile {
            Ok(profile) => profile,
            Err(e) => {
                self.fail(e.to_string()).await;
                return;
            }
        };

        let runtime = Arc::new(self.build_runtime(profile));
        let greeting = runtime.greeting.clone();
        if self.runtime.set(runtime.clone()).is_err() {
            tracing::warn!(session_id = %self.id, "Session initialized twice");
            return;
        }
        self.agent.send_replace(Some(Ok(runtime.profile.clone())));
        tracing::info!(
            session_id = %self.id,
            agent_id = %runtime.profile.id,
            language = %runtime.language,
            voice = %runtime.voice,
            "Agent ready"
        );

        if let Some(greeting) = greeting.filter(|g| !g.trim().is_empty()) {
            self.start_turn(TurnInput::Greeting(greeting));
        }

        let recognition = match self.start_recognition(&runtime, hooks).await {
            Ok(recognition) => recognition,
            Err(e) => {
                tracing::error!(session_id = %self.id, "Failed to start recognition: {}", e);
                self.closing.send_replace(true);
                return;
            }
        };
        if self.closed.load(Ordering::SeqCst) {
            let mut recognition = recognition;
            recognition.close().await;
            return;
        }
        *self.recognition.lock() = Some(recognition);

        let pump = tokio::spawn(self.clone().pump_audio(audio));
        self.tasks.lock().push(pump);
    }

    fn build_runtime(&self, profile: Arc<AgentProfile>) -> Runtime {
        let config = &self.app.config;
        let overrides = profile.session_overrides();
        let settings = config.pipeline.with_overrides(&overrides);
        let retry = retry_policy(&config.providers.retry);

        let voice = overrides
            .voice
            .clone()
            .unwrap_or_else(|| config.providers.tts.voice.clone());
        let tts = self.app.providers.tts_for(Some(&voice));
        let synthesis = SynthesisPipeline::new(
            tts,
            synthesis_options(&settings, retry.clone()),
            self.abort.clone(),
        );

        Runtime {
            system_prompt: overrides
                .system_prompt
                .clone()
                .unwrap_or_else(|| config.session.system_prompt.clone()),
            language: overrides
                .language
                .clone()
                .unwrap_or_else(|| config.session.language.clone()),
            greeting: overrides.greeting.clone(),
            interruption: InterruptionDetector::new(interruption_options(&settings)),
            stt_streaming: self.app.providers.stt.capabilities().streaming,
            profile,
            settings,
            voice,
            retry,
            synthesis,
        }
    }

    async fn start_recognition(
        &self,
        runtime: &Runtime,
        hooks: Arc<SessionHooks>,
    ) -> Result<RecognitionHandle, ServerError> {
        let providers = &self.app.providers;
        let vad = vad_options(&runtime.settings.vad);

        let adapter = StreamAdapter::new(providers.stt.clone(), providers.vad.clone(), vad.clone())
            .with_retry(runtime.retry.clone());
        let stt = open_recognition(&adapter, Some(&runtime.language)).await?;
        let vad = VadStream::open((providers.vad)(), vad)?;

        let mut completion = TurnCompletion::new(endpoint_options(&runtime.settings));
        if runtime.settings.endpointing.classifier_enabled {
            if let Some(classifier) = &providers.classifier {
                completion = completion.with_classifier(classifier.clone());
            }
        }
        if let Some(lookup) = &providers.lookup {
            completion = completion.with_lookup(lookup.clone());
        }

        let auto_endpoint = self.flags.lock().listen_mode != ListenMode::Manual;
        Ok(RecognitionCoordinator::new(completion, hooks)
            .with_auto_endpoint(auto_endpoint)
            .spawn(vad, stt))
    }

    /// Agent configuration failed: tell the client why, then ask the connection to close
    async fn fail(&self, reason: String) {
        tracing::warn!(session_id = %self.id, "Agent unavailable: {}", reason);

        let message = self.app.config.session.unavailable_message.clone();
        self.send_message(ServerMessage::tts_start(self.audio.sample_rate)).await;
        self.send_message(ServerMessage::sentence_start(message)).await;
        self.send_message(ServerMessage::tts_stop()).await;

        self.agent.send_replace(Some(Err(reason)));
        self.closing.send_replace(true);
    }

    async fn wait_ready(&self) -> Option<Arc<Runtime>> {
        let timeout = Duration::from_millis(self.app.config.session.agent_ready_timeout_ms);
        let mut rx = self.agent.subscribe();
        let settled = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await,
            Ok(Ok(_))
        );
        if !settled {
            return None;
        }
        self.runtime.get().cloned()
    }

    async fn pump_audio(self: Arc<Self>, mut audio: Receiver<AudioFrame>) {
        while let Some(frame) = audio.recv().await {
            let pushed = match self.recognition.lock().as_ref() {
                Some(recognition) => recognition.push_audio(frame).is_ok(),
                None => false,
            };
            if !pushed {
                break;
            }
        }
    }

    fn post(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(session_id = %self.id, "Session event dropped after close");
        }
    }

    async fn run_events(self: Arc<Self>, mut events: Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::SpeechStarted => {
                    self.flags.lock().speech_duration = Duration::ZERO;
                    tracing::debug!(session_id = %self.id, "User started speaking");
                }
                SessionEvent::SpeechActive { speech_duration } => {
                    self.flags.lock().speech_duration = speech_duration;
                    self.check_interruption();
                }
                SessionEvent::SpeechEnded => {
                    self.flags.lock().speech_duration = Duration::ZERO;
                }
                SessionEvent::Interim { live_words } => {
                    self.flags.lock().live_words = live_words;
                    self.check_interruption();
                }
                SessionEvent::Final { words } => {
                    {
                        let mut flags = self.flags.lock();
                        flags.committed_words += words;
                        flags.live_words = flags.committed_words;
                    }
                    self.check_interruption();
                }
                SessionEvent::EndOfTurn(turn) => {
                    {
                        let mut flags = self.flags.lock();
                        flags.committed_words = 0;
                        flags.live_words = 0;
                    }
                    metrics::record_turn(turn.delay.as_secs_f64());
                    tracing::info!(
                        session_id = %self.id,
                        generation = turn.generation,
                        delay_ms = turn.delay.as_millis() as u64,
                        verdict = ?turn.verdict,
                        "End of user turn"
                    );
                    self.start_turn(TurnInput::Spoken(turn));
                }
                SessionEvent::RecognitionError(e) => {
                    tracing::warn!(session_id = %self.id, "Recognition stream failed: {}", e);
                }
                SessionEvent::PlaybackStarted => self.flags.lock().speaking = true,
                SessionEvent::PlaybackEnded => {
                    let mut flags = self.flags.lock();
                    flags.speaking = false;
                    flags.first_reply_done = true;
                }
                SessionEvent::Processing(processing) => self.flags.lock().processing = processing,
                SessionEvent::Listen { state, mode, text } => self.listen(state, mode, text),
                SessionEvent::ClientAbort { reason } => {
                    tracing::info!(
                        session_id = %self.id,
                        reason = reason.as_deref().unwrap_or(""),
                        "Client aborted reply"
                    );
                    if self.is_busy() {
                        self.abort_reply();
                    }
                }
            }
        }
    }

    fn check_interruption(&self) {
        let Some(runtime) = self.runtime.get() else {
            return;
        };
        if self.abort.is_raised() {
            return;
        }

        let input = {
            let flags = self.flags.lock();
            InterruptionInput {
                agent_speaking: flags.speaking,
                manual_listen: flags.listen_mode == ListenMode::Manual,
                agent_ready: true,
                first_reply_done: flags.first_reply_done,
                speech_duration: flags.speech_duration,
                stt_streaming: runtime.stt_streaming,
                transcript_words: flags.live_words,
            }
        };

        let decision = runtime.interruption.evaluate(&input);
        if decision.should_interrupt() {
            tracing::info!(
                session_id = %self.id,
                speech_ms = input.speech_duration.as_millis() as u64,
                words = input.transcript_words,
                "User interrupted the agent"
            );
            metrics::record_interruption();
            self.abort_reply();
        }
    }

    fn listen(self: &Arc<Self>, state: ListenState, mode: Option<ListenMode>, text: Option<String>) {
        if let Some(mode) = mode {
            self.flags.lock().listen_mode = mode;
            if let Some(recognition) = self.recognition.lock().as_ref() {
                recognition.set_auto_endpoint(mode != ListenMode::Manual);
            }
        }
        let manual = self.flags.lock().listen_mode == ListenMode::Manual;

        match state {
            // Manual mode bypasses the interruption gate, so pressing talk is the barge-in
            ListenState::Start if manual => {
                if self.is_busy() {
                    self.abort_reply();
                }
                if let Some(recognition) = self.recognition.lock().as_ref() {
                    recognition.clear_transcript();
                }
            }
            ListenState::Stop if manual => {
                if let Some(recognition) = self.recognition.lock().as_ref() {
                    recognition.commit_now();
                }
            }
            ListenState::Start | ListenState::Stop => {}
            ListenState::Detect => match text.filter(|t| !t.trim().is_empty()) {
                Some(text) => {
                    tracing::info!(session_id = %self.id, text = %text, "Wake word detected");
                    self.start_turn(TurnInput::Injected(text));
                }
                None => tracing::debug!(session_id = %self.id, "Detect without text ignored"),
            },
        }
    }

    fn is_busy(&self) -> bool {
        let flags = self.flags.lock();
        flags.speaking || flags.processing
    }

    /// Supersede the running reply and cut its playback
    fn abort_reply(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.abort.raise();
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Queue a turn behind the previous one
    ///
    /// Never cuts the reply in front of it; that is up to the interruption gate.
    fn start_turn(self: &Arc<Self>, input: TurnInput) {
        let mut last_turn = self.last_turn.lock();
        let previous = last_turn.take();
        let shared = Arc::clone(self);
        *last_turn = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            shared.run_turn(input).await;
        }));
    }

    async fn run_turn(self: Arc<Self>, input: TurnInput) {
        let started_at = Instant::now();
        let Some(runtime) = self.wait_ready().await else {
            tracing::warn!(session_id = %self.id, "Agent not ready, dropping turn");
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, "Session closing, dropping queued turn");
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);

        match input {
            TurnInput::Greeting(text) => self.speak_greeting(&runtime, text, started_at).await,
            TurnInput::Spoken(turn) => {
                self.respond(&runtime, &turn.transcript, turn.lookup.as_deref(), generation, started_at)
                    .await
            }
            TurnInput::Injected(text) => {
                self.respond(&runtime, &text, None, generation, started_at).await
            }
        }
    }

    async fn respond(
        &self,
        runtime: &Runtime,
        text: &str,
        lookup: Option<&str>,
        generation: u64,
        started_at: Instant,
    ) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.post(SessionEvent::Processing(true));
        self.send_message(ServerMessage::Stt {
            text: text.to_string(),
        })
        .await;

        let prompt = {
            let mut context = self.context.lock();
            let mut builder =
                PromptBuilder::new().system_prompt(&runtime.system_prompt, Some(&runtime.language));
            if let Some(lookup) = lookup {
                builder = builder.with_context(lookup);
            }
            let prompt = builder.with_history(&context).user_message(text).build();
            context.add_user(text);
            prompt
        };
        self.report(runtime, Role::User, text).await;

        self.generate_reply(runtime, prompt, generation, started_at).await;
        self.post(SessionEvent::Processing(false));
    }

    /// Stream the model reply into the synthesis pipeline and play it
    async fn generate_reply(
        &self,
        runtime: &Runtime,
        prompt: DialogueContext,
        generation: u64,
        started_at: Instant,
    ) {
        let mut reply = runtime.synthesis.start();
        if self.superseded(generation) {
            self.abort.raise();
        }

        let llm = self.app.providers.llm.clone();
        let mut stream = match retry_with_backoff(&runtime.retry, "llm.chat", || llm.chat(&prompt)).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(session_id = %self.id, provider = llm.name(), "LLM request failed: {}", e);
                reply.finish();
                None
            }
        };

        let mut assembler = ReplyAssembler::new();
        let mut assembled: Option<AssembledReply> = None;
        let mut emotion_sent = false;
        let mut playback = Playback::new(self, started_at);

        loop {
            tokio::select! {
                event = reply.events.recv() => match event {
                    Some(event) => {
                        if playback.handle(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                delta = next_delta(&mut stream) => match delta {
                    Some(Ok(delta)) => {
                        if let Some(text) = assembler.push(&delta) {
                            if !emotion_sent {
                                emotion_sent = true;
                                if let Some(emotion) = assembler.emotion() {
                                    self.send_message(ServerMessage::Llm {
                                        emotion: Some(emotion.to_string()),
                                        text: emotion.to_string(),
                                    })
                                    .await;
                                }
                            }
                            reply.push_text(text);
                        }
                    }
                    ending => {
                        if let Some(Err(e)) = ending {
                            tracing::warn!(session_id = %self.id, "LLM stream failed: {}", e);
                        }
                        stream = None;
                        let spoken = assembler.text().len();
                        let done = std::mem::take(&mut assembler).finish();
                        if let Some(rest) = done.text.get(spoken..).filter(|r| !r.trim().is_empty()) {
                            reply.push_text(rest.to_string());
                        }
                        reply.finish();
                        assembled = Some(done);
                    }
                },
            }
        }

        let (text, tool_calls) = match assembled {
            Some(done) => (done.text, done.tool_calls),
            None => (assembler.text().to_string(), Vec::new()),
        };
        if playback.aborted {
            tracing::info!(session_id = %self.id, "Reply interrupted");
        }

        {
            let mut context = self.context.lock();
            for call in tool_calls {
                tracing::warn!(session_id = %self.id, tool = %call.name, "Tool calls are not supported");
                let call_id = call.call_id.clone();
                context.push(call.into_item());
                context.push(DialogueItem::FunctionCallOutput {
                    call_id,
                    output: TOOL_UNAVAILABLE.to_string(),
                });
            }
            if !text.trim().is_empty() {
                context.add_assistant(text.trim());
            }
        }
        if !text.trim().is_empty() {
            self.report(runtime, Role::Assistant, text.trim()).await;
        }
    }

    /// Greeting from the shared reply cache, or synthesized live when another session is
    /// rendering it
    async fn speak_greeting(&self, runtime: &Runtime, text: String, started_at: Instant) {
        self.abort.reset();

        let key = ReplyCache::key(&runtime.voice, &text);
        let tts = runtime.synthesis.engine().clone();
        let render_text = text.clone();
        let cached = self
            .app
            .reply_cache
            .get_or_refresh(&key, GREETING_CACHE_TTL, move || async move {
                let mut stream = tts.synthesize(&render_text).await?;
                let mut frames = Vec::new();
                while let Some(frame) = stream.next().await {
                    frames.push(frame?);
                }
                Ok::<_, Error>(frames)
            })
            .await;

        let mut playback = Playback::new(self, started_at);
        match cached {
            Some(frames) => {
                playback.begin().await;
                self.send_message(ServerMessage::sentence_start(text.clone())).await;
                for frame in frames.iter() {
                    if self.abort.is_raised() {
                        break;
                    }
                    playback.record_first_audio();
                    self.send_frame(frame.clone()).await;
                }
                if !self.abort.is_raised() {
                    self.flush_audio().await;
                    self.send_message(ServerMessage::sentence_end(text.clone())).await;
                }
                playback.aborted = self.abort.is_raised();
                playback.end().await;
            }
            None => {
                let mut reply = runtime.synthesis.start();
                reply.push_text(text.clone());
                reply.finish();
                while let Some(event) = reply.events.recv().await {
                    if playback.handle(event).await {
                        break;
                    }
                }
            }
        }

        self.context.lock().add_assistant(text.clone());
        self.report(runtime, Role::Assistant, &text).await;
    }

    async fn report(&self, runtime: &Runtime, role: Role, content: &str) {
        let report = ChatReport::new(self.id.clone(), runtime.profile.id.clone(), role, content);
        self.history.lock().await.report(report);
    }

    async fn send_message(&self, message: ServerMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Failed to encode message: {}", e);
                return;
            }
        };
        if let Err(e) = self.output.lock().await.send_json(json).await {
            tracing::debug!(session_id = %self.id, "Dropping control message: {}", e);
        }
    }

    /// Encode and send one engine frame, stopping as soon as the reply is aborted
    async fn send_frame(&self, frame: AudioFrame) {
        let packets = match self.codec.encode(frame).await {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Failed to encode audio: {}", e);
                return;
            }
        };
        for packet in packets {
            if self.abort.is_raised() {
                return;
            }
            if let Err(e) = self.output.lock().await.send_audio(&packet).await {
                tracing::debug!(session_id = %self.id, "Dropping audio packet: {}", e);
                return;
            }
        }
    }

    async fn flush_audio(&self) {
        let packets = match self.codec.flush().await {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Failed to flush audio: {}", e);
                return;
            }
        };
        let mut output = self.output.lock().await;
        for packet in packets {
            if let Err(e) = output.send_audio(&packet).await {
                tracing::debug!(session_id = %self.id, "Dropping audio packet: {}", e);
                return;
            }
        }
    }

    async fn shutdown(&self) {
        let recognition = self.recognition.lock().take();
        if let Some(mut recognition) = recognition {
            recognition.close().await;
        }

        self.abort_reply();
        let last_turn = self.last_turn.lock().take();
        if let Some(mut turn) = last_turn {
            if tokio::time::timeout(TURN_DRAIN_TIMEOUT, &mut turn).await.is_err() {
                turn.abort();
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.audio_in.close();
        if let Some(runtime) = self.runtime.get() {
            runtime.synthesis.engine().close();
        }

        let drain = Duration::from_millis(self.app.config.history.drain_timeout_ms);
        self.history.lock().await.close(drain).await;

        if let Err(e) = self.output.lock().await.close().await {
            tracing::debug!(session_id = %self.id, "Connection already closed: {}", e);
        }
        self.closing.send_replace(true);
        tracing::info!(session_id = %self.id, "Session closed");
    }
}

async fn next_delta(stream: &mut Option<ChatStream>) -> Option<Result<ChatDelta, Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Client-facing side of one reply: markers, encoded audio and the speaking flag
struct Playback<'a> {
    session: &'a Shared,
    started_at: Instant,
    segments: HashMap<usize, String>,
    speaking: bool,
    first_audio: bool,
    aborted: bool,
}

impl<'a> Playback<'a> {
    fn new(session: &'a Shared, started_at: Instant) -> Self {
        Self {
            session,
            started_at,
            segments: HashMap::new(),
            speaking: false,
            first_audio: false,
            aborted: false,
        }
    }

    /// `tts start` goes out with the first segment, so empty replies stay silent
    async fn begin(&mut self) {
        if self.speaking {
            return;
        }
        self.speaking = true;
        self.session.post(SessionEvent::PlaybackStarted);
        self.session.output.lock().await.begin_reply();
        self.session
            .send_message(ServerMessage::tts_start(self.session.audio.sample_rate))
            .await;
    }

    fn record_first_audio(&mut self) {
        if !self.first_audio {
            self.first_audio = true;
            metrics::record_first_audio_latency(self.started_at.elapsed().as_secs_f64());
        }
    }

    /// Returns `true` once the reply has ended
    async fn handle(&mut self, event: SynthesisEvent) -> bool {
        match event {
            SynthesisEvent::ReplyStart => {}
            SynthesisEvent::SegmentStart { index, text } => {
                // Segments queued before an abort are not announced
                if self.session.abort.is_raised() {
                    return false;
                }
                self.begin().await;
                self.session
                    .send_message(ServerMessage::sentence_start(text.clone()))
                    .await;
                self.segments.insert(index, text);
            }
            SynthesisEvent::Audio { frame, .. } => {
                self.record_first_audio();
                self.session.send_frame(frame).await;
            }
            SynthesisEvent::SegmentEnd { index } => {
                metrics::record_segment(true);
                let text = self.segments.remove(&index).unwrap_or_default();
                // After an abort, `tts stop` is the last marker the client sees
                if !self.session.abort.is_raised() {
                    self.session.flush_audio().await;
                    self.session.send_message(ServerMessage::sentence_end(text)).await;
                }
            }
            SynthesisEvent::SegmentSkipped { index } => {
                metrics::record_segment(false);
                tracing::debug!(session_id = %self.session.id, index, "Segment skipped");
            }
            SynthesisEvent::ReplyEnd { aborted } => {
                self.aborted = aborted;
                self.end().await;
                return true;
            }
        }
        false
    }

    async fn end(&mut self) {
        if self.aborted {
            self.session.codec.clear();
        } else {
            self.session.flush_audio().await;
        }
        self.session.post(SessionEvent::PlaybackEnded);
        if self.speaking {
            self.session.send_message(ServerMessage::tts_stop()).await;
        }
    }
}

/// Recognition hooks; they only enqueue, the session's event task does the work
struct SessionHooks {
    events: Sender<SessionEvent>,
    context: Arc<Mutex<DialogueContext>>,
}

impl RecognitionHooks for SessionHooks {
    fn on_start_of_speech(&self, _event: &VadEvent) {
        let _ = self.events.send(SessionEvent::SpeechStarted);
    }

    fn on_vad_inference(&self, event: &VadEvent) {
        if event.speaking {
            let _ = self.events.send(SessionEvent::SpeechActive {
                speech_duration: event.speech_duration,
            });
        }
    }

    fn on_end_of_speech(&self, _event: &VadEvent) {
        let _ = self.events.send(SessionEvent::SpeechEnded);
    }

    fn on_interim_transcript(&self, _data: &SpeechData, live_transcript: &str) {
        let _ = self.events.send(SessionEvent::Interim {
            live_words: live_transcript.split_whitespace().count(),
        });
    }

    fn on_final_transcript(&self, data: &SpeechData) {
        let _ = self.events.send(SessionEvent::Final {
            words: data.word_count(),
        });
    }

    fn on_end_of_turn(&self, turn: CommittedTurn) {
        let _ = self.events.send(SessionEvent::EndOfTurn(turn));
    }

    fn on_recognition_error(&self, error: &Error) {
        let _ = self.events.send(SessionEvent::RecognitionError(error.to_string()));
    }

    fn chat_context(&self) -> DialogueContext {
        self.context.lock().clone()
    }
}
