//! Audio-recognition coordinator
//!
//! Fuses the VAD and STT streams of one connection. Audio is fanned out to both
//! streams; a single task owns the running transcript and the speaking flag and
//! drives the [`TurnCompletion`] engine.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use voice_session_core::{
    channel, AudioFrame, ChannelClosed, DialogueContext, Error, Receiver, Sender, SpeechData,
    SpeechEvent, SpeechEventKind, SttStream,
};

use crate::endpointing::{CommittedTurn, EvaluationRequest, TurnCompletion};
use crate::vad::{VadEvent, VadEventKind, VadStream};

/// Session callbacks driven by the coordinator task
///
/// Hooks run on the coordinator task and must not block.
pub trait RecognitionHooks: Send + Sync {
    fn on_start_of_speech(&self, _event: &VadEvent) {}

    /// Every inference window; `event.speech_duration` is the speech since onset
    fn on_vad_inference(&self, _event: &VadEvent) {}

    fn on_end_of_speech(&self, _event: &VadEvent) {}

    /// Unstable hypothesis; `live_transcript` is the committed text plus this hypothesis
    fn on_interim_transcript(&self, _data: &SpeechData, _live_transcript: &str) {}

    fn on_final_transcript(&self, _data: &SpeechData) {}

    /// The user finished their turn
    fn on_end_of_turn(&self, turn: CommittedTurn);

    /// Terminal STT stream error
    fn on_recognition_error(&self, _error: &Error) {}

    /// Context handed to the turn classifier
    fn chat_context(&self) -> DialogueContext {
        DialogueContext::new()
    }
}

enum Control {
    CommitNow,
    ClearTranscript,
    SetAutoEndpoint(bool),
    Close,
}

/// Builds and spawns the coordinator task
pub struct RecognitionCoordinator {
    completion: TurnCompletion,
    hooks: Arc<dyn RecognitionHooks>,
    auto_endpoint: bool,
}

impl RecognitionCoordinator {
    pub fn new(completion: TurnCompletion, hooks: Arc<dyn RecognitionHooks>) -> Self {
        Self {
            completion,
            hooks,
            auto_endpoint: true,
        }
    }

    /// Disable VAD-driven endpointing (manual listen mode)
    pub fn with_auto_endpoint(mut self, enabled: bool) -> Self {
        self.auto_endpoint = enabled;
        self
    }

    pub fn spawn(self, vad: VadStream, stt: SttStream) -> RecognitionHandle {
        let (vad_input, vad_events, vad_task) = vad.into_parts();
        let SttStream {
            input: stt_input,
            events: stt_events,
        } = stt;
        let (control_tx, control_rx) = channel::<Control>();
        let (commit_tx, commit_rx) = channel::<CommittedTurn>();
        let transcript = Arc::new(Mutex::new(String::new()));

        let state = CoordinatorState {
            hooks: self.hooks,
            completion: self.completion,
            commit_tx,
            transcript: transcript.clone(),
            speaking: false,
            last_speech_at: Instant::now(),
            auto_endpoint: self.auto_endpoint,
            commit_on_final: false,
        };

        let task = tokio::spawn(run(state, vad_events, stt_events, control_rx, commit_rx));

        RecognitionHandle {
            vad_input,
            stt_input,
            control: control_tx,
            transcript,
            task: Some(task),
            vad_task,
        }
    }
}

/// Handle to a running coordinator
pub struct RecognitionHandle {
    vad_input: Sender<AudioFrame>,
    stt_input: Sender<AudioFrame>,
    control: Sender<Control>,
    transcript: Arc<Mutex<String>>,
    task: Option<JoinHandle<()>>,
    vad_task: JoinHandle<()>,
}

impl RecognitionHandle {
    /// Fan one frame out to VAD and STT
    pub fn push_audio(&self, frame: AudioFrame) -> Result<(), ChannelClosed> {
        self.vad_input.send(frame.clone())?;
        self.stt_input.send(frame)
    }

    /// Commit the current transcript now (manual listen stop)
    pub fn commit_now(&self) {
        let _ = self.control.send(Control::CommitNow);
    }

    /// Drop the running transcript and any pending completion
    pub fn clear_transcript(&self) {
        let _ = self.control.send(Control::ClearTranscript);
    }

    pub fn set_auto_endpoint(&self, enabled: bool) {
        let _ = self.control.send(Control::SetAutoEndpoint(enabled));
    }

    /// Snapshot of the uncommitted transcript
    pub fn transcript(&self) -> String {
        self.transcript.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop recognition and any pending turn completion. Idempotent.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.vad_input.close();
        self.stt_input.close();
        let _ = self.control.send(Control::Close);
        self.control.close();

        if let Err(e) = task.await {
            if !e.is_cancelled() {
                tracing::warn!("Recognition task ended abnormally: {}", e);
            }
        }
        self.vad_task.abort();
    }
}

impl Drop for RecognitionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.vad_task.abort();
    }
}

struct CoordinatorState {
    hooks: Arc<dyn RecognitionHooks>,
    completion: TurnCompletion,
    commit_tx: Sender<CommittedTurn>,
    transcript: Arc<Mutex<String>>,
    speaking: bool,
    last_speech_at: Instant,
    auto_endpoint: bool,
    /// Manual commit requested before any text arrived
    commit_on_final: bool,
}

async fn run(
    mut state: CoordinatorState,
    mut vad_events: Receiver<VadEvent>,
    mut stt_events: Receiver<Result<SpeechEvent, Error>>,
    mut control: Receiver<Control>,
    mut commits: Receiver<CommittedTurn>,
) {
    let mut vad_open = true;
    let mut stt_open = true;

    loop {
        tokio::select! {
            biased;

            msg = control.recv() => match msg {
                Some(Control::Close) | None => break,
                Some(Control::CommitNow) => state.commit_now(),
                Some(Control::ClearTranscript) => state.clear(),
                Some(Control::SetAutoEndpoint(enabled)) => state.auto_endpoint = enabled,
            },

            event = vad_events.recv(), if vad_open => match event {
                Some(event) => state.on_vad_event(event),
                None => {
                    tracing::debug!("VAD stream ended");
                    vad_open = false;
                }
            },

            event = stt_events.recv(), if stt_open => match event {
                Some(Ok(event)) => state.on_speech_event(event),
                Some(Err(e)) => {
                    tracing::error!("STT stream error: {}", e);
                    state.hooks.on_recognition_error(&e);
                }
                None => {
                    tracing::debug!("STT stream ended");
                    stt_open = false;
                }
            },

            Some(turn) = commits.recv() => state.on_commit(turn),
        }
    }

    state.completion.cancel();
}

impl CoordinatorState {
    fn on_vad_event(&mut self, event: VadEvent) {
        match event.kind {
            VadEventKind::StartOfSpeech => {
                tracing::debug!(
                    speech_ms = event.speech_duration.as_millis() as u64,
                    "Start of speech"
                );
                self.speaking = true;
                self.completion.cancel();
                self.hooks.on_start_of_speech(&event);
            }
            VadEventKind::InferenceDone => {
                self.hooks.on_vad_inference(&event);
            }
            VadEventKind::EndOfSpeech => {
                tracing::debug!(
                    silence_ms = event.silence_duration.as_millis() as u64,
                    "End of speech"
                );
                self.speaking = false;
                let now = Instant::now();
                self.last_speech_at = now.checked_sub(event.silence_duration).unwrap_or(now);
                self.hooks.on_end_of_speech(&event);
                self.request_evaluation();
            }
        }
    }

    fn on_speech_event(&mut self, event: SpeechEvent) {
        let Some(data) = event.data else {
            tracing::trace!(kind = ?event.kind, "STT event without data");
            return;
        };

        match event.kind {
            SpeechEventKind::StartOfSpeech => {}
            SpeechEventKind::InterimTranscript => {
                let live = {
                    let transcript = self.transcript.lock();
                    join_text(&transcript, &data.text)
                };
                self.hooks.on_interim_transcript(&data, &live);
            }
            SpeechEventKind::FinalTranscript => {
                if data.is_empty() {
                    return;
                }
                {
                    let mut transcript = self.transcript.lock();
                    *transcript = join_text(&transcript, &data.text);
                }
                if self.speaking {
                    self.last_speech_at = Instant::now();
                }
                self.hooks.on_final_transcript(&data);

                if self.commit_on_final {
                    self.commit_now();
                } else if !self.speaking {
                    self.request_evaluation();
                }
            }
        }
    }

    fn request_evaluation(&mut self) {
        if !self.auto_endpoint {
            return;
        }
        let transcript = self.transcript.lock().clone();
        if transcript.trim().is_empty() {
            return;
        }

        self.completion.evaluate(
            EvaluationRequest {
                transcript,
                last_speech_at: self.last_speech_at,
                context: self.hooks.chat_context(),
            },
            &self.commit_tx,
        );
    }

    fn commit_now(&mut self) {
        self.completion.cancel();
        let transcript = std::mem::take(&mut *self.transcript.lock());
        if transcript.trim().is_empty() {
            self.commit_on_final = true;
            return;
        }
        self.commit_on_final = false;

        self.hooks.on_end_of_turn(CommittedTurn {
            generation: self.completion.generation(),
            transcript,
            verdict: voice_session_core::TurnVerdict::Finished,
            lookup: None,
            delay: std::time::Duration::ZERO,
            last_speech_at: self.last_speech_at,
        });
    }

    fn clear(&mut self) {
        self.completion.cancel();
        self.commit_on_final = false;
        self.transcript.lock().clear();
    }

    fn on_commit(&mut self, turn: CommittedTurn) {
        if !self.completion.accept(&turn) {
            tracing::debug!(generation = turn.generation, "Dropping stale turn commit");
            return;
        }

        {
            let mut transcript = self.transcript.lock();
            match transcript.strip_prefix(turn.transcript.as_str()) {
                Some(rest) => *transcript = rest.trim_start().to_string(),
                None => transcript.clear(),
            }
        }

        tracing::info!(
            chars = turn.transcript.len(),
            delay_ms = turn.delay.as_millis() as u64,
            "End of turn"
        );
        self.hooks.on_end_of_turn(turn);
    }
}

fn join_text(existing: &str, addition: &str) -> String {
    let addition = addition.trim();
    if existing.is_empty() {
        addition.to_string()
    } else if addition.is_empty() {
        existing.to_string()
    } else {
        format!("{} {}", existing, addition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpointing::EndpointOptions;
    use crate::vad::{VadOptions, VadProcessor};
    use std::time::Duration;
    use voice_session_core::VadModel;

    struct LoudnessModel;

    impl VadModel for LoudnessModel {
        fn sample_rate(&self) -> u32 {
            16000
        }
        fn window_size(&self) -> usize {
            512
        }
        fn infer(&mut self, window: &[f32]) -> Result<f32, Error> {
            Ok(if window[0].abs() > 0.1 { 1.0 } else { 0.0 })
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        log: Mutex<Vec<String>>,
        turns: Mutex<Option<Sender<CommittedTurn>>>,
    }

    impl RecognitionHooks for RecordingHooks {
        fn on_start_of_speech(&self, _event: &VadEvent) {
            self.log.lock().push("start".into());
        }

        fn on_end_of_speech(&self, _event: &VadEvent) {
            self.log.lock().push("end".into());
        }

        fn on_final_transcript(&self, data: &SpeechData) {
            self.log.lock().push(format!("final:{}", data.text));
        }

        fn on_end_of_turn(&self, turn: CommittedTurn) {
            self.log.lock().push(format!("turn:{}", turn.transcript));
            if let Some(tx) = self.turns.lock().as_ref() {
                let _ = tx.send(turn);
            }
        }
    }

    struct Harness {
        handle: RecognitionHandle,
        hooks: Arc<RecordingHooks>,
        stt_events: Sender<Result<SpeechEvent, Error>>,
        stt_audio: Receiver<AudioFrame>,
        turns: Receiver<CommittedTurn>,
    }

    fn harness(auto_endpoint: bool) -> Harness {
        let options = VadOptions {
            smoothing_factor: 1.0,
            min_speech_duration: Duration::from_millis(64),
            min_silence_duration: Duration::from_millis(96),
            prefix_padding_duration: Duration::from_millis(32),
            ..VadOptions::default()
        };
        let vad = VadStream::spawn(VadProcessor::new(Box::new(LoudnessModel), options).unwrap());

        let (stt_input, stt_audio) = channel();
        let (stt_events, stt_rx) = channel();
        let stt = SttStream {
            input: stt_input,
            events: stt_rx,
        };

        let (turn_tx, turns) = channel();
        let hooks = Arc::new(RecordingHooks::default());
        *hooks.turns.lock() = Some(turn_tx);

        let completion = TurnCompletion::new(EndpointOptions::default());
        let handle = RecognitionCoordinator::new(completion, hooks.clone())
            .with_auto_endpoint(auto_endpoint)
            .spawn(vad, stt);

        Harness {
            handle,
            hooks,
            stt_events,
            stt_audio,
            turns,
        }
    }

    fn frame(level: i16) -> AudioFrame {
        AudioFrame::new(vec![level; 512], 16000, 1).unwrap()
    }

    async fn speak(handle: &RecognitionHandle, loud: usize, quiet: usize) {
        for _ in 0..loud {
            handle.push_audio(frame(10000)).unwrap();
        }
        for _ in 0..quiet {
            handle.push_audio(frame(0)).unwrap();
        }
        // Let the VAD and coordinator tasks drain
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn final_text(text: &str) -> Result<SpeechEvent, Error> {
        Ok(SpeechEvent::final_transcript(SpeechData::new(text, 0.9)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_after_silence_commits_turn() {
        let mut h = harness(true);
        speak(&h.handle, 4, 4).await;
        h.stt_events.send(final_text("what time is it")).unwrap();

        let turn = h.turns.recv().await.unwrap();
        assert_eq!(turn.transcript, "what time is it");
        assert_eq!(h.handle.transcript(), "");
        assert_eq!(
            *h.hooks.log.lock(),
            vec!["start", "end", "final:what time is it", "turn:what time is it"]
        );

        // Audio was fanned out to STT too
        assert_eq!(h.stt_audio.drain().len(), 8);
        h.handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_speech_cancels_pending_turn() {
        let mut h = harness(true);
        speak(&h.handle, 4, 4).await;
        h.stt_events.send(final_text("I want")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Speech resumes before the endpoint delay ends
        speak(&h.handle, 4, 0).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.turns.try_recv().is_none());

        speak(&h.handle, 0, 4).await;
        h.stt_events.send(final_text("a coffee")).unwrap();
        let turn = h.turns.recv().await.unwrap();
        assert_eq!(turn.transcript, "I want a coffee");
        h.handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_commit() {
        let mut h = harness(false);
        speak(&h.handle, 4, 4).await;
        h.stt_events.send(final_text("hello")).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.turns.try_recv().is_none());
        assert_eq!(h.handle.transcript(), "hello");

        h.handle.commit_now();
        let turn = h.turns.recv().await.unwrap();
        assert_eq!(turn.transcript, "hello");
        h.handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_commit_waits_for_late_final() {
        let mut h = harness(false);
        h.handle.commit_now();
        tokio::task::yield_now().await;
        h.stt_events.send(final_text("late words")).unwrap();

        let turn = h.turns.recv().await.unwrap();
        assert_eq!(turn.transcript, "late words");
        h.handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_cancels() {
        let mut h = harness(true);
        speak(&h.handle, 4, 4).await;
        h.stt_events.send(final_text("bye")).unwrap();
        tokio::task::yield_now().await;

        h.handle.close().await;
        h.handle.close().await;
        assert!(h.handle.is_closed());
        assert!(h.handle.push_audio(frame(0)).is_err());

        let result = tokio::time::timeout(Duration::from_secs(2), h.turns.recv()).await;
        assert!(!matches!(result, Ok(Some(_))));
    }
}
