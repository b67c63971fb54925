//! VAD state machine

use std::time::Duration;

use voice_session_core::{AudioFrame, LinearResampler, VadModel};

use crate::PipelineError;

/// VAD event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEventKind {
    /// Speech confirmed after `min_speech_duration`
    StartOfSpeech,
    /// One inference window processed
    InferenceDone,
    /// Silence confirmed after `min_silence_duration`
    EndOfSpeech,
}

/// Event emitted for each window and on speech boundaries
#[derive(Debug, Clone)]
pub struct VadEvent {
    pub kind: VadEventKind,
    /// Samples processed so far at the model rate
    pub sample_index: u64,
    /// Stream position of the end of the window
    pub timestamp: Duration,
    /// Speech since the current utterance started (zero while silent)
    pub speech_duration: Duration,
    /// Silence since the last utterance ended (zero while speaking)
    pub silence_duration: Duration,
    /// Smoothed speech probability
    pub probability: f32,
    /// Unsmoothed model output
    pub raw_probability: f32,
    /// Whether the stream is inside an utterance after this window
    pub speaking: bool,
    /// Buffered audio: pre-roll + speech for start, the whole utterance for end
    pub frames: Vec<AudioFrame>,
}

/// VAD tuning
#[derive(Debug, Clone)]
pub struct VadOptions {
    /// Smoothed probability at or above which a window is speech
    pub activation_threshold: f32,
    /// Weight of the newest window in the exponential filter (1.0 disables smoothing)
    pub smoothing_factor: f32,
    pub min_speech_duration: Duration,
    pub min_silence_duration: Duration,
    pub prefix_padding_duration: Duration,
    pub max_buffered_speech: Duration,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            activation_threshold: 0.5,
            smoothing_factor: 0.35,
            min_speech_duration: Duration::from_millis(100),
            min_silence_duration: Duration::from_millis(550),
            prefix_padding_duration: Duration::from_millis(500),
            max_buffered_speech: Duration::from_secs(60),
        }
    }
}

/// Synchronous SILENCE/SPEAKING state machine
pub struct VadProcessor {
    model: Box<dyn VadModel>,
    options: VadOptions,
    model_rate: u32,
    window_size: usize,
    window_duration: Duration,

    /// Mono samples at the model rate waiting for a full window
    pending: Vec<f32>,
    /// Rebuilt when the input rate changes
    resampler: Option<LinearResampler>,

    /// Bounded speech buffer (max_buffered_speech + padding)
    speech_buffer: Vec<i16>,
    write_cursor: usize,
    padding_samples: usize,
    overflowed: bool,

    smoothed: Option<f32>,
    speaking: bool,
    speech_threshold_duration: Duration,
    silence_threshold_duration: Duration,
    speech_duration: Duration,
    silence_duration: Duration,
    samples_processed: u64,
}

impl VadProcessor {
    /// Create a processor around a model
    pub fn new(model: Box<dyn VadModel>, options: VadOptions) -> Result<Self, PipelineError> {
        let model_rate = model.sample_rate();
        let window_size = model.window_size();
        if model_rate == 0 || window_size == 0 {
            return Err(PipelineError::Vad(format!(
                "invalid model geometry: {} Hz, {} samples per window",
                model_rate, window_size
            )));
        }

        let window_duration =
            Duration::from_nanos(window_size as u64 * 1_000_000_000 / model_rate as u64);
        let padding_samples = samples_for(options.prefix_padding_duration, model_rate);
        let capacity = samples_for(options.max_buffered_speech, model_rate) + padding_samples;

        Ok(Self {
            model,
            options,
            model_rate,
            window_size,
            window_duration,
            pending: Vec::with_capacity(window_size * 2),
            resampler: None,
            speech_buffer: vec![0; capacity],
            write_cursor: 0,
            padding_samples,
            overflowed: false,
            smoothed: None,
            speaking: false,
            speech_threshold_duration: Duration::ZERO,
            silence_threshold_duration: Duration::ZERO,
            speech_duration: Duration::ZERO,
            silence_duration: Duration::ZERO,
            samples_processed: 0,
        })
    }

    /// Feed one frame; returns events for every window it completed
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Vec<VadEvent> {
        let mono = frame.to_mono_f32();
        if frame.sample_rate() == self.model_rate {
            self.resampler = None;
            self.pending.extend_from_slice(&mono);
        } else {
            if self.resampler.as_ref().map(LinearResampler::from_rate) != Some(frame.sample_rate()) {
                self.resampler = Some(LinearResampler::new(frame.sample_rate(), self.model_rate));
            }
            if let Some(resampler) = self.resampler.as_mut() {
                let samples = resampler.process(&mono);
                self.pending.extend_from_slice(&samples);
            }
        }

        let mut events = Vec::new();
        while self.pending.len() >= self.window_size {
            let window: Vec<f32> = self.pending.drain(..self.window_size).collect();
            self.process_window(&window, &mut events);
        }
        events
    }

    /// End of input: close an open utterance
    pub fn flush(&mut self) -> Vec<VadEvent> {
        self.pending.clear();
        self.resampler = None;
        if !self.speaking {
            return Vec::new();
        }

        self.speaking = false;
        self.speech_duration = Duration::ZERO;
        self.silence_duration = self.silence_threshold_duration;
        let event = self.event(VadEventKind::EndOfSpeech, self.smoothed.unwrap_or(0.0), 0.0, true);
        self.reset_write_cursor();
        vec![event]
    }

    /// Clear all state, including the model's
    pub fn reset(&mut self) {
        self.model.reset();
        self.pending.clear();
        self.resampler = None;
        self.write_cursor = 0;
        self.overflowed = false;
        self.smoothed = None;
        self.speaking = false;
        self.speech_threshold_duration = Duration::ZERO;
        self.silence_threshold_duration = Duration::ZERO;
        self.speech_duration = Duration::ZERO;
        self.silence_duration = Duration::ZERO;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Inference window duration
    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    fn process_window(&mut self, window: &[f32], events: &mut Vec<VadEvent>) {
        let raw = match self.model.infer(window) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                tracing::warn!("VAD inference failed, treating window as silence: {}", e);
                0.0
            }
        };

        let alpha = self.options.smoothing_factor;
        let probability = match self.smoothed {
            Some(prev) => alpha * raw + (1.0 - alpha) * prev,
            None => raw,
        };
        self.smoothed = Some(probability);
        self.samples_processed += window.len() as u64;

        self.write_to_buffer(window);

        if self.speaking {
            self.speech_duration += self.window_duration;
        } else {
            self.silence_duration += self.window_duration;
        }

        events.push(self.event(VadEventKind::InferenceDone, probability, raw, false));

        if probability >= self.options.activation_threshold {
            self.speech_threshold_duration += self.window_duration;
            self.silence_threshold_duration = Duration::ZERO;

            if !self.speaking && self.speech_threshold_duration >= self.options.min_speech_duration {
                self.speaking = true;
                self.silence_duration = Duration::ZERO;
                self.speech_duration = self.speech_threshold_duration;
                events.push(self.event(VadEventKind::StartOfSpeech, probability, raw, true));
            }
        } else {
            self.silence_threshold_duration += self.window_duration;
            self.speech_threshold_duration = Duration::ZERO;

            if !self.speaking {
                self.reset_write_cursor();
            } else if self.silence_threshold_duration >= self.options.min_silence_duration {
                self.speaking = false;
                self.speech_duration = Duration::ZERO;
                self.silence_duration = self.silence_threshold_duration;
                events.push(self.event(VadEventKind::EndOfSpeech, probability, raw, true));
                self.reset_write_cursor();
            }
        }
    }

    fn write_to_buffer(&mut self, window: &[f32]) {
        let available = self.speech_buffer.len() - self.write_cursor;
        let to_copy = window.len().min(available);

        for (dst, &src) in self.speech_buffer[self.write_cursor..self.write_cursor + to_copy]
            .iter_mut()
            .zip(window)
        {
            *dst = (src * 32767.0).clamp(-32768.0, 32767.0) as i16;
        }
        self.write_cursor += to_copy;

        if to_copy < window.len() && !self.overflowed {
            tracing::warn!(
                max_buffered_ms = self.options.max_buffered_speech.as_millis() as u64,
                "Speech buffer full, dropping audio for the rest of this utterance"
            );
            self.overflowed = true;
        }
    }

    /// Keep only the trailing padding window as pre-roll
    fn reset_write_cursor(&mut self) {
        if self.write_cursor > self.padding_samples {
            let start = self.write_cursor - self.padding_samples;
            self.speech_buffer.copy_within(start..self.write_cursor, 0);
            self.write_cursor = self.padding_samples;
        }
        self.overflowed = false;
    }

    fn event(&self, kind: VadEventKind, probability: f32, raw: f32, with_audio: bool) -> VadEvent {
        let frames = if with_audio && self.write_cursor > 0 {
            AudioFrame::new(
                self.speech_buffer[..self.write_cursor].to_vec(),
                self.model_rate,
                1,
            )
            .into_iter()
            .collect()
        } else {
            Vec::new()
        };

        VadEvent {
            kind,
            sample_index: self.samples_processed,
            timestamp: Duration::from_secs_f64(self.samples_processed as f64 / self.model_rate as f64),
            speech_duration: self.speech_duration,
            silence_duration: self.silence_duration,
            probability,
            raw_probability: raw,
            speaking: self.speaking,
            frames,
        }
    }
}

fn samples_for(duration: Duration, rate: u32) -> usize {
    (duration.as_secs_f64() * rate as f64).round() as usize
}
