//! Voice Activity Detection
//!
//! Windowed speech/silence state machine over a pluggable [`VadModel`].
//! The processor is synchronous and deterministic; [`VadStream`] runs it as a task
//! between two channels.

mod energy;
mod processor;

pub use energy::EnergyVadModel;
pub use processor::{VadEvent, VadEventKind, VadOptions, VadProcessor};

use std::sync::Arc;

use tokio::task::JoinHandle;
use voice_session_core::{channel, AudioFrame, Receiver, Sender, VadModel};

use crate::PipelineError;

/// Creates a fresh model per stream (models carry per-stream state)
pub type VadModelFactory = Arc<dyn Fn() -> Box<dyn VadModel> + Send + Sync>;

/// A running VAD stream
pub struct VadStream {
    /// Audio input; closing it flushes and ends the stream
    pub input: Sender<AudioFrame>,
    /// Events in input-window order
    pub events: Receiver<VadEvent>,
    task: JoinHandle<()>,
}

impl VadStream {
    /// Build a processor around `model` and spawn it
    pub fn open(model: Box<dyn VadModel>, options: VadOptions) -> Result<Self, PipelineError> {
        Ok(Self::spawn(VadProcessor::new(model, options)?))
    }

    /// Spawn the processor onto its own task
    pub fn spawn(mut processor: VadProcessor) -> Self {
        let (input, mut frames) = channel::<AudioFrame>();
        let (events_tx, events) = channel::<VadEvent>();

        let task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                for event in processor.push_frame(&frame) {
                    if events_tx.send(event).is_err() {
                        tracing::debug!("VAD event receiver closed, stopping stream");
                        return;
                    }
                }
            }

            for event in processor.flush() {
                let _ = events_tx.send(event);
            }
            events_tx.close();
        });

        Self { input, events, task }
    }

    /// Split into input, events and the driving task
    pub fn into_parts(self) -> (Sender<AudioFrame>, Receiver<VadEvent>, JoinHandle<()>) {
        (self.input, self.events, self.task)
    }

    /// Stop the stream without flushing
    pub fn abort(&self) {
        self.input.close();
        self.task.abort();
    }
}
