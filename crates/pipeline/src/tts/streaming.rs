//! Streaming synthesis with prefetch and ordered delivery
//!
//! Text for one reply is segmented as it arrives. Each segment gets the next index
//! and is synthesized by a bounded set of concurrent jobs; a dispatcher releases the
//! segments strictly in index order. The first segment streams audio as it is
//! produced, later segments are delivered once fully synthesized.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use voice_session_core::{
    channel, retry_with_backoff, AudioFrame, Receiver, RetryPolicy, Sender, TextToSpeech,
};

use super::segmenter::{SegmenterOptions, TextSegmenter};
use crate::interruption::AbortFlag;

/// Text stream markers for one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextInput {
    /// Reply begins; discards any stale buffered text
    First,
    Text(String),
    /// Reply text is complete
    Last,
}

/// Ordered output of the synthesis pipeline
#[derive(Debug, Clone)]
pub enum SynthesisEvent {
    ReplyStart,
    SegmentStart { index: usize, text: String },
    Audio { index: usize, frame: AudioFrame },
    SegmentEnd { index: usize },
    /// Synthesis failed before any audio; the segment is left out
    SegmentSkipped { index: usize },
    /// Emitted exactly once per reply
    ReplyEnd { aborted: bool },
}

/// Synthesis pipeline configuration
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub segmenter: SegmenterOptions,
    /// Segments synthesized concurrently
    pub prefetch_depth: usize,
    pub retry: RetryPolicy,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            segmenter: SegmenterOptions::default(),
            prefetch_depth: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Audio produced by one synthesis job
enum JobChunk {
    Audio(AudioFrame),
    Failed(String),
}

/// A submitted segment, handed to the dispatcher in index order
struct SegmentJob {
    index: usize,
    text: String,
    audio: Receiver<JobChunk>,
}

/// Per-session synthesis pipeline
pub struct SynthesisPipeline {
    tts: Arc<dyn TextToSpeech>,
    options: SynthesisOptions,
    abort: AbortFlag,
}

impl SynthesisPipeline {
    pub fn new(tts: Arc<dyn TextToSpeech>, options: SynthesisOptions, abort: AbortFlag) -> Self {
        Self { tts, options, abort }
    }

    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    pub fn engine(&self) -> &Arc<dyn TextToSpeech> {
        &self.tts
    }

    /// Start a reply; clears the abort flag left by a previous reply
    pub fn start(&self) -> ReplyHandle {
        self.abort.reset();

        let (input, text_rx) = channel::<TextInput>();
        let (jobs_tx, jobs_rx) = channel::<SegmentJob>();
        let (events_tx, events) = channel::<SynthesisEvent>();

        let submitter = tokio::spawn(submit(
            self.tts.clone(),
            self.options.clone(),
            self.abort.clone(),
            text_rx,
            jobs_tx,
        ));
        let dispatcher = tokio::spawn(dispatch(self.abort.clone(), jobs_rx, events_tx));

        ReplyHandle {
            input,
            events,
            submitter,
            dispatcher,
        }
    }
}

/// Handle to one in-flight reply
pub struct ReplyHandle {
    /// Reply text; closing it acts as [`TextInput::Last`]
    pub input: Sender<TextInput>,
    /// Ordered synthesis events, ending after `ReplyEnd`
    pub events: Receiver<SynthesisEvent>,
    submitter: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ReplyHandle {
    /// Send a chunk of reply text
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.input.send(TextInput::Text(text.into())).is_ok()
    }

    /// Mark the reply text complete
    pub fn finish(&self) {
        let _ = self.input.send(TextInput::Last);
        self.input.close();
    }

    /// Stop both tasks without emitting further events
    pub fn cancel(&self) {
        self.input.close();
        self.submitter.abort();
        self.dispatcher.abort();
    }
}

async fn submit(
    tts: Arc<dyn TextToSpeech>,
    options: SynthesisOptions,
    abort: AbortFlag,
    mut text_rx: Receiver<TextInput>,
    jobs: Sender<SegmentJob>,
) {
    let permits = Arc::new(Semaphore::new(options.prefetch_depth.max(1)));
    let mut segmenter = TextSegmenter::new(options.segmenter.clone());
    let mut next_index = 0usize;

    'input: loop {
        let input = tokio::select! {
            biased;
            _ = abort.raised() => break 'input,
            input = text_rx.recv() => input,
        };

        let (segments, done) = match input {
            Some(TextInput::First) => {
                segmenter.reset();
                continue;
            }
            Some(TextInput::Text(text)) => (segmenter.push(&text), false),
            Some(TextInput::Last) | None => (segmenter.flush().into_iter().collect(), true),
        };

        for text in segments {
            let permit = tokio::select! {
                biased;
                _ = abort.raised() => break 'input,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'input,
                },
            };

            let (audio_tx, audio_rx) = channel::<JobChunk>();
            let index = next_index;
            next_index += 1;

            tracing::debug!(index, chars = text.chars().count(), "Submitting segment");
            let job_text = text.clone();
            let job_tts = tts.clone();
            let retry = options.retry.clone();
            let job_abort = abort.clone();
            tokio::spawn(async move {
                let _permit = permit;
                synthesize_segment(job_tts, &retry, &job_abort, &job_text, audio_tx).await;
            });

            if jobs
                .send(SegmentJob {
                    index,
                    text,
                    audio: audio_rx,
                })
                .is_err()
            {
                break 'input;
            }
        }

        if done {
            break;
        }
    }

    jobs.close();
}

async fn synthesize_segment(
    tts: Arc<dyn TextToSpeech>,
    retry: &RetryPolicy,
    abort: &AbortFlag,
    text: &str,
    out: Sender<JobChunk>,
) {
    let stream = retry_with_backoff(retry, "tts.synthesize", || tts.synthesize(text)).await;
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = out.send(JobChunk::Failed(e.to_string()));
            return;
        }
    };

    while let Some(chunk) = stream.next().await {
        if abort.is_raised() {
            return;
        }
        let sent = match chunk {
            Ok(frame) => out.send(JobChunk::Audio(frame)),
            Err(e) => {
                let _ = out.send(JobChunk::Failed(e.to_string()));
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
}

async fn dispatch(abort: AbortFlag, mut jobs: Receiver<SegmentJob>, events: Sender<SynthesisEvent>) {
    let _ = events.send(SynthesisEvent::ReplyStart);

    let mut first = true;
    let aborted = loop {
        let job = tokio::select! {
            biased;
            _ = abort.raised() => break true,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break false,
            },
        };

        let streaming = first;
        first = false;
        let delivered = if streaming {
            stream_segment(&abort, job, &events).await
        } else {
            buffer_segment(&abort, job, &events).await
        };

        if delivered.is_none() {
            break true;
        }
    };

    if aborted {
        jobs.close();
        let discarded = jobs.drain().len();
        tracing::debug!(discarded, "Synthesis aborted");
    }

    let _ = events.send(SynthesisEvent::ReplyEnd { aborted });
    events.close();
}

/// Forward audio as it arrives. `None` means the reply was aborted.
async fn stream_segment(abort: &AbortFlag, mut job: SegmentJob, events: &Sender<SynthesisEvent>) -> Option<()> {
    let mut started = false;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.raised() => return None,
            chunk = job.audio.recv() => chunk,
        };

        match chunk {
            Some(JobChunk::Audio(frame)) => {
                if !started {
                    let _ = events.send(SynthesisEvent::SegmentStart {
                        index: job.index,
                        text: job.text.clone(),
                    });
                    started = true;
                }
                let _ = events.send(SynthesisEvent::Audio {
                    index: job.index,
                    frame,
                });
            }
            Some(JobChunk::Failed(e)) => {
                tracing::warn!(index = job.index, "Segment synthesis failed: {}", e);
                if !started {
                    let _ = events.send(SynthesisEvent::SegmentSkipped { index: job.index });
                }
                break;
            }
            None => break,
        }
    }

    if started {
        let _ = events.send(SynthesisEvent::SegmentEnd { index: job.index });
    }
    Some(())
}

/// Wait for the whole segment, then release it. `None` means the reply was aborted.
async fn buffer_segment(abort: &AbortFlag, mut job: SegmentJob, events: &Sender<SynthesisEvent>) -> Option<()> {
    let mut frames = Vec::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.raised() => return None,
            chunk = job.audio.recv() => chunk,
        };

        match chunk {
            Some(JobChunk::Audio(frame)) => frames.push(frame),
            Some(JobChunk::Failed(e)) => {
                tracing::warn!(index = job.index, "Segment synthesis failed, skipping: {}", e);
                let _ = events.send(SynthesisEvent::SegmentSkipped { index: job.index });
                return Some(());
            }
            None => break,
        }
    }

    if frames.is_empty() {
        tracing::debug!(index = job.index, "Segment produced no audio");
        return Some(());
    }

    let _ = events.send(SynthesisEvent::SegmentStart {
        index: job.index,
        text: job.text,
    });
    for frame in frames {
        let _ = events.send(SynthesisEvent::Audio {
            index: job.index,
            frame,
        });
    }
    let _ = events.send(SynthesisEvent::SegmentEnd { index: job.index });
    Some(())
}
