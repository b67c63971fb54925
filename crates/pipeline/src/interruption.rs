//! Interruption (barge-in) detection
//!
//! A pure gate over the session's current state. The session feeds it on every
//! VAD inference and interim transcript while the agent is speaking; when it
//! fires, the session raises the shared [`AbortFlag`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Interruption tuning
#[derive(Debug, Clone)]
pub struct InterruptionOptions {
    pub enabled: bool,
    /// Renewed speech needed before playback is cut
    pub min_speech_duration: Duration,
    /// Live transcript words needed (streaming STT only)
    pub min_words: usize,
}

impl Default for InterruptionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_speech_duration: Duration::from_millis(500),
            min_words: 2,
        }
    }
}

/// Snapshot of session state for one evaluation
#[derive(Debug, Clone, Default)]
pub struct InterruptionInput {
    pub agent_speaking: bool,
    pub manual_listen: bool,
    pub agent_ready: bool,
    pub first_reply_done: bool,
    /// Speech since the renewed onset
    pub speech_duration: Duration,
    /// Whether the STT engine streams (text check applies only then)
    pub stt_streaming: bool,
    /// Words in the live transcript
    pub transcript_words: usize,
}

/// Which condition kept the interruption from firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Disabled,
    AgentNotSpeaking,
    ManualListen,
    AgentNotReady,
    FirstReplyPending,
    SpeechTooShort,
    TextTooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionDecision {
    Interrupt,
    Blocked(BlockReason),
}

impl InterruptionDecision {
    pub fn should_interrupt(&self) -> bool {
        matches!(self, InterruptionDecision::Interrupt)
    }
}

/// Interruption gate
#[derive(Debug, Clone, Default)]
pub struct InterruptionDetector {
    options: InterruptionOptions,
}

impl InterruptionDetector {
    pub fn new(options: InterruptionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &InterruptionOptions {
        &self.options
    }

    /// Interrupt only when every condition holds
    pub fn evaluate(&self, input: &InterruptionInput) -> InterruptionDecision {
        use BlockReason::*;

        let blocked = if !self.options.enabled {
            Some(Disabled)
        } else if !input.agent_speaking {
            Some(AgentNotSpeaking)
        } else if input.manual_listen {
            Some(ManualListen)
        } else if !input.agent_ready {
            Some(AgentNotReady)
        } else if !input.first_reply_done {
            Some(FirstReplyPending)
        } else if input.speech_duration < self.options.min_speech_duration {
            Some(SpeechTooShort)
        } else if input.stt_streaming && input.transcript_words < self.options.min_words {
            Some(TextTooShort)
        } else {
            None
        };

        match blocked {
            Some(reason) => InterruptionDecision::Blocked(reason),
            None => InterruptionDecision::Interrupt,
        }
    }
}

#[derive(Debug, Default)]
struct AbortState {
    raised: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared by synthesis and output
///
/// Raising wakes every task waiting in [`AbortFlag::raised`]. The flag stays
/// raised until [`AbortFlag::reset`] is called at the start of the next reply.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    inner: Arc<AbortState>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    /// Resolves once the flag is raised (immediately if it already is)
    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}
