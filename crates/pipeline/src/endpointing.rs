//! Turn completion (endpoint delay)
//!
//! Decides, after a debounced delay, that the user finished speaking. At most one
//! completion task is pending at any time; every evaluation or cancellation
//! supersedes the previous one.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use voice_session_core::{ContextLookup, DialogueContext, Sender, TurnClassifier, TurnVerdict};

/// Endpoint delay tuning
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Delay after the last speech when the turn looks finished
    pub min_endpoint_delay: Duration,
    /// Delay when the classifier says the user is mid-thought
    pub max_endpoint_delay: Duration,
    /// Budget for one classifier call
    pub classifier_timeout: Duration,
    /// Start the context lookup while the delay runs
    pub speculative_lookup: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            min_endpoint_delay: Duration::from_millis(500),
            max_endpoint_delay: Duration::from_millis(2000),
            classifier_timeout: Duration::from_millis(400),
            speculative_lookup: true,
        }
    }
}

/// Input for one evaluation
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub transcript: String,
    pub last_speech_at: Instant,
    pub context: DialogueContext,
}

/// A turn the engine decided is complete
#[derive(Debug, Clone)]
pub struct CommittedTurn {
    /// Generation of the evaluation that produced this turn
    pub generation: u64,
    pub transcript: String,
    pub verdict: TurnVerdict,
    /// Speculative lookup result, if it finished before the delay ended
    pub lookup: Option<String>,
    /// Delay that was applied after the last speech
    pub delay: Duration,
    pub last_speech_at: Instant,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Single-slot turn completion engine
pub struct TurnCompletion {
    options: EndpointOptions,
    classifier: Option<Arc<dyn TurnClassifier>>,
    lookup: Option<Arc<dyn ContextLookup>>,
    pending: Option<AbortOnDrop<()>>,
    generation: u64,
}

impl TurnCompletion {
    pub fn new(options: EndpointOptions) -> Self {
        Self {
            options,
            classifier: None,
            lookup: None,
            pending: None,
            generation: 0,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TurnClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ContextLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Generation of the latest evaluation; older commits are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a completion task is waiting to fire
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map_or(false, |task| !task.0.is_finished())
    }

    /// Cancel any pending task and start a new one
    ///
    /// Returns immediately. The committed turn is sent on `commits` once the delay elapses.
    pub fn evaluate(&mut self, request: EvaluationRequest, commits: &Sender<CommittedTurn>) {
        self.cancel();
        let generation = self.generation;

        let options = self.options.clone();
        let classifier = self.classifier.clone();
        let lookup = self.lookup.clone().filter(|_| options.speculative_lookup);
        let commits = commits.clone();

        let task = tokio::spawn(async move {
            let EvaluationRequest {
                transcript,
                last_speech_at,
                context,
            } = request;

            let verdict = match classifier {
                Some(classifier) => classify(classifier.as_ref(), &transcript, &context, options.classifier_timeout).await,
                None => TurnVerdict::Finished,
            };

            let delay = match verdict {
                TurnVerdict::Finished => options.min_endpoint_delay,
                TurnVerdict::Unfinished => options.max_endpoint_delay,
            };
            let elapsed = Instant::now().saturating_duration_since(last_speech_at);
            let remaining = delay.saturating_sub(elapsed);

            let speculative = match (verdict, lookup) {
                (TurnVerdict::Finished, Some(lookup)) => {
                    let text = transcript.clone();
                    Some(AbortOnDrop(tokio::spawn(async move { lookup.lookup(&text).await })))
                }
                _ => None,
            };

            tracing::debug!(
                generation,
                ?verdict,
                remaining_ms = remaining.as_millis() as u64,
                "Waiting for endpoint delay"
            );
            tokio::time::sleep(remaining).await;

            let lookup = match speculative {
                Some(mut task) if task.0.is_finished() => match (&mut task.0).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        tracing::warn!("Context lookup failed: {}", e);
                        None
                    }
                    Err(_) => None,
                },
                Some(_) => {
                    tracing::debug!("Context lookup still running at commit, dropping it");
                    None
                }
                None => None,
            };

            let _ = commits.send(CommittedTurn {
                generation,
                transcript,
                verdict,
                lookup,
                delay,
                last_speech_at,
            });
        });

        self.pending = Some(AbortOnDrop(task));
    }

    /// Cancel the pending task, if any
    pub fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.pending.take() {
            if !task.0.is_finished() {
                tracing::debug!(generation = self.generation, "Cancelled pending turn completion");
            }
        }
    }

    /// Accept a commit only if it belongs to the latest evaluation
    pub fn accept(&mut self, turn: &CommittedTurn) -> bool {
        if turn.generation != self.generation {
            return false;
        }
        self.pending = None;
        true
    }
}

async fn classify(
    classifier: &dyn TurnClassifier,
    transcript: &str,
    context: &DialogueContext,
    timeout: Duration,
) -> TurnVerdict {
    match tokio::time::timeout(timeout, classifier.classify(transcript, context)).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            tracing::warn!("Turn classifier failed, assuming finished: {}", e);
            TurnVerdict::Finished
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Turn classifier timed out, assuming finished"
            );
            TurnVerdict::Finished
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voice_session_core::{channel, Error, Receiver};

    struct FixedClassifier {
        verdict: TurnVerdict,
        latency: Duration,
    }

    #[async_trait]
    impl TurnClassifier for FixedClassifier {
        async fn classify(&self, _transcript: &str, _context: &DialogueContext) -> Result<TurnVerdict, Error> {
            tokio::time::sleep(self.latency).await;
            Ok(self.verdict)
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl TurnClassifier for FailingClassifier {
        async fn classify(&self, _transcript: &str, _context: &DialogueContext) -> Result<TurnVerdict, Error> {
            Err(Error::other("model unavailable"))
        }
    }

    struct SlowLookup(Duration);

    #[async_trait]
    impl ContextLookup for SlowLookup {
        async fn lookup(&self, transcript: &str) -> Result<Option<String>, Error> {
            tokio::time::sleep(self.0).await;
            Ok(Some(format!("notes about {}", transcript)))
        }
    }

    fn request(last_speech_at: Instant) -> EvaluationRequest {
        EvaluationRequest {
            transcript: "book a table".into(),
            last_speech_at,
            context: DialogueContext::new(),
        }
    }

    fn setup() -> (Sender<CommittedTurn>, Receiver<CommittedTurn>) {
        channel()
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_after_min_delay() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default());

        let last_speech = Instant::now();
        engine.evaluate(request(last_speech), &tx);
        assert!(engine.is_pending());

        let turn = rx.recv().await.unwrap();
        let waited = Instant::now() - last_speech;
        assert!(waited >= Duration::from_millis(500));
        assert!(waited <= Duration::from_millis(550));
        assert_eq!(turn.verdict, TurnVerdict::Finished);
        assert!(engine.accept(&turn));
        assert!(!engine.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_silence_shortens_wait() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default());

        let last_speech = Instant::now();
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.evaluate(request(last_speech), &tx);

        rx.recv().await.unwrap();
        assert_eq!(Instant::now() - last_speech, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_speech_cancels() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default());

        engine.evaluate(request(Instant::now()), &tx);
        tokio::time::sleep(Duration::from_millis(400)).await;
        engine.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(result.is_err(), "cancelled evaluation must not commit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reevaluation_supersedes() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default());

        engine.evaluate(request(Instant::now()), &tx);
        let first_generation = engine.generation();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.evaluate(request(Instant::now()), &tx);

        let turn = rx.recv().await.unwrap();
        assert_ne!(turn.generation, first_generation);
        assert!(engine.accept(&turn));

        let extra = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_uses_max_delay() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default()).with_classifier(Arc::new(
            FixedClassifier {
                verdict: TurnVerdict::Unfinished,
                latency: Duration::from_millis(50),
            },
        ));

        let last_speech = Instant::now();
        engine.evaluate(request(last_speech), &tx);
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.verdict, TurnVerdict::Unfinished);
        assert_eq!(Instant::now() - last_speech, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_failure_and_timeout_fail_open() {
        let (tx, mut rx) = setup();
        let mut engine =
            TurnCompletion::new(EndpointOptions::default()).with_classifier(Arc::new(FailingClassifier));
        engine.evaluate(request(Instant::now()), &tx);
        assert_eq!(rx.recv().await.unwrap().verdict, TurnVerdict::Finished);

        let mut engine = TurnCompletion::new(EndpointOptions::default()).with_classifier(Arc::new(
            FixedClassifier {
                verdict: TurnVerdict::Unfinished,
                latency: Duration::from_secs(5),
            },
        ));
        let last_speech = Instant::now();
        engine.evaluate(request(last_speech), &tx);
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.verdict, TurnVerdict::Finished);
        // Classifier budget counts toward the endpoint delay
        assert_eq!(Instant::now() - last_speech, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speculative_lookup_result() {
        let (tx, mut rx) = setup();
        let mut engine = TurnCompletion::new(EndpointOptions::default())
            .with_lookup(Arc::new(SlowLookup(Duration::from_millis(100))));
        engine.evaluate(request(Instant::now()), &tx);
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.lookup.as_deref(), Some("notes about book a table"));

        let mut engine = TurnCompletion::new(EndpointOptions::default())
            .with_lookup(Arc::new(SlowLookup(Duration::from_secs(2))));
        engine.evaluate(request(Instant::now()), &tx);
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.lookup, None);
    }
}
