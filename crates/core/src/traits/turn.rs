//! Turn-taking collaborator traits

use async_trait::async_trait;

use crate::context::DialogueContext;
use crate::error::Error;

/// Classifier verdict on whether the user finished their turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnVerdict {
    Finished,
    Unfinished,
}

/// External end-of-turn classifier
#[async_trait]
pub trait TurnClassifier: Send + Sync {
    async fn classify(
        &self,
        transcript: &str,
        context: &DialogueContext,
    ) -> Result<TurnVerdict, Error>;
}

/// Memory/context lookup started speculatively while the endpoint delay runs
#[async_trait]
pub trait ContextLookup: Send + Sync {
    /// Returns extra context for the language model, if any
    async fn lookup(&self, transcript: &str) -> Result<Option<String>, Error>;
}
