//! Collaborator traits consumed by the session engine
//!
//! The engine never depends on a concrete vendor. Every external engine is reached
//! through one of these traits so backends can be swapped by configuration and
//! replaced with scripted fakes in tests.
//!
//! ```text
//! Speech:
//!   - VadModel: per-window speech probability
//!   - SpeechToText: streaming or batch recognition
//!   - TextToSpeech: streaming or batch synthesis
//!
//! Language:
//!   - LanguageModel: dialogue context -> incremental deltas
//!
//! Turn taking:
//!   - TurnClassifier: finished/unfinished verdict for a transcript
//!   - ContextLookup: speculative memory lookup during the endpoint delay
//! ```

mod llm;
mod speech;
mod turn;

pub use llm::{ChatDelta, ChatStream, LanguageModel, ToolCallDelta};
pub use speech::{
    AudioStream, SpeechToText, SttCapabilities, SttStream, TextToSpeech, TtsCapabilities, VadModel,
};
pub use turn::{ContextLookup, TurnClassifier, TurnVerdict};
