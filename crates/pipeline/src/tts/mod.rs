//! Streaming Text-to-Speech
//!
//! Features:
//! - Sentence-level segmentation with an early first segment
//! - Bounded prefetch of later segments, delivered strictly in order
//! - Cooperative abort on barge-in
//! - Keep-warm connections for connection-oriented backends

mod keep_warm;
mod segmenter;
mod streaming;

pub use keep_warm::{PooledTts, SynthesisConnection, WarmConnector, WarmPool};
pub use segmenter::{SegmenterOptions, TextSegmenter};
pub use streaming::{ReplyHandle, SynthesisEvent, SynthesisOptions, SynthesisPipeline, TextInput};
