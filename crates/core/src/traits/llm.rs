//! Language model trait

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::DialogueContext;
use crate::error::Error;

/// Incremental piece of a tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One streamed increment of a model response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

impl ChatDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Streamed model response
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, Error>> + Send>>;

/// Language model backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model name for logs and metrics
    fn name(&self) -> &str;

    /// Start generating a reply for the given context
    async fn chat(&self, context: &DialogueContext) -> Result<ChatStream, Error>;
}
