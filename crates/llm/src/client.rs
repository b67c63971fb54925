//! OpenAI-compatible streaming chat client
//!
//! Sends the dialogue context to `{base_url}/chat/completions` with `stream: true` and turns
//! the server-sent event stream into [`ChatDelta`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use voice_session_core::{
    channel, ChatDelta, ChatStream, DialogueContext, Error, LanguageModel, ToolCallDelta,
};

use crate::prompt::to_openai_messages;
use crate::LlmError;

/// Client configuration
#[derive(Debug, Clone)]
pub struct OpenAiChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Time allowed until response headers arrive
    pub timeout: Duration,
}

impl Default for OpenAiChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Streaming chat client
pub struct OpenAiChatClient {
    http: reqwest::Client,
    config: OpenAiChatConfig,
}

impl OpenAiChatClient {
    /// Share an existing HTTP client (connection pool)
    pub fn new(http: reqwest::Client, config: OpenAiChatConfig) -> Result<Self, LlmError> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::Configuration("LLM base_url is empty".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::Configuration("LLM model is empty".to_string()));
        }
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OpenAiChatConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Request body for one streamed completion
    pub fn request_body(&self, context: &DialogueContext) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": to_openai_messages(context),
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream": true,
        })
    }

    async fn open(&self, context: &DialogueContext) -> Result<reqwest::Response, LlmError> {
        let mut request = self.http.post(self.endpoint()).json(&self.request_body(context));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| LlmError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn chat(&self, context: &DialogueContext) -> Result<ChatStream, Error> {
        let response = self.open(context).await?;
        let (tx, rx) = channel::<Result<ChatDelta, Error>>();
        let model = self.config.model.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::from(e).into()));
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    let item = match event {
                        SseEvent::Done => {
                            tracing::debug!(model = %model, "Stream completed");
                            return;
                        }
                        SseEvent::Delta(delta) => Ok(delta),
                        SseEvent::Error(message) => Err(LlmError::Generation(message).into()),
                    };
                    if tx.send(item).is_err() {
                        // Reply was cancelled
                        return;
                    }
                }
            }

            tracing::debug!(model = %model, "Stream ended without [DONE]");
        });

        Ok(Box::pin(rx))
    }
}

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Delta(ChatDelta),
    Error(String),
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental `data:` line decoder
///
/// Bytes may split anywhere, including inside a UTF-8 sequence, so undecoded bytes are
/// held until the line completes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = Self::parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Skipping malformed stream chunk: {}", e);
                return None;
            }
        };

        if let Some(error) = chunk.error {
            return Some(SseEvent::Error(error.message));
        }

        let delta = chunk.choices.into_iter().next()?.delta;
        let tool_calls: Vec<ToolCallDelta> = delta
            .tool_calls
            .into_iter()
            .map(|call| {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                ToolCallDelta {
                    index: call.index,
                    call_id: call.id,
                    name,
                    arguments,
                }
            })
            .collect();

        let content = delta.content.filter(|c| !c.is_empty());
        if content.is_none() && tool_calls.is_empty() {
            return None;
        }
        Some(SseEvent::Delta(ChatDelta { content, tool_calls }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        let stream = format!("{}{}data: [DONE]\n\n", content_chunk("Hel"), content_chunk("lo"));
        let (a, b) = stream.as_bytes().split_at(17);

        let mut events = decoder.push(a);
        events.extend(decoder.push(b));

        assert_eq!(
            events,
            vec![
                SseEvent::Delta(ChatDelta::text("Hel")),
                SseEvent::Delta(ChatDelta::text("lo")),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn test_decoder_keeps_split_utf8() {
        let mut decoder = SseDecoder::default();
        let line = content_chunk("नमस्ते");
        let bytes = line.as_bytes();
        // Split inside a multi-byte character
        let cut = line.find('न').unwrap() + 1;

        assert!(decoder.push(&bytes[..cut]).is_empty());
        assert_eq!(
            decoder.push(&bytes[cut..]),
            vec![SseEvent::Delta(ChatDelta::text("नमस्ते"))]
        );
    }

    #[test]
    fn test_decoder_tool_calls_and_noise() {
        let mut decoder = SseDecoder::default();
        let tool = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "weather", "arguments": "{\"ci"}}
        ]}}]});
        let input = format!(
            ": keep-alive\n\ndata: {{not json\n\ndata: {}\n\ndata: {}\n\n",
            json!({"choices": [{"delta": {"role": "assistant"}}]}),
            tool
        );

        let events = decoder.push(input.as_bytes());
        assert_eq!(events.len(), 1);
        let SseEvent::Delta(delta) = &events[0] else {
            panic!("expected delta");
        };
        assert_eq!(delta.tool_calls[0].call_id.as_deref(), Some("call_1"));
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("weather"));
        assert_eq!(delta.tool_calls[0].arguments, "{\"ci");
    }

    #[test]
    fn test_decoder_error_event() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: {\"error\": {\"message\": \"overloaded\"}}\n");
        assert_eq!(events, vec![SseEvent::Error("overloaded".to_string())]);
    }

    #[test]
    fn test_request_body() {
        let client = OpenAiChatClient::new(
            reqwest::Client::new(),
            OpenAiChatConfig {
                model: "small".to_string(),
                ..OpenAiChatConfig::default()
            },
        )
        .unwrap();

        let mut context = DialogueContext::with_system_prompt("be brief");
        context.add_user("hi");
        let body = client.request_body(&context);

        assert_eq!(body["model"], "small");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_rejects_empty_config() {
        let config = OpenAiChatConfig {
            model: " ".to_string(),
            ..OpenAiChatConfig::default()
        };
        assert!(OpenAiChatClient::new(reqwest::Client::new(), config).is_err());
    }
}
