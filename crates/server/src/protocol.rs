//! WebSocket control protocol
//!
//! Text frames carry JSON objects tagged by `type`. Binary frames carry audio and are not
//! modeled here.

use serde::{Deserialize, Serialize};
use voice_session_config::ListenMode;
use voice_session_core::AudioFormat;

use crate::ServerError;

/// Audio parameters announced in `hello`
pub type AudioParams = AudioFormat;

fn default_transport() -> String {
    "websocket".to_string()
}

fn default_version() -> u32 {
    1
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        #[serde(default = "default_version")]
        version: u32,
        #[serde(default = "default_transport")]
        transport: String,
        #[serde(default)]
        audio_params: AudioParams,
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        features: Option<serde_json::Value>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ServerError> {
        serde_json::from_str(text).map_err(|e| ServerError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    /// Wake word detected; `text` carries it
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        session_id: String,
        transport: String,
        audio_params: AudioParams,
    },
    Stt {
        text: String,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Llm {
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
        text: String,
    },
}

impl ServerMessage {
    pub fn tts_start(sample_rate: u32) -> Self {
        ServerMessage::Tts {
            state: TtsState::Start,
            sample_rate: Some(sample_rate),
            text: None,
        }
    }

    pub fn sentence_start(text: impl Into<String>) -> Self {
        ServerMessage::Tts {
            state: TtsState::SentenceStart,
            sample_rate: None,
            text: Some(text.into()),
        }
    }

    pub fn sentence_end(text: impl Into<String>) -> Self {
        ServerMessage::Tts {
            state: TtsState::SentenceEnd,
            sample_rate: None,
            text: Some(text.into()),
        }
    }

    pub fn tts_stop() -> Self {
        ServerMessage::Tts {
            state: TtsState::Stop,
            sample_rate: None,
            text: None,
        }
    }

    pub fn to_json(&self) -> Result<String, ServerError> {
        serde_json::to_string(self).map_err(|e| ServerError::Protocol(e.to_string()))
    }
}
