//! Speech provider adapters and the per-process provider set
//!
//! Thin OpenAI-compatible HTTP adapters:
//! - STT: `POST {base}/audio/transcriptions` (multipart WAV upload, one call per utterance)
//! - TTS: `POST {base}/audio/speech` with `response_format: pcm`, streamed as it downloads
//!
//! The LLM adapter lives in `voice-session-llm`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use voice_session_config::{Settings, SttProviderConfig, TtsProviderConfig};
use voice_session_core::{
    channel, AudioFrame, AudioStream, ContextLookup, Error, LanguageModel, ProviderError, SpeechData,
    SpeechEvent, SpeechToText, SttCapabilities, TextToSpeech, TtsCapabilities, TurnClassifier,
};
use voice_session_llm::{OpenAiChatClient, OpenAiChatConfig};
use voice_session_pipeline::{PooledTts, SynthesisConnection, VadModelFactory, WarmConnector, WarmPool};

use crate::options::energy_vad_factory;
use crate::ServerError;

/// Map a transport-level request failure
pub(crate) fn request_error(provider: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        ProviderError::timeout(provider, 0).into()
    } else if err.is_decode() || err.is_builder() {
        ProviderError::fatal(provider, err.to_string()).into()
    } else {
        ProviderError::transient(provider, err.to_string()).into()
    }
}

/// Pass successful responses through; 429 and 5xx are transient, other statuses fatal
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{}: {}", status, body.trim());
    if status.as_u16() == 429 || status.is_server_error() {
        Err(ProviderError::transient(provider, message).into())
    } else {
        Err(ProviderError::fatal(provider, message).into())
    }
}

/// 16-bit PCM WAV container for upload
pub fn encode_wav(frame: &AudioFrame) -> Vec<u8> {
    let data = frame.to_pcm16_le();
    let channels = frame.channels();
    let sample_rate = frame.sample_rate();
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut wav = Vec::with_capacity(44 + data.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
    wav.extend_from_slice(&data);
    wav
}

/// Batch transcription client
pub struct OpenAiStt {
    http: reqwest::Client,
    config: SttProviderConfig,
}

impl OpenAiStt {
    pub fn new(http: reqwest::Client, config: SttProviderConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    fn name(&self) -> &str {
        "openai-stt"
    }

    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: false,
            interim_results: false,
        }
    }

    async fn recognize(&self, audio: &AudioFrame, language: Option<&str>) -> Result<SpeechEvent, Error> {
        let url = format!("{}/audio/transcriptions", self.config.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(encode_wav(audio))
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| request_error(self.name(), e))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| request_error(self.name(), e))?;
        let response = check_status(self.name(), response).await?;
        let body: serde_json::Value = response.json().await.map_err(|e| request_error(self.name(), e))?;
        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        let mut data = SpeechData::new(text, 1.0);
        if let Some(language) = language {
            data = data.with_language(language);
        }
        Ok(SpeechEvent::final_transcript(data))
    }
}

/// Opens speech requests against the TTS endpoint
///
/// With keep-warm enabled, pool fills prime the shared HTTP pool (TCP + TLS) so the next
/// synthesis request skips connection setup. Inline connects never prime.
#[derive(Clone)]
pub struct SpeechConnector {
    http: reqwest::Client,
    config: TtsProviderConfig,
    voice: String,
    prime: bool,
}

impl SpeechConnector {
    pub fn new(http: reqwest::Client, config: TtsProviderConfig, voice: Option<&str>, prime: bool) -> Self {
        let voice = voice.unwrap_or(&config.voice).to_string();
        Self {
            http,
            config,
            voice,
            prime,
        }
    }
}

#[async_trait]
impl WarmConnector for SpeechConnector {
    type Connection = SpeechRequest;

    async fn connect(&self) -> Result<SpeechRequest, Error> {
        Ok(SpeechRequest {
            connector: self.clone(),
        })
    }

    async fn warm(&self) -> Result<SpeechRequest, Error> {
        if self.prime {
            let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
            let mut request = self.http.get(&url).timeout(Duration::from_secs(self.config.timeout_secs));
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            // Any response means the connection is up
            request.send().await.map_err(|e| request_error("openai-tts", e))?;
        }
        self.connect().await
    }
}

/// One synthesis request on a (possibly primed) connection
pub struct SpeechRequest {
    connector: SpeechConnector,
}

#[async_trait]
impl SynthesisConnection for SpeechRequest {
    async fn synthesize(self, text: String) -> Result<AudioStream, Error> {
        let SpeechConnector {
            http, config, voice, ..
        } = self.connector;

        let url = format!("{}/audio/speech", config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": config.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        });
        let mut request = http
            .post(&url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&body);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| request_error("openai-tts", e))?;
        let response = check_status("openai-tts", response).await?;

        let sample_rate = config.sample_rate;
        let (tx, rx) = channel::<Result<AudioFrame, Error>>();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = PcmChunker::default();
            while let Some(chunk) = body.next().await {
                let item = match chunk {
                    Ok(bytes) => match decoder.push(&bytes, sample_rate) {
                        Some(Ok(frame)) => Ok(frame),
                        Some(Err(e)) => Err(e),
                        None => continue,
                    },
                    Err(e) => Err(request_error("openai-tts", e)),
                };
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    return;
                }
            }
        });

        Ok(Box::pin(rx))
    }
}

/// Splits a PCM16 byte stream into frames, carrying an odd trailing byte
#[derive(Debug, Default)]
struct PcmChunker {
    carry: Option<u8>,
}

impl PcmChunker {
    fn push(&mut self, bytes: &[u8], sample_rate: u32) -> Option<Result<AudioFrame, Error>> {
        let mut buffer = Vec::with_capacity(bytes.len() + 1);
        buffer.extend(self.carry.take());
        buffer.extend_from_slice(bytes);
        if buffer.len() % 2 == 1 {
            self.carry = buffer.pop();
        }
        if buffer.is_empty() {
            return None;
        }
        Some(AudioFrame::from_pcm16_le(&buffer, sample_rate, 1).map_err(Error::from))
    }
}

/// Builds the TTS engine for one session voice
pub type TtsFactory = Arc<dyn Fn(Option<&str>) -> Arc<dyn TextToSpeech> + Send + Sync>;

/// Engines shared by every session
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: TtsFactory,
    pub vad: VadModelFactory,
    pub classifier: Option<Arc<dyn TurnClassifier>>,
    pub lookup: Option<Arc<dyn ContextLookup>>,
}

impl Providers {
    /// OpenAI-compatible engines and the energy VAD, sharing one HTTP client
    pub fn from_settings(settings: &Settings, http: reqwest::Client) -> Result<Self, ServerError> {
        let llm_config = &settings.providers.llm;
        let llm = OpenAiChatClient::new(
            http.clone(),
            OpenAiChatConfig {
                base_url: llm_config.base_url.clone(),
                api_key: llm_config.api_key.clone(),
                model: llm_config.model.clone(),
                temperature: llm_config.temperature,
                max_tokens: llm_config.max_tokens,
                timeout: Duration::from_secs(llm_config.timeout_secs),
            },
        )
        .map_err(|e| ServerError::Internal(e.to_string()))?;

        let stt = OpenAiStt::new(http.clone(), settings.providers.stt.clone());

        let tts_config = settings.providers.tts.clone();
        let keep_warm = settings.pipeline.tts.keep_warm;
        let tts: TtsFactory = Arc::new(move |voice: Option<&str>| -> Arc<dyn TextToSpeech> {
            let connector = SpeechConnector::new(http.clone(), tts_config.clone(), voice, keep_warm);
            let pool = WarmPool::new(connector);
            if keep_warm {
                pool.warm_up();
            }
            Arc::new(PooledTts::new(
                "openai-tts",
                TtsCapabilities {
                    streaming: true,
                    sample_rate: tts_config.sample_rate,
                },
                pool,
            ))
        });

        Ok(Self {
            stt: Arc::new(stt),
            llm: Arc::new(llm),
            tts,
            vad: energy_vad_factory(&settings.pipeline.vad),
            classifier: None,
            lookup: None,
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TurnClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ContextLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn tts_for(&self, voice: Option<&str>) -> Arc<dyn TextToSpeech> {
        (self.tts)(voice)
    }
}
