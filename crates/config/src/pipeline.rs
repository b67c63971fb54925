//! Pipeline configuration
//!
//! The base [`PipelineSettings`] are immutable after load. Anything a connection may
//! change (agent profile, client hello) goes through [`SessionOverrides`] and is merged
//! exactly once when the session initializes.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PipelineSettings {
    /// VAD configuration
    #[serde(default)]
    pub vad: VadSettings,

    /// End-of-turn timing
    #[serde(default)]
    pub endpointing: EndpointingSettings,

    /// Interruption (barge-in) configuration
    #[serde(default)]
    pub interruption: InterruptionSettings,

    /// TTS segmentation and prefetch
    #[serde(default)]
    pub tts: TtsSettings,

    /// Outgoing audio pacing
    #[serde(default)]
    pub output: OutputSettings,
}

impl PipelineSettings {
    /// Merge per-connection overrides into a copy of the base settings
    pub fn with_overrides(&self, overrides: &SessionOverrides) -> PipelineSettings {
        let mut merged = self.clone();
        if let Some(ms) = overrides.min_endpoint_delay_ms {
            merged.endpointing.min_endpoint_delay_ms = ms;
        }
        if let Some(ms) = overrides.max_endpoint_delay_ms {
            merged.endpointing.max_endpoint_delay_ms = ms;
        }
        // A connection may shorten max below the configured min; keep the pair ordered
        if merged.endpointing.max_endpoint_delay_ms < merged.endpointing.min_endpoint_delay_ms {
            merged.endpointing.max_endpoint_delay_ms = merged.endpointing.min_endpoint_delay_ms;
        }
        if let Some(enabled) = overrides.interruption_enabled {
            merged.interruption.enabled = enabled;
        }
        if let Some(ms) = overrides.min_interrupt_speech_duration_ms {
            merged.interruption.min_interrupt_speech_duration_ms = ms;
        }
        if let Some(depth) = overrides.prefetch_depth {
            merged.tts.prefetch_depth = depth.max(1);
        }
        merged
    }

    /// Validate pipeline settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.vad.activation_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(ConfigError::invalid(
                "pipeline.vad.activation_threshold",
                format!("must be between 0 and 1, got {}", threshold),
            ));
        }
        if !(self.vad.smoothing_factor > 0.0 && self.vad.smoothing_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "pipeline.vad.smoothing_factor",
                "must be in (0, 1]",
            ));
        }
        if self.vad.window_ms == 0 {
            return Err(ConfigError::invalid("pipeline.vad.window_ms", "must be non-zero"));
        }
        if self.endpointing.min_endpoint_delay_ms > self.endpointing.max_endpoint_delay_ms {
            return Err(ConfigError::invalid(
                "pipeline.endpointing.min_endpoint_delay_ms",
                "must not exceed max_endpoint_delay_ms",
            ));
        }
        if self.tts.prefetch_depth == 0 {
            return Err(ConfigError::invalid("pipeline.tts.prefetch_depth", "must be at least 1"));
        }
        if self.tts.first_segment_min_chars >= self.tts.max_segment_chars {
            return Err(ConfigError::invalid(
                "pipeline.tts.first_segment_min_chars",
                "must be smaller than max_segment_chars",
            ));
        }
        if !(self.output.pace_ratio > 0.5 && self.output.pace_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "pipeline.output.pace_ratio",
                "must be in (0.5, 1.0]",
            ));
        }
        Ok(())
    }
}

/// Voice Activity Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VadSettings {
    /// Smoothed probability above which a window counts as speech (0.0 - 1.0)
    #[serde(default = "default_activation_threshold")]
    pub activation_threshold: f32,

    /// Inference window size in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u32,

    /// Exponential smoothing factor applied to raw probabilities
    #[serde(default = "default_smoothing")]
    pub smoothing_factor: f32,

    /// Minimum speech duration to confirm speech (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_duration_ms: u64,

    /// Minimum silence duration to end speech (ms)
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_duration_ms: u64,

    /// Pre-roll kept before speech onset (ms)
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_duration_ms: u64,

    /// Upper bound on buffered speech per utterance (ms)
    #[serde(default = "default_max_buffered_ms")]
    pub max_buffered_speech_ms: u64,

    /// Energy model: level treated as certain silence (dBFS)
    #[serde(default = "default_energy_floor")]
    pub energy_floor_db: f32,

    /// Energy model: level treated as certain speech (dBFS)
    #[serde(default = "default_energy_ceiling")]
    pub energy_ceiling_db: f32,
}

fn default_activation_threshold() -> f32 {
    0.5
}
fn default_window_ms() -> u32 {
    32
}
fn default_smoothing() -> f32 {
    0.35
}
fn default_min_speech_ms() -> u64 {
    100
}
fn default_min_silence_ms() -> u64 {
    550
}
fn default_prefix_padding_ms() -> u64 {
    500
}
fn default_max_buffered_ms() -> u64 {
    60_000
}
fn default_energy_floor() -> f32 {
    -50.0
}
fn default_energy_ceiling() -> f32 {
    -20.0
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            activation_threshold: default_activation_threshold(),
            window_ms: default_window_ms(),
            smoothing_factor: default_smoothing(),
            min_speech_duration_ms: default_min_speech_ms(),
            min_silence_duration_ms: default_min_silence_ms(),
            prefix_padding_duration_ms: default_prefix_padding_ms(),
            max_buffered_speech_ms: default_max_buffered_ms(),
            energy_floor_db: default_energy_floor(),
            energy_ceiling_db: default_energy_ceiling(),
        }
    }
}

/// End-of-turn timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointingSettings {
    /// Delay after silence when the turn looks finished (ms)
    #[serde(default = "default_min_endpoint_delay")]
    pub min_endpoint_delay_ms: u64,

    /// Delay after silence when the turn looks unfinished (ms)
    #[serde(default = "default_max_endpoint_delay")]
    pub max_endpoint_delay_ms: u64,

    /// Consult the external turn classifier
    #[serde(default)]
    pub classifier_enabled: bool,

    /// Classifier deadline before failing open (ms)
    #[serde(default = "default_classifier_timeout")]
    pub classifier_timeout_ms: u64,

    /// Run the speculative context lookup while waiting
    #[serde(default = "default_true")]
    pub speculative_lookup: bool,
}

fn default_min_endpoint_delay() -> u64 {
    500
}
fn default_max_endpoint_delay() -> u64 {
    2000
}
fn default_classifier_timeout() -> u64 {
    400
}
fn default_true() -> bool {
    true
}

impl Default for EndpointingSettings {
    fn default() -> Self {
        Self {
            min_endpoint_delay_ms: default_min_endpoint_delay(),
            max_endpoint_delay_ms: default_max_endpoint_delay(),
            classifier_enabled: false,
            classifier_timeout_ms: default_classifier_timeout(),
            speculative_lookup: true,
        }
    }
}

/// Interruption configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptionSettings {
    /// Allow the user to interrupt the agent
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Speech needed since renewed onset (ms)
    #[serde(default = "default_min_interrupt_speech")]
    pub min_interrupt_speech_duration_ms: u64,

    /// Words needed in the live transcript (streaming STT only)
    #[serde(default = "default_min_interrupt_words")]
    pub min_interrupt_text_length: usize,
}

fn default_min_interrupt_speech() -> u64 {
    500
}
fn default_min_interrupt_words() -> usize {
    2
}

impl Default for InterruptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interrupt_speech_duration_ms: default_min_interrupt_speech(),
            min_interrupt_text_length: default_min_interrupt_words(),
        }
    }
}

/// TTS segmentation and prefetch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsSettings {
    /// First segment: soft punctuation counts once this many characters accumulated
    #[serde(default = "default_first_segment_min_chars")]
    pub first_segment_min_chars: usize,

    /// Later segments: also split on soft punctuation
    #[serde(default)]
    pub soft_split_later_segments: bool,

    /// Later segments: soft punctuation minimum length
    #[serde(default = "default_later_segment_min_chars")]
    pub later_segment_min_chars: usize,

    /// Force-cut segments longer than this
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,

    /// Concurrent synthesis jobs
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,

    /// Pre-open the next backend connection while one is in use
    #[serde(default = "default_true")]
    pub keep_warm: bool,
}

fn default_first_segment_min_chars() -> usize {
    10
}
fn default_later_segment_min_chars() -> usize {
    60
}
fn default_max_segment_chars() -> usize {
    200
}
fn default_prefetch_depth() -> usize {
    3
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            first_segment_min_chars: default_first_segment_min_chars(),
            soft_split_later_segments: false,
            later_segment_min_chars: default_later_segment_min_chars(),
            max_segment_chars: default_max_segment_chars(),
            prefetch_depth: default_prefetch_depth(),
            keep_warm: true,
        }
    }
}

/// Outgoing audio pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSettings {
    /// Packets sent immediately at the start of a reply
    #[serde(default = "default_prebuffer")]
    pub prebuffer_packets: usize,

    /// Send interval as a fraction of real time (slightly below 1.0)
    #[serde(default = "default_pace_ratio")]
    pub pace_ratio: f64,

    /// Outgoing packet duration (ms)
    #[serde(default = "default_packet_ms")]
    pub packet_duration_ms: u32,

    /// Reorder lookahead for gateway transports (packets)
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
}

fn default_prebuffer() -> usize {
    5
}
fn default_pace_ratio() -> f64 {
    0.95
}
fn default_packet_ms() -> u32 {
    60
}
fn default_reorder_capacity() -> usize {
    8
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            prebuffer_packets: default_prebuffer(),
            pace_ratio: default_pace_ratio(),
            packet_duration_ms: default_packet_ms(),
            reorder_capacity: default_reorder_capacity(),
        }
    }
}

/// How the client drives listening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// VAD decides when turns end
    #[default]
    Auto,
    /// The client sends explicit listen start/stop
    Manual,
    /// Continuous listening with interruption
    Realtime,
}

/// Per-connection overrides, merged once at session initialization
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionOverrides {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub min_endpoint_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_endpoint_delay_ms: Option<u64>,
    #[serde(default)]
    pub interruption_enabled: Option<bool>,
    #[serde(default)]
    pub min_interrupt_speech_duration_ms: Option<u64>,
    #[serde(default)]
    pub prefetch_depth: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vad.window_ms, 32);
        assert_eq!(settings.endpointing.min_endpoint_delay_ms, 500);
        assert_eq!(settings.endpointing.max_endpoint_delay_ms, 2000);
    }

    #[test]
    fn test_validation_rejects_inverted_delays() {
        let mut settings = PipelineSettings::default();
        settings.endpointing.min_endpoint_delay_ms = 3000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_threshold() {
        let mut settings = PipelineSettings::default();
        settings.vad.activation_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_overrides_merge_once() {
        let base = PipelineSettings::default();
        let overrides = SessionOverrides {
            min_endpoint_delay_ms: Some(800),
            max_endpoint_delay_ms: Some(600),
            interruption_enabled: Some(false),
            prefetch_depth: Some(0),
            ..Default::default()
        };

        let merged = base.with_overrides(&overrides);
        assert_eq!(merged.endpointing.min_endpoint_delay_ms, 800);
        assert_eq!(merged.endpointing.max_endpoint_delay_ms, 800);
        assert!(!merged.interruption.enabled);
        assert_eq!(merged.tts.prefetch_depth, 1);

        // Base is untouched
        assert_eq!(base.endpointing.min_endpoint_delay_ms, 500);
        assert!(base.interruption.enabled);
    }

    #[test]
    fn test_listen_mode_serde() {
        let mode: ListenMode = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(mode, ListenMode::Manual);
    }
}
