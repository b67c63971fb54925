//! Settings to pipeline option conversions

use std::time::Duration;

use voice_session_config::{PipelineSettings, RetryConfig, VadSettings};
use voice_session_core::{RetryPolicy, VadModel};
use voice_session_pipeline::{
    EndpointOptions, EnergyVadModel, InterruptionOptions, SegmenterOptions, SynthesisOptions,
    VadModelFactory, VadOptions,
};
use voice_session_transport::PacerOptions;

const VAD_SAMPLE_RATE: u32 = 16000;

pub fn vad_options(vad: &VadSettings) -> VadOptions {
    VadOptions {
        activation_threshold: vad.activation_threshold,
        smoothing_factor: vad.smoothing_factor,
        min_speech_duration: Duration::from_millis(vad.min_speech_duration_ms),
        min_silence_duration: Duration::from_millis(vad.min_silence_duration_ms),
        prefix_padding_duration: Duration::from_millis(vad.prefix_padding_duration_ms),
        max_buffered_speech: Duration::from_millis(vad.max_buffered_speech_ms),
    }
}

/// Energy model factory sized to the configured window
pub fn energy_vad_factory(vad: &VadSettings) -> VadModelFactory {
    let window_size = (VAD_SAMPLE_RATE * vad.window_ms / 1000) as usize;
    let (floor, ceiling) = (vad.energy_floor_db, vad.energy_ceiling_db);
    std::sync::Arc::new(move || -> Box<dyn VadModel> {
        Box::new(EnergyVadModel::new(floor, ceiling).with_window(VAD_SAMPLE_RATE, window_size))
    })
}

pub fn endpoint_options(settings: &PipelineSettings) -> EndpointOptions {
    let endpointing = &settings.endpointing;
    EndpointOptions {
        min_endpoint_delay: Duration::from_millis(endpointing.min_endpoint_delay_ms),
        max_endpoint_delay: Duration::from_millis(endpointing.max_endpoint_delay_ms),
        classifier_timeout: Duration::from_millis(endpointing.classifier_timeout_ms),
        speculative_lookup: endpointing.speculative_lookup,
    }
}

pub fn interruption_options(settings: &PipelineSettings) -> InterruptionOptions {
    let interruption = &settings.interruption;
    InterruptionOptions {
        enabled: interruption.enabled,
        min_speech_duration: Duration::from_millis(interruption.min_interrupt_speech_duration_ms),
        min_words: interruption.min_interrupt_text_length,
    }
}

pub fn synthesis_options(settings: &PipelineSettings, retry: RetryPolicy) -> SynthesisOptions {
    let tts = &settings.tts;
    SynthesisOptions {
        segmenter: SegmenterOptions {
            first_min_chars: tts.first_segment_min_chars,
            soft_split_later: tts.soft_split_later_segments,
            later_min_chars: tts.later_segment_min_chars,
            max_chars: tts.max_segment_chars,
        },
        prefetch_depth: tts.prefetch_depth.max(1),
        retry,
    }
}

/// Pacing for a client whose packets last `frame_duration_ms`
pub fn pacer_options(settings: &PipelineSettings, frame_duration_ms: u32) -> PacerOptions {
    let output = &settings.output;
    let packet_ms = if frame_duration_ms > 0 {
        frame_duration_ms
    } else {
        output.packet_duration_ms
    };
    PacerOptions {
        packet_duration: Duration::from_millis(packet_ms as u64),
        pace_ratio: output.pace_ratio,
        prebuffer: output.prebuffer_packets,
    }
}

pub fn retry_policy(retry: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: retry.max_attempts.max(1),
        initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
        max_backoff: Duration::from_millis(retry.max_backoff_ms),
        ..RetryPolicy::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_session_config::SessionOverrides;

    #[test]
    fn test_overrides_flow_into_options() {
        let base = PipelineSettings::default();
        let merged = base.with_overrides(&SessionOverrides {
            min_endpoint_delay_ms: Some(300),
            prefetch_depth: Some(5),
            ..SessionOverrides::default()
        });

        assert_eq!(endpoint_options(&merged).min_endpoint_delay, Duration::from_millis(300));
        assert_eq!(synthesis_options(&merged, RetryPolicy::none()).prefetch_depth, 5);
        // Base settings are untouched
        assert_eq!(endpoint_options(&base).min_endpoint_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_vad_factory_window() {
        let factory = energy_vad_factory(&VadSettings::default());
        let model = factory();
        assert_eq!(model.sample_rate(), 16000);
        assert_eq!(model.window_size(), 512);
    }

    #[test]
    fn test_pacer_follows_client_frame_duration() {
        let settings = PipelineSettings::default();
        assert_eq!(pacer_options(&settings, 20).packet_duration, Duration::from_millis(20));
        assert_eq!(pacer_options(&settings, 0).packet_duration, Duration::from_millis(60));
    }
}
