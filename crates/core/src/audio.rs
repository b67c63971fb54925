//! Audio frame types
//!
//! All audio inside the engine flows as [`AudioFrame`]s of interleaved 16-bit PCM.
//! Frames are immutable once built; combining frames copies into a new buffer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Wire encoding of client audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// Raw little-endian 16-bit PCM
    Pcm,
    /// Opus packets
    #[default]
    Opus,
}

/// Audio format negotiated with a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Encoding on the wire
    #[serde(rename = "format", default)]
    pub encoding: AudioEncoding,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Channel count
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Packet duration in milliseconds
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_sample_rate() -> u32 {
    16000
}
fn default_channels() -> u16 {
    1
}
fn default_frame_duration() -> u32 {
    60
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Opus,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

impl AudioFormat {
    /// Samples per channel in one packet
    pub fn samples_per_packet(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration as usize) / 1000
    }
}

/// Fixed-format unit of PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    channels: u16,
    samples_per_channel: usize,
}

impl AudioFrame {
    /// Create a frame from interleaved samples
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedSampleRate(sample_rate));
        }
        if channels == 0 {
            return Err(AudioError::InvalidFormat("channel count must be non-zero".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(AudioError::InvalidFormat(format!(
                "{} samples cannot be split across {} channels",
                samples.len(),
                channels
            )));
        }

        let samples_per_channel = samples.len() / channels as usize;
        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
            samples_per_channel,
        })
    }

    /// Create a frame of silence
    pub fn silence(sample_rate: u32, channels: u16, duration: Duration) -> Result<Self, AudioError> {
        let per_channel = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::new(vec![0; per_channel * channels as usize], sample_rate, channels)
    }

    /// Decode little-endian 16-bit PCM bytes
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if bytes.len() % 2 != 0 {
            return Err(AudioError::InvalidFormat(format!(
                "odd PCM byte length {}",
                bytes.len()
            )));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self::new(samples, sample_rate, channels)
    }

    /// Concatenate frames of identical format into a new frame
    pub fn combine(frames: &[AudioFrame]) -> Result<Self, AudioError> {
        let Some(first) = frames.first() else {
            return Err(AudioError::InvalidFormat("no frames to combine".into()));
        };

        let total: usize = frames.iter().map(|f| f.samples.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            if frame.sample_rate != first.sample_rate || frame.channels != first.channels {
                return Err(AudioError::FormatMismatch {
                    expected: format!("{}Hz/{}ch", first.sample_rate, first.channels),
                    actual: format!("{}Hz/{}ch", frame.sample_rate, frame.channels),
                });
            }
            samples.extend_from_slice(&frame.samples);
        }

        Self::new(samples, first.sample_rate, first.channels)
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    /// Frame duration derived from sample count and rate
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_channel as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as little-endian 16-bit PCM bytes
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in self.samples.iter() {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Normalized f32 samples, interleaved
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    /// Normalized f32 samples mixed down to mono
    pub fn to_mono_f32(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.to_f32();
        }
        let ch = self.channels as usize;
        self.samples
            .chunks_exact(ch)
            .map(|c| c.iter().map(|&s| s as f32).sum::<f32>() / (ch as f32 * 32768.0))
            .collect()
    }

    /// RMS energy in dBFS
    pub fn rms_db(&self) -> f32 {
        rms_db(&self.to_f32())
    }
}

/// RMS energy of normalized samples in dBFS (-100 for silence)
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -100.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum / samples.len() as f32).sqrt();
    if rms <= 1e-5 {
        -100.0
    } else {
        20.0 * rms.log10()
    }
}

/// Streaming linear-interpolation resampler for mono samples
///
/// Positions are tracked in integer units so that feeding a stream in pieces gives exactly the
/// output of feeding it whole. The last input sample is held until the next call.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source position of the next output sample, scaled by `to_rate`
    next: u64,
    /// Source index of the first sample of the next call
    consumed: u64,
    held: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            next: 0,
            consumed: 0,
            held: 0.0,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Resample the next piece of the stream
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0 {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let from = self.from_rate as u64;
        let to = self.to_rate as u64;
        let first = self.consumed;
        let end = first + input.len() as u64;
        let held = self.held;
        let sample = |index: u64| -> f32 {
            if index < first {
                held
            } else {
                input[(index - first) as usize]
            }
        };

        let mut output = Vec::with_capacity((input.len() as u64 * to / from) as usize + 1);
        loop {
            let index = self.next / to;
            if index + 1 >= end {
                break;
            }
            let frac = (self.next % to) as f32 / to as f32;
            let (s0, s1) = (sample(index), sample(index + 1));
            output.push(s0 + (s1 - s0) * frac);
            self.next += from;
        }

        self.held = input[input.len() - 1];
        self.consumed = end;
        output
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.consumed = 0;
        self.held = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_resampler_ratio() {
        let input = vec![0.25f32; 480];
        let out = LinearResampler::new(48000, 16000).process(&input);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert_eq!(LinearResampler::new(16000, 16000).process(&input).len(), 480);
    }

    #[test]
    fn test_linear_resampler_chunks_match_whole() {
        let input: Vec<f32> = (0..2000).map(|i| (i as f32 * 0.013).sin()).collect();
        let whole = LinearResampler::new(16000, 22050).process(&input);

        let mut resampler = LinearResampler::new(16000, 22050);
        let chunked: Vec<f32> = [1usize, 37, 300, 2, 960, 700]
            .iter()
            .scan(0usize, |at, &len| {
                let piece = &input[*at..*at + len];
                *at += len;
                Some(piece)
            })
            .flat_map(|piece| resampler.process(piece))
            .collect();

        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0; 320], 16000, 1).unwrap();
        assert_eq!(frame.samples_per_channel(), 320);
        assert_eq!(frame.duration(), Duration::from_millis(20));

        let stereo = AudioFrame::new(vec![0; 640], 16000, 2).unwrap();
        assert_eq!(stereo.samples_per_channel(), 320);
        assert_eq!(stereo.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_frame_rejects_bad_layout() {
        assert!(AudioFrame::new(vec![0; 3], 16000, 2).is_err());
        assert!(AudioFrame::new(vec![0; 4], 0, 1).is_err());
        assert!(AudioFrame::from_pcm16_le(&[0, 1, 2], 16000, 1).is_err());
    }

    #[test]
    fn test_combine_copies() {
        let a = AudioFrame::new(vec![1, 2], 8000, 1).unwrap();
        let b = AudioFrame::new(vec![3, 4, 5], 8000, 1).unwrap();
        let combined = AudioFrame::combine(&[a.clone(), b]).unwrap();
        assert_eq!(combined.samples(), &[1, 2, 3, 4, 5]);
        assert_eq!(a.samples(), &[1, 2]);
    }

    #[test]
    fn test_combine_format_mismatch() {
        let a = AudioFrame::new(vec![1, 2], 8000, 1).unwrap();
        let b = AudioFrame::new(vec![3, 4], 16000, 1).unwrap();
        assert!(matches!(
            AudioFrame::combine(&[a, b]),
            Err(AudioError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_pcm_bytes() {
        let frame = AudioFrame::new(vec![1, -2, 300], 16000, 1).unwrap();
        let bytes = frame.to_pcm16_le();
        assert_eq!(bytes.len(), 6);
        let decoded = AudioFrame::from_pcm16_le(&bytes, 16000, 1).unwrap();
        assert_eq!(decoded.samples(), frame.samples());
    }

    #[test]
    fn test_mono_mixdown_and_energy() {
        let frame = AudioFrame::new(vec![16384, 16384, -16384, -16384], 16000, 2).unwrap();
        let mono = frame.to_mono_f32();
        assert_eq!(mono, vec![0.5, -0.5]);
        assert!((frame.rms_db() - (-6.02)).abs() < 0.1);

        let silent = AudioFrame::silence(16000, 1, Duration::from_millis(10)).unwrap();
        assert_eq!(silent.samples().len(), 160);
        assert_eq!(silent.rms_db(), -100.0);
    }

    #[test]
    fn test_format_packet_size() {
        let format = AudioFormat::default();
        assert_eq!(format.samples_per_packet(), 960);
    }
}
