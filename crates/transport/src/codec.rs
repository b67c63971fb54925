//! Audio Codec Support
//!
//! Opus encoding/decoding and resampling between engine audio and the client's wire format.

use std::sync::Arc;

use audiopus::{
    coder::{Decoder, Encoder},
    packet::Packet,
    Application, Channels, MutSignals, SampleRate as OpusSampleRate,
};
use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler as _};
use voice_session_core::{AudioEncoding, AudioFormat, AudioFrame, LinearResampler};

use crate::TransportError;

fn opus_sample_rate(sample_rate: u32) -> Result<OpusSampleRate, TransportError> {
    match sample_rate {
        8000 => Ok(OpusSampleRate::Hz8000),
        12000 => Ok(OpusSampleRate::Hz12000),
        16000 => Ok(OpusSampleRate::Hz16000),
        24000 => Ok(OpusSampleRate::Hz24000),
        48000 => Ok(OpusSampleRate::Hz48000),
        _ => Err(TransportError::UnsupportedFormat(format!(
            "Unsupported sample rate: {}. Use 8000, 12000, 16000, 24000, or 48000",
            sample_rate
        ))),
    }
}

fn opus_channels(channels: u16) -> Result<Channels, TransportError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(TransportError::UnsupportedFormat(format!(
            "Unsupported channel count: {}. Use 1 or 2",
            channels
        ))),
    }
}

fn opus_frame_duration(frame_ms: u32) -> Result<u32, TransportError> {
    match frame_ms {
        10 | 20 | 40 | 60 => Ok(frame_ms),
        _ => Err(TransportError::UnsupportedFormat(format!(
            "Unsupported Opus frame duration: {}ms. Use 10, 20, 40, or 60",
            frame_ms
        ))),
    }
}

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Mutex<Encoder>,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
}

impl OpusEncoder {
    /// Create an encoder producing `frame_ms` packets
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32) -> Result<Self, TransportError> {
        let encoder = Encoder::new(
            opus_sample_rate(sample_rate)?,
            opus_channels(channels)?,
            Application::Voip,
        )
        .map_err(|e| TransportError::Codec(format!("Failed to create Opus encoder: {}", e)))?;

        let frame_size = (sample_rate as usize * opus_frame_duration(frame_ms)? as usize) / 1000;

        Ok(Self {
            encoder: Mutex::new(encoder),
            sample_rate,
            channels,
            frame_size,
        })
    }

    /// Encode one frame of interleaved PCM
    pub fn encode(&self, pcm: &[i16]) -> Result<Vec<u8>, TransportError> {
        let expected = self.frame_size * self.channels as usize;
        if pcm.len() != expected {
            return Err(TransportError::Codec(format!(
                "Invalid frame size: expected {}, got {}",
                expected,
                pcm.len()
            )));
        }

        let mut output = vec![0u8; 4000]; // Max Opus packet size

        let encoder = self.encoder.lock();
        let encoded_len = encoder
            .encode(pcm, &mut output)
            .map_err(|e| TransportError::Codec(format!("Opus encode error: {}", e)))?;

        output.truncate(encoded_len);
        Ok(output)
    }

    /// Samples per channel in one packet
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Mutex<Decoder>,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
}

impl OpusDecoder {
    /// `frame_ms` sizes packet loss concealment output
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32) -> Result<Self, TransportError> {
        let decoder = Decoder::new(opus_sample_rate(sample_rate)?, opus_channels(channels)?)
            .map_err(|e| TransportError::Codec(format!("Failed to create Opus decoder: {}", e)))?;

        let frame_size = (sample_rate as usize * opus_frame_duration(frame_ms)? as usize) / 1000;

        Ok(Self {
            decoder: Mutex::new(decoder),
            sample_rate,
            channels,
            frame_size,
        })
    }

    /// Decode one Opus packet into interleaved PCM
    pub fn decode(&self, opus_data: &[u8]) -> Result<Vec<i16>, TransportError> {
        // Opus packets carry at most 120 ms
        let max_samples = self.sample_rate as usize * 120 / 1000 * self.channels as usize;
        let mut output = vec![0i16; max_samples];

        let packet = Packet::try_from(opus_data)
            .map_err(|e| TransportError::Codec(format!("Invalid Opus packet: {}", e)))?;

        let mut decoder = self.decoder.lock();
        let mut_signals = MutSignals::try_from(&mut output[..])
            .map_err(|e| TransportError::Codec(format!("Signal buffer error: {}", e)))?;

        let decoded_len = decoder
            .decode(Some(packet), mut_signals, false)
            .map_err(|e| TransportError::Codec(format!("Opus decode error: {}", e)))?;

        output.truncate(decoded_len * self.channels as usize);
        Ok(output)
    }

    /// Decode with packet loss concealment for a missing packet
    pub fn decode_plc(&self) -> Result<Vec<i16>, TransportError> {
        let mut output = vec![0i16; self.frame_size * self.channels as usize];

        let mut decoder = self.decoder.lock();
        let mut_signals = MutSignals::try_from(&mut output[..])
            .map_err(|e| TransportError::Codec(format!("Signal buffer error: {}", e)))?;

        let decoded_len = decoder
            .decode(None::<Packet>, mut_signals, false)
            .map_err(|e| TransportError::Codec(format!("Opus PLC error: {}", e)))?;

        output.truncate(decoded_len * self.channels as usize);
        Ok(output)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Input block fed to the FFT resampler
const RESAMPLE_BLOCK: usize = 480;

/// Streaming mono resampler using Rubato, with a linear fallback
///
/// Input is processed in fixed blocks. Samples short of a block are carried into the next call,
/// so filter state and timing stay continuous across chunks; [`finish`](Self::finish) drains
/// the carry at the end of a stream.
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    fft: Option<FftFixedIn<f32>>,
    linear: LinearResampler,
    carry: Vec<f32>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let fft = if from_rate == to_rate {
            None
        } else {
            match FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_BLOCK, 2, 1) {
                Ok(fft) => Some(fft),
                Err(e) => {
                    tracing::warn!(from_rate, to_rate, "Rubato unavailable, resampling linearly: {}", e);
                    None
                }
            }
        };

        Self {
            from_rate,
            to_rate,
            fft,
            linear: LinearResampler::new(from_rate, to_rate),
            carry: Vec::with_capacity(RESAMPLE_BLOCK),
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Leading delay of the output stream, in output samples
    pub fn delay(&self) -> usize {
        self.fft.as_ref().map_or(0, |fft| fft.output_delay())
    }

    /// Resample the next piece of a mono stream
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(fft) = self.fft.as_mut() else {
            return self.linear.process(input);
        };

        self.carry.extend_from_slice(input);
        let mut output = Vec::new();
        let mut position = 0;
        loop {
            let needed = fft.input_frames_next();
            if self.carry.len() - position < needed {
                break;
            }
            match fft.process(&[&self.carry[position..position + needed]], None) {
                Ok(frames) => output.extend_from_slice(&frames[0]),
                Err(e) => tracing::warn!("Rubato resampling failed, dropping block: {}", e),
            }
            position += needed;
        }
        self.carry.drain(..position);
        output
    }

    /// Flush carried input, padded with silence to a whole block
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(fft) = self.fft.as_mut() else {
            return Vec::new();
        };
        if self.carry.is_empty() {
            return Vec::new();
        }

        let output = match fft.process_partial(Some(&[self.carry.as_slice()]), None) {
            Ok(mut frames) => frames.swap_remove(0),
            Err(e) => {
                tracing::warn!("Rubato resampling failed on final block: {}", e);
                Vec::new()
            }
        };
        self.carry.clear();
        output
    }

    /// Drop carried input and filter state
    pub fn reset(&mut self) {
        if let Some(fft) = self.fft.as_mut() {
            fft.reset();
        }
        self.linear.reset();
        self.carry.clear();
    }
}

struct CodecState {
    format: AudioFormat,
    encoder: Option<OpusEncoder>,
    decoder: Option<OpusDecoder>,
    /// Outbound samples not yet filling a whole packet (client rate, interleaved)
    pending: Vec<i16>,
    /// Engine-rate to client-rate conversion, kept for the whole reply
    resampler: Option<Resampler>,
}

impl CodecState {
    fn packet_len(&self) -> usize {
        self.format.samples_per_packet() * self.format.channels as usize
    }

    fn encode_packet(&self, pcm: &[i16]) -> Result<Vec<u8>, TransportError> {
        match &self.encoder {
            Some(encoder) => encoder.encode(pcm),
            None => Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect()),
        }
    }

    /// Convert engine audio to the client's rate/channels and append to `pending`
    fn stage(&mut self, frame: &AudioFrame) {
        let mono = frame.to_mono_f32();
        if frame.sample_rate() == self.format.sample_rate {
            self.drain_resampler();
            self.push_samples(&mono);
            return;
        }

        if self.resampler.as_ref().map(Resampler::from_rate) != Some(frame.sample_rate()) {
            self.drain_resampler();
            self.resampler = Some(Resampler::new(frame.sample_rate(), self.format.sample_rate));
        }
        if let Some(resampler) = self.resampler.as_mut() {
            let resampled = resampler.process(&mono);
            self.push_samples(&resampled);
        }
    }

    /// Stage whatever the resampler still carries
    fn drain_resampler(&mut self) {
        if let Some(mut resampler) = self.resampler.take() {
            let tail = resampler.finish();
            self.push_samples(&tail);
        }
    }

    fn push_samples(&mut self, samples: &[f32]) {
        let channels = self.format.channels.max(1) as usize;
        self.pending.reserve(samples.len() * channels);
        for &sample in samples {
            let pcm = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            for _ in 0..channels {
                self.pending.push(pcm);
            }
        }
    }
}

/// Per-connection codec handle
///
/// Cheap to clone. Encode and decode run on the blocking pool so Opus work never stalls the
/// connection's tasks.
#[derive(Clone)]
pub struct AudioCodec {
    state: Arc<Mutex<CodecState>>,
}

impl AudioCodec {
    /// Build the codec for a negotiated client format
    pub fn new(format: AudioFormat) -> Result<Self, TransportError> {
        let (encoder, decoder) = match format.encoding {
            AudioEncoding::Opus => (
                Some(OpusEncoder::new(format.sample_rate, format.channels, format.frame_duration)?),
                Some(OpusDecoder::new(format.sample_rate, format.channels, format.frame_duration)?),
            ),
            AudioEncoding::Pcm => {
                if format.sample_rate == 0 || format.channels == 0 || format.frame_duration == 0 {
                    return Err(TransportError::UnsupportedFormat(format!(
                        "invalid PCM format {}Hz/{}ch/{}ms",
                        format.sample_rate, format.channels, format.frame_duration
                    )));
                }
                (None, None)
            }
        };

        Ok(Self {
            state: Arc::new(Mutex::new(CodecState {
                format,
                encoder,
                decoder,
                pending: Vec::new(),
                resampler: None,
            })),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.state.lock().format
    }

    /// Decode one inbound packet into an engine frame
    pub async fn decode(&self, payload: Vec<u8>) -> Result<AudioFrame, TransportError> {
        let state = self.state.clone();
        run_blocking(move || {
            let state = state.lock();
            let format = state.format;
            let pcm = match &state.decoder {
                Some(decoder) => decoder.decode(&payload)?,
                None => {
                    return AudioFrame::from_pcm16_le(&payload, format.sample_rate, format.channels)
                        .map_err(|e| TransportError::InvalidFrame(e.to_string()));
                }
            };
            AudioFrame::new(pcm, format.sample_rate, format.channels)
                .map_err(|e| TransportError::Codec(e.to_string()))
        })
        .await
    }

    /// Conceal a lost inbound packet
    pub async fn conceal(&self) -> Result<Option<AudioFrame>, TransportError> {
        let state = self.state.clone();
        run_blocking(move || {
            let state = state.lock();
            let format = state.format;
            match &state.decoder {
                Some(decoder) => {
                    let pcm = decoder.decode_plc()?;
                    AudioFrame::new(pcm, format.sample_rate, format.channels)
                        .map(Some)
                        .map_err(|e| TransportError::Codec(e.to_string()))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Encode engine audio into zero or more whole wire packets
    ///
    /// Samples that do not fill a packet are held until the next call or [`flush`](Self::flush).
    pub async fn encode(&self, frame: AudioFrame) -> Result<Vec<Vec<u8>>, TransportError> {
        let state = self.state.clone();
        run_blocking(move || {
            let mut state = state.lock();
            state.stage(&frame);

            let packet_len = state.packet_len();
            let whole = state.pending.len() / packet_len * packet_len;
            let ready: Vec<i16> = state.pending.drain(..whole).collect();

            ready
                .chunks_exact(packet_len)
                .map(|pcm| state.encode_packet(pcm))
                .collect()
        })
        .await
    }

    /// Encode everything still held, padding the last packet with silence
    pub async fn flush(&self) -> Result<Vec<Vec<u8>>, TransportError> {
        let state = self.state.clone();
        run_blocking(move || {
            let mut state = state.lock();
            state.drain_resampler();
            if state.pending.is_empty() {
                return Ok(Vec::new());
            }
            let packet_len = state.packet_len();
            let mut pcm = std::mem::take(&mut state.pending);
            let padded = pcm.len().div_ceil(packet_len) * packet_len;
            pcm.resize(padded, 0);
            pcm.chunks_exact(packet_len)
                .map(|chunk| state.encode_packet(chunk))
                .collect()
        })
        .await
    }

    /// Drop held outbound samples (reply aborted)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.resampler = None;
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TransportError::Internal(format!("codec task failed: {}", e)))?
}
