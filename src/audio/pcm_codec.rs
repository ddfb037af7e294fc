//! 16-bit PCM codec for the live channel.
//!
//! - Encoder: f32 frame → i16 little-endian → base64 `WireChunk`
//! - Decoder: base64 `WireChunk` → i16 little-endian → f32 `DecodedBuffer`

use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

use crate::error::SessionError;

/// Sample rate of the microphone → remote stream.
pub const OUTBOUND_SAMPLE_RATE: u32 = 16000;
/// Sample rate of the remote → speaker stream.
pub const INBOUND_SAMPLE_RATE: u32 = 24000;
/// Samples per captured frame.
pub const FRAME_SIZE: usize = 4096;

// Server payloads are not guaranteed to be padded.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

// ======================== Data types ========================

/// One block of normalized mono samples delivered by the capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Text-safe PCM payload exchanged over the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    data: String,
    mime_type: String,
    sample_rate: u32,
}

impl WireChunk {
    /// Build a chunk carrying base64 PCM16 at `sample_rate`.
    pub fn pcm16(data: String, sample_rate: u32) -> Self {
        Self {
            data,
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            sample_rate,
        }
    }

    /// Build a chunk from a received blob. The rate is taken from the
    /// mimetype when it declares one, else `fallback_rate`.
    pub fn from_blob(mime_type: Option<&str>, data: String, fallback_rate: u32) -> Self {
        let mime_type = mime_type.unwrap_or("audio/pcm").to_string();
        let sample_rate = parse_rate(&mime_type).unwrap_or(fallback_rate);
        Self {
            data,
            mime_type,
            sample_rate,
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

/// Decoded mono samples ready to be scheduled on the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Linear-interpolated copy at `rate`. Returns `self` unchanged when the
    /// rates already match.
    pub fn resampled(self, rate: u32) -> DecodedBuffer {
        if rate == self.sample_rate || self.sample_rate == 0 || rate == 0 {
            return self;
        }
        let input = &self.samples;
        let out_len = (input.len() as u64 * rate as u64 / self.sample_rate as u64) as usize;
        let step = self.sample_rate as f64 / rate as f64;

        let samples = (0..out_len)
            .map(|i| {
                let pos = i as f64 * step;
                let idx = pos as usize;
                let frac = (pos - idx as f64) as f32;
                let a = input.get(idx).copied().unwrap_or(0.0);
                let b = input.get(idx + 1).copied().unwrap_or(a);
                a + (b - a) * frac
            })
            .collect();

        DecodedBuffer::new(samples, rate)
    }
}

// ======================== Encoder ========================

pub struct PcmEncoder {
    frame_size: usize,
    sample_rate: u32,
}

impl Default for PcmEncoder {
    fn default() -> Self {
        Self::new(FRAME_SIZE, OUTBOUND_SAMPLE_RATE)
    }
}

impl PcmEncoder {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            sample_rate,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode one frame. Frame length must equal `frame_size()`.
    pub fn encode(&self, frame: &AudioFrame) -> WireChunk {
        debug_assert_eq!(
            frame.len(),
            self.frame_size,
            "capture delivered a frame of the wrong length"
        );

        let mut bytes = Vec::with_capacity(frame.len() * 2);
        for &sample in frame.samples() {
            bytes.extend_from_slice(&to_i16(sample).to_le_bytes());
        }
        WireChunk::pcm16(STANDARD.encode(bytes), self.sample_rate)
    }
}

/// Scale to i16, truncating toward zero. `as` saturates, so out-of-range
/// input clamps instead of wrapping and NaN maps to 0.
fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0) as i16
}

// ======================== Decoder ========================

#[derive(Default)]
pub struct PcmDecoder;

impl PcmDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a chunk, reporting payloads that are not base64.
    ///
    /// A trailing odd byte is dropped rather than treated as an error.
    pub fn try_decode(&self, chunk: &WireChunk) -> Result<DecodedBuffer, SessionError> {
        let bytes = LENIENT
            .decode(chunk.data().trim())
            .map_err(|e| SessionError::DecodeAnomaly(e.to_string()))?;

        if bytes.len() % 2 != 0 {
            log::debug!(
                "Inbound chunk has odd length {}, dropping trailing byte",
                bytes.len()
            );
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();

        Ok(DecodedBuffer::new(samples, chunk.sample_rate()))
    }

    /// Decode a chunk. Malformed input gives a short or empty buffer;
    /// callers skip empty buffers.
    pub fn decode(&self, chunk: &WireChunk) -> DecodedBuffer {
        match self.try_decode(chunk) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("{}, skipping", e);
                DecodedBuffer::new(Vec::new(), chunk.sample_rate())
            }
        }
    }
}
