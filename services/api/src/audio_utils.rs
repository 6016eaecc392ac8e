//! Audio conversion between the telephony leg and the model leg.
//!
//! Phone audio arrives as base64 G.711 μ-law at 8 kHz. The realtime model takes
//! either the same μ-law stream or 24 kHz PCM16. In PCM16 mode each direction
//! owns a [`StreamResampler`] so partial chunks carry over between frames.

use base64::Engine;
use openai_realtime::types::AudioFormat;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Define standard sample rates for clarity and consistency
pub const TELEPHONY_SAMPLE_RATE: f64 = 8000.0;
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// 20 ms at 8 kHz, the frame size telephony providers send.
const TELEPHONY_CHUNK: usize = 160;
/// 20 ms at 24 kHz.
const MODEL_CHUNK: usize = 480;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("payload is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("resampler failure: {0}")]
    Resample(String),
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, AudioError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )
    .map_err(|e| AudioError::Resample(e.to_string()))
}

/// Decodes one G.711 μ-law byte into a linear 16-bit sample.
pub fn mulaw_to_linear16(mu: u8) -> i16 {
    const BIAS: i16 = 0x84;
    let mu = !mu;
    let sign = (mu & 0x80) != 0;
    let segment = (mu & 0x70) >> 4;
    let mantissa = mu & 0x0F;

    let mut value = ((mantissa as i16) << 3) + BIAS;
    value <<= segment as i16;
    if sign { BIAS - value } else { value - BIAS }
}

/// Encodes a linear 16-bit sample as one G.711 μ-law byte.
pub fn linear16_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const MAX: i32 = 0x7FFF;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > MAX {
        pcm = MAX;
    }
    pcm += BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

pub fn decode_i16(base64_fragment: &str) -> Result<Vec<i16>, AudioError> {
    let pcm16_bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    Ok(pcm16_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn decode_mulaw(base64_fragment: &str) -> Result<Vec<i16>, AudioError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    Ok(bytes.into_iter().map(mulaw_to_linear16).collect())
}

pub fn encode_mulaw(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().map(|&s| linear16_to_mulaw(s)).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// A resampler that accepts arbitrary-length input and buffers the remainder.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    chunk: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: f64, out_rate: f64, chunk: usize) -> Result<Self, AudioError> {
        Ok(Self {
            resampler: create_resampler(in_rate, out_rate, chunk)?,
            chunk,
            pending: Vec::with_capacity(chunk * 2),
        })
    }

    /// Feeds samples in and returns whatever full chunks produced.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk).collect();
            let mut frames = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if let Some(channel) = frames.pop() {
                out.extend(channel);
            }
        }
        Ok(out)
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Forgets buffered input and filter history.
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }
}

/// Which way audio is flowing through a [`Transcoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller audio on its way to the model.
    TelephonyToModel,
    /// Model audio on its way to the caller.
    ModelToTelephony,
}

/// Stateful base64-to-base64 converter for one direction of one call.
pub struct Transcoder {
    direction: Direction,
    resampler: Option<StreamResampler>,
}

impl Transcoder {
    pub fn new(direction: Direction, model_format: &AudioFormat) -> Result<Self, AudioError> {
        let resampler = match (model_format, direction) {
            (AudioFormat::PCM16, Direction::TelephonyToModel) => Some(StreamResampler::new(
                TELEPHONY_SAMPLE_RATE,
                OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
                TELEPHONY_CHUNK,
            )?),
            (AudioFormat::PCM16, Direction::ModelToTelephony) => Some(StreamResampler::new(
                OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
                TELEPHONY_SAMPLE_RATE,
                MODEL_CHUNK,
            )?),
            _ => None,
        };
        Ok(Self {
            direction,
            resampler,
        })
    }

    /// Converts one payload. `Ok(None)` means the audio is buffered until more arrives.
    pub fn convert(&mut self, payload: &str) -> Result<Option<String>, AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            // Pass-through still rejects payloads that are not base64.
            base64::engine::general_purpose::STANDARD.decode(payload)?;
            return Ok(Some(payload.to_string()));
        };

        let samples = match self.direction {
            Direction::TelephonyToModel => decode_mulaw(payload)?,
            Direction::ModelToTelephony => decode_i16(payload)?,
        };
        let resampled = resampler.push(&convert_i16_to_f32(&samples))?;
        if resampled.is_empty() {
            return Ok(None);
        }
        let pcm16 = convert_f32_to_i16(&resampled);
        Ok(Some(match self.direction {
            Direction::TelephonyToModel => encode_i16(&pcm16),
            Direction::ModelToTelephony => encode_mulaw(&pcm16),
        }))
    }

    /// Discards audio still buffered in the resampler.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Playback length in milliseconds of a base64 payload in the given format.
pub fn payload_duration_ms(payload: &str, format: &AudioFormat) -> u64 {
    // base64 expands 3 bytes into 4 characters; each `=` stands for one missing byte
    let padding = payload.bytes().rev().take_while(|&b| b == b'=').count();
    let bytes = (payload.len() / 4 * 3).saturating_sub(padding) as u64;
    match format {
        AudioFormat::PCM16 => bytes / 2 * 1000 / OPENAI_REALTIME_API_PCM16_SAMPLE_RATE as u64,
        // G.711 carries one byte per sample at 8 kHz.
        _ => bytes * 1000 / TELEPHONY_SAMPLE_RATE as u64,
    }
}
