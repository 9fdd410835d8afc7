//! Stream formats, sample codecs and the core error type
//!
//! Everything that crosses the mixer boundary is PCM: interleaved frames in
//! one of the [`SampleFormat`]s. The mixer works in `f32` internally and
//! converts on the way in and out.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the audio core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Stream format is outside the supported range
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Request is not legal in the current state
    #[error("Bad state: {0}")]
    BadState(String),

    /// Request carried an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Timeline arithmetic overflowed
    #[error("Timeline overflow: {0}")]
    Overflow(String),

    /// No mixer or producer exists for the requested conversion
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// Device settings could not be loaded or stored
    #[error("Settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Persistent identifier for an audio device, stable across plug cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const MIN_PCM_CHANNEL_COUNT: u32 = 1;
pub const MAX_PCM_CHANNEL_COUNT: u32 = 8;
pub const MIN_PCM_FRAMES_PER_SECOND: u32 = 1_000;
pub const MAX_PCM_FRAMES_PER_SECOND: u32 = 192_000;

/// Supported PCM sample formats, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Unsigned8,
    Signed16,
    Signed24In32,
    Float,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Unsigned8 => 1,
            SampleFormat::Signed16 => 2,
            SampleFormat::Signed24In32 | SampleFormat::Float => 4,
        }
    }

    /// Decode the sample starting at `bytes[0]` into the nominal [-1.0, 1.0] range
    #[inline]
    pub fn decode(&self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::Unsigned8 => (f32::from(bytes[0]) - 128.0) / 128.0,
            SampleFormat::Signed16 => {
                f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32_768.0
            }
            SampleFormat::Signed24In32 => {
                let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (raw >> 8) as f32 / 8_388_608.0
            }
            SampleFormat::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Encode one sample into `out[..bytes_per_sample]`, clamping to full scale
    #[inline]
    pub fn encode(&self, sample: f32, out: &mut [u8]) {
        match self {
            SampleFormat::Unsigned8 => {
                let v = (sample * 128.0).round().clamp(-128.0, 127.0) as i16 + 128;
                out[0] = v as u8;
            }
            SampleFormat::Signed16 => {
                let v = (sample * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            SampleFormat::Signed24In32 => {
                let v = (f64::from(sample) * 8_388_608.0)
                    .round()
                    .clamp(-8_388_608.0, 8_388_607.0) as i32;
                out[..4].copy_from_slice(&(v << 8).to_le_bytes());
            }
            SampleFormat::Float => {
                out[..4].copy_from_slice(&sample.clamp(-1.0, 1.0).to_le_bytes());
            }
        }
    }
}

/// PCM stream format negotiated between a stream and its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_format: SampleFormat,
    pub channels: u32,
    pub frames_per_second: u32,
}

impl StreamFormat {
    pub fn new(sample_format: SampleFormat, channels: u32, frames_per_second: u32) -> Self {
        Self {
            sample_format,
            channels,
            frames_per_second,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Check channel count and frame rate against the supported PCM range
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PCM_CHANNEL_COUNT..=MAX_PCM_CHANNEL_COUNT).contains(&self.channels) {
            return Err(AudioError::InvalidFormat(format!(
                "channel count {} is not in [{}, {}]",
                self.channels, MIN_PCM_CHANNEL_COUNT, MAX_PCM_CHANNEL_COUNT
            )));
        }
        if !(MIN_PCM_FRAMES_PER_SECOND..=MAX_PCM_FRAMES_PER_SECOND)
            .contains(&self.frames_per_second)
        {
            return Err(AudioError::InvalidFormat(format!(
                "frame rate {} is not in [{}, {}]",
                self.frames_per_second, MIN_PCM_FRAMES_PER_SECOND, MAX_PCM_FRAMES_PER_SECOND
            )));
        }
        Ok(())
    }

    /// Write interleaved `f32` frames into `out` using this format
    pub fn produce_output(&self, source: &[f32], out: &mut [u8]) {
        let bytes_per_sample = self.sample_format.bytes_per_sample();
        for (sample, chunk) in source.iter().zip(out.chunks_exact_mut(bytes_per_sample)) {
            self.sample_format.encode(*sample, chunk);
        }
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_format: SampleFormat::Signed16,
            channels: 1,
            frames_per_second: 8_000,
        }
    }
}

pub const PCM_ENCODING: &str = "pcm";

/// Stream type reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamType {
    pub encoding: String,
    pub format: StreamFormat,
}

impl AudioStreamType {
    pub fn pcm(format: StreamFormat) -> Self {
        Self {
            encoding: PCM_ENCODING.to_string(),
            format,
        }
    }
}
