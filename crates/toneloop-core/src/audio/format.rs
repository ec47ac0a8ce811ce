//! PCM sample formats and magnitude conversion
//!
//! Converts raw PCM sample cells (8/16/24/32-bit) to and from normalized
//! floating-point magnitude in [-1.0, 1.0]. Unsigned formats use zero-offset
//! encoding; the 24-bit format is hand-packed as three little-endian bytes
//! since no native 24-bit integer exists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported PCM sample encodings (all multi-byte formats little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Unsigned 8-bit
    U8,
    /// Signed 16-bit little-endian
    S16Le,
    /// Signed 24-bit little-endian, packed in 3 bytes
    S24Le,
    /// Signed 32-bit little-endian
    S32Le,
}

impl SampleFormat {
    /// Bytes occupied by one sample of this format
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le => 4,
        }
    }

    /// Whether samples are signed integers
    pub fn is_signed(self) -> bool {
        !matches!(self, SampleFormat::U8)
    }

    /// Bytes per interleaved frame: channels x sample width
    pub fn frame_bytes(self, channels: usize) -> usize {
        self.bytes_per_sample() * channels
    }

    /// Short name as accepted on the command line
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16Le => "s16",
            SampleFormat::S24Le => "s24",
            SampleFormat::S32Le => "s32",
        }
    }

    /// Parse a command-line format name
    pub fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "u8" => Some(SampleFormat::U8),
            "s16" => Some(SampleFormat::S16Le),
            "s24" => Some(SampleFormat::S24Le),
            "s32" => Some(SampleFormat::S32Le),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode one normalized magnitude into PCM bytes.
///
/// `out` must be exactly `format.bytes_per_sample()` long. Magnitude is
/// clamped to [-1.0, 1.0]; unsigned formats are mapped to [0, 1] before
/// scaling to the format maximum.
pub fn encode_magnitude(format: SampleFormat, magnitude: f64, out: &mut [u8]) {
    assert_eq!(
        out.len(),
        format.bytes_per_sample(),
        "output slice does not match sample width"
    );
    let m = magnitude.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => {
            out[0] = ((m + 1.0) / 2.0 * f64::from(u8::MAX)).round() as u8;
        }
        SampleFormat::S16Le => {
            let v = (m * f64::from(i16::MAX)) as i16;
            out.copy_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S24Le => {
            let v = (m * f64::from((1 << 23) - 1)) as i32;
            out.copy_from_slice(&v.to_le_bytes()[..3]);
        }
        SampleFormat::S32Le => {
            let v = (m * f64::from(i32::MAX)) as i32;
            out.copy_from_slice(&v.to_le_bytes());
        }
    }
}

/// Decode one PCM sample into normalized magnitude.
///
/// `bytes` must be exactly `format.bytes_per_sample()` long.
pub fn decode_sample(format: SampleFormat, bytes: &[u8]) -> f64 {
    assert_eq!(
        bytes.len(),
        format.bytes_per_sample(),
        "input slice does not match sample width"
    );
    match format {
        SampleFormat::U8 => f64::from(bytes[0]) / f64::from(u8::MAX) * 2.0 - 1.0,
        SampleFormat::S16Le => {
            f64::from(i16::from_le_bytes([bytes[0], bytes[1]])) / f64::from(i16::MAX)
        }
        SampleFormat::S24Le => {
            // Reassemble 3 little-endian bytes, then sign-extend from bit 23.
            let raw =
                u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
            let v = ((raw << 8) as i32) >> 8;
            f64::from(v) / f64::from(1 << 23)
        }
        SampleFormat::S32Le => {
            f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                / f64::from(i32::MAX)
        }
    }
}

/// Decode an interleaved PCM cell into a mono magnitude signal.
///
/// Each frame becomes the arithmetic mean of its channels' magnitudes.
/// The cell length must be a whole number of frames; a mismatch is a
/// programming error, not a runtime condition.
pub fn cell_to_magnitudes(format: SampleFormat, channels: usize, cell: &[u8]) -> Vec<f64> {
    let stride = format.frame_bytes(channels);
    assert!(channels > 0, "cell must have at least one channel");
    assert!(
        cell.len() % stride == 0,
        "cell length {} is not a whole number of {}-byte frames",
        cell.len(),
        stride
    );

    let width = format.bytes_per_sample();
    let num_frames = cell.len() / stride;
    let mut out = Vec::with_capacity(num_frames);
    for frame in cell.chunks_exact(stride) {
        let mut sum = 0.0;
        for sample in frame.chunks_exact(width) {
            sum += decode_sample(format, sample);
        }
        out.push(sum / channels as f64);
    }
    out
}
