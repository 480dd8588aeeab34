//! PCM audio plumbing between the satellite and the realtime session
//!
//! Everything here operates on 16-bit little-endian mono PCM, the format both
//! wire protocols speak. The satellite side runs at 16 kHz, the realtime
//! session at 24 kHz; [`resample::RateConverter`] moves between the two and
//! [`segment::FrameSegmenter`] chops response audio into fixed playback
//! quanta for the clip encoder.

pub mod resample;
pub mod segment;

pub use resample::{Interpolation, RateConverter};
pub use segment::{FrameSegmenter, StreamFrame};

/// Sample rate the satellite captures and plays at
pub const DEVICE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate the realtime session expects and produces
pub const AGENT_SAMPLE_RATE: u32 = 24_000;

/// Convert little-endian PCM16 bytes to samples.
///
/// A trailing odd byte is ignored; callers that need byte-exact accounting
/// (the resampler) stitch partial samples themselves.
#[must_use]
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert samples to little-endian PCM16 bytes.
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
