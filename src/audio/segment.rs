//! Fixed-duration framing of streamed response audio
//!
//! Response audio arrives as deltas of whatever size the session felt like
//! sending. The clip encoder downstream wants uniform playback quanta, so
//! the segmenter buffers deltas and emits full frames, holding the remainder
//! until more bytes arrive or [`FrameSegmenter::flush`] ends the response.

use bytes::{Bytes, BytesMut};

/// One playback quantum of PCM16 audio.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// PCM16LE payload
    pub bytes: Bytes,
    /// Sample count carried by `bytes`
    pub samples: usize,
}

/// Accumulates PCM deltas into fixed-size frames.
pub struct FrameSegmenter {
    frame_bytes: usize,
    buf: BytesMut,
}

impl FrameSegmenter {
    /// Frames of `frame_ms` milliseconds at `sample_rate` Hz mono PCM16.
    ///
    /// Degenerate configurations clamp to one sample per frame rather than
    /// dividing by zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        let frame_bytes = (sample_rate as usize * 2 * frame_ms as usize / 1000).max(2);
        Self {
            frame_bytes,
            buf: BytesMut::new(),
        }
    }

    /// Frame size in bytes.
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes currently buffered below one frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and emit every complete frame they enable.
    pub fn feed(&mut self, data: &[u8]) -> Vec<StreamFrame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buf.len() >= self.frame_bytes {
            let bytes = self.buf.split_to(self.frame_bytes).freeze();
            frames.push(StreamFrame {
                samples: bytes.len() / 2,
                bytes,
            });
        }
        frames
    }

    /// Emit the buffered remainder as a final short frame, if any, and reset.
    pub fn flush(&mut self) -> Option<StreamFrame> {
        if self.buf.is_empty() {
            return None;
        }
        let bytes = self.buf.split().freeze();
        Some(StreamFrame {
            samples: bytes.len() / 2,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_nothing_below_one_frame() {
        let mut seg = FrameSegmenter::new(16_000, 20); // 640-byte frames
        assert!(seg.feed(&[0u8; 639]).is_empty());
        assert_eq!(seg.buffered(), 639);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn emits_full_frames_and_keeps_remainder() {
        let mut seg = FrameSegmenter::new(16_000, 20);
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();

        let frames = seg.feed(&data);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.bytes.len() == 640));
        assert!(frames.iter().all(|f| f.samples == 320));
        assert_eq!(seg.buffered(), 1500 - 2 * 640);

        let tail = seg.flush().expect("remainder pending");
        assert_eq!(tail.bytes.len(), 220);
        assert_eq!(tail.samples, 110);
        assert_eq!(seg.buffered(), 0);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn conserves_bytes_for_any_chunking() {
        let data: Vec<u8> = (0..3337u32).map(|i| (i % 256) as u8).collect();
        for chunk in [1usize, 2, 7, 64, 640, 641, 4096] {
            let mut seg = FrameSegmenter::new(16_000, 20);
            let mut collected = Vec::new();
            for piece in data.chunks(chunk) {
                for frame in seg.feed(piece) {
                    collected.extend_from_slice(&frame.bytes);
                }
            }
            if let Some(tail) = seg.flush() {
                collected.extend_from_slice(&tail.bytes);
            }
            assert_eq!(collected, data, "chunk size {chunk} lost or reordered bytes");
        }
    }

    #[test]
    fn flush_on_empty_is_none() {
        let mut seg = FrameSegmenter::new(24_000, 20);
        assert!(seg.flush().is_none());
        seg.feed(&[0u8; 960]);
        // Exactly one frame (24k * 20ms = 480 samples = 960 bytes), nothing left
        assert!(seg.flush().is_none());
    }

    #[test]
    fn degenerate_config_clamps_to_one_sample() {
        let seg = FrameSegmenter::new(16_000, 0);
        assert_eq!(seg.frame_bytes(), 2);
    }
}
