//! Streaming PCM16 sample-rate conversion
//!
//! [`RateConverter`] is fed arbitrary-sized byte chunks and produces output
//! that is byte-identical no matter where the chunk boundaries fall. Two
//! details make that hold:
//!
//! - The source read position is an exact rational (`whole + num/den`, with
//!   `den` the reduced output rate), never a floating accumulator, so the
//!   interpolation points are the same whether the input arrives in one call
//!   or one byte at a time.
//! - When an interpolation needs a look-ahead sample that has not arrived
//!   yet, the converter buffers and waits instead of approximating.
//!
//! Interpolated values are computed in `f64`, rounded half away from zero
//! (`f64::round`) and saturated to the i16 range. That rounding rule is a
//! contract: fixtures depend on bit-exact output.

use crate::{Error, Result};

/// Interpolation used for fractional source positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Two-point linear interpolation
    Linear,
    /// Four-point Catmull-Rom, falling back to linear at the stream start
    /// where no preceding sample exists
    CatmullRom,
}

/// Stateful streaming resampler for mono PCM16.
pub struct RateConverter {
    /// Source advance per output sample: `step_num / den`, already reduced
    step_num: u64,
    den: u64,
    interpolation: Interpolation,
    /// Unconsumed source samples; `buf[pos_whole]` is the left bracket of
    /// the current output position
    buf: Vec<i16>,
    pos_whole: usize,
    /// Fractional position numerator, `0 <= pos_num < den`
    pos_num: u64,
    /// Dangling low byte of a split sample from the previous call
    pending_byte: Option<u8>,
}

impl RateConverter {
    /// Create a converter between two arbitrary rates.
    ///
    /// # Errors
    ///
    /// Returns an error if either rate is zero.
    pub fn new(in_rate: u32, out_rate: u32, interpolation: Interpolation) -> Result<Self> {
        if in_rate == 0 || out_rate == 0 {
            return Err(Error::Audio("sample rates must be non-zero".to_string()));
        }
        let g = gcd(u64::from(in_rate), u64::from(out_rate));
        Ok(Self::from_ratio(
            u64::from(in_rate) / g,
            u64::from(out_rate) / g,
            interpolation,
        ))
    }

    /// 16 kHz -> 24 kHz, linear. The microphone path.
    #[must_use]
    pub fn upsampler() -> Self {
        Self::from_ratio(2, 3, Interpolation::Linear)
    }

    /// 24 kHz -> 16 kHz. The response playback path.
    #[must_use]
    pub fn downsampler(interpolation: Interpolation) -> Self {
        Self::from_ratio(3, 2, interpolation)
    }

    /// `step_num`/`den` must already be reduced and non-zero.
    const fn from_ratio(step_num: u64, den: u64, interpolation: Interpolation) -> Self {
        Self {
            step_num,
            den,
            interpolation,
            buf: Vec::new(),
            pos_whole: 0,
            pos_num: 0,
            pending_byte: None,
        }
    }

    /// Feed PCM16LE bytes, receive converted PCM16LE bytes.
    ///
    /// Any length is accepted, including zero and odd; a split sample is held
    /// until its second byte arrives.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.ingest(bytes);
        let samples = self.produce(false);
        self.compact();
        super::samples_to_bytes(&samples)
    }

    /// Drain whatever the retained tail can still produce and reset.
    ///
    /// Positions that fall strictly past the final sample yield nothing; a
    /// final fractional position between the last two samples is emitted with
    /// linear interpolation even in Catmull-Rom mode (stream-edge fallback).
    pub fn flush(&mut self) -> Vec<u8> {
        let samples = self.produce(true);
        self.reset();
        super::samples_to_bytes(&samples)
    }

    /// Discard all buffered state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos_whole = 0;
        self.pos_num = 0;
        self.pending_byte = None;
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        if let Some(low) = self.pending_byte.take() {
            if let Some((&high, tail)) = rest.split_first() {
                self.buf.push(i16::from_le_bytes([low, high]));
                rest = tail;
            } else {
                self.pending_byte = Some(low);
                return;
            }
        }
        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            self.buf.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [low] = pairs.remainder() {
            self.pending_byte = Some(*low);
        }
    }

    /// Emit every output sample the buffered input can support.
    ///
    /// `at_end` relaxes the look-ahead requirements to what a finite stream
    /// edge can satisfy.
    fn produce(&mut self, at_end: bool) -> Vec<i16> {
        let mut out = Vec::new();
        loop {
            let i = self.pos_whole;
            let len = self.buf.len();

            if self.pos_num == 0 {
                // Exactly on a source sample: no interpolation, no look-ahead
                if i >= len {
                    break;
                }
                out.push(self.buf[i]);
            } else if self.use_cubic(i, len) {
                let t = self.frac();
                let v = catmull_rom(
                    f64::from(self.buf[i - 1]),
                    f64::from(self.buf[i]),
                    f64::from(self.buf[i + 1]),
                    f64::from(self.buf[i + 2]),
                    t,
                );
                out.push(quantize(v));
            } else if i + 1 < len {
                // Waiting for cubic look-ahead must not depend on chunk
                // boundaries: only fall back to linear where the stream
                // itself cannot supply the neighbors
                if self.interpolation == Interpolation::CatmullRom
                    && i >= 1
                    && !at_end
                {
                    break;
                }
                let t = self.frac();
                let s0 = f64::from(self.buf[i]);
                let s1 = f64::from(self.buf[i + 1]);
                out.push(quantize(s0 + (s1 - s0) * t));
            } else {
                break;
            }

            self.advance();
        }
        out
    }

    fn use_cubic(&self, i: usize, len: usize) -> bool {
        self.interpolation == Interpolation::CatmullRom && i >= 1 && i + 2 < len
    }

    #[allow(clippy::cast_precision_loss)]
    fn frac(&self) -> f64 {
        self.pos_num as f64 / self.den as f64
    }

    fn advance(&mut self) {
        self.pos_num += self.step_num;
        self.pos_whole += usize::try_from(self.pos_num / self.den).unwrap_or(usize::MAX);
        self.pos_num %= self.den;
    }

    /// Drop samples the cursor can never revisit. Catmull-Rom keeps one
    /// sample of history behind the cursor.
    fn compact(&mut self) {
        let history = usize::from(self.interpolation == Interpolation::CatmullRom);
        let keep_from = self.pos_whole.saturating_sub(history);
        if keep_from > 0 {
            let keep_from = keep_from.min(self.buf.len());
            self.buf.drain(..keep_from);
            self.pos_whole -= keep_from;
        }
    }
}

/// Round half away from zero, saturate to i16.
#[allow(clippy::cast_possible_truncation)]
fn quantize(v: f64) -> i16 {
    v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (3.0 * (p1 - p2) + p3 - p0) * t3)
}

const fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{bytes_to_samples, samples_to_bytes};

    fn one_shot(conv: &mut RateConverter, input: &[i16]) -> Vec<i16> {
        let mut out = conv.push(&samples_to_bytes(input));
        out.extend(conv.flush());
        bytes_to_samples(&out)
    }

    // -- rounding contract ----------------------------------------------------

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(quantize(0.5), 1);
        assert_eq!(quantize(-0.5), -1);
        assert_eq!(quantize(1.5), 2);
        assert_eq!(quantize(-1.5), -2);
        assert_eq!(quantize(2.4), 2);
        assert_eq!(quantize(-2.4), -2);
    }

    #[test]
    fn quantize_saturates() {
        assert_eq!(quantize(40000.0), i16::MAX);
        assert_eq!(quantize(-40000.0), i16::MIN);
    }

    // -- basic conversion -----------------------------------------------------

    #[test]
    fn upsample_interpolates_between_samples() {
        // Positions 0, 2/3, 4/3, 2 over input [0, 300, 600]:
        // 0, 200, 400, 600 after linear interpolation
        let mut conv = RateConverter::upsampler();
        let out = one_shot(&mut conv, &[0, 300, 600]);
        assert_eq!(out, vec![0, 200, 400, 600]);
    }

    #[test]
    fn upsample_rounds_half_away_from_zero() {
        // Position 2/3 between 0 and 1 is 0.666.. -> 1; between 0 and -1 -> -1
        let mut conv = RateConverter::upsampler();
        let out = one_shot(&mut conv, &[0, 1]);
        assert_eq!(out, vec![0, 1]);

        let mut conv = RateConverter::upsampler();
        let out = one_shot(&mut conv, &[0, -1]);
        assert_eq!(out, vec![0, -1]);
    }

    #[test]
    fn downsample_linear_hits_midpoints() {
        // Positions 0, 3/2, 3 over input [0, 100, 200, 300]:
        // 0, 150, 300
        let mut conv = RateConverter::downsampler(Interpolation::Linear);
        let out = one_shot(&mut conv, &[0, 100, 200, 300]);
        assert_eq!(out, vec![0, 150, 300]);
    }

    #[test]
    fn cubic_passes_through_on_sample_positions() {
        let input = [0i16, 1000, -1000, 500, -500, 250];
        let mut cubic = RateConverter::downsampler(Interpolation::CatmullRom);
        let mut linear = RateConverter::downsampler(Interpolation::Linear);
        let c = one_shot(&mut cubic, &input);
        let l = one_shot(&mut linear, &input);
        assert_eq!(c.len(), l.len());
        // Whole positions (every other output for a 3/2 step) are identical
        for (idx, (a, b)) in c.iter().zip(&l).enumerate() {
            if idx % 2 == 0 {
                assert_eq!(a, b, "whole position {idx} diverged");
            }
        }
    }

    #[test]
    fn empty_and_tiny_pushes_produce_nothing() {
        let mut conv = RateConverter::upsampler();
        assert!(conv.push(&[]).is_empty());
        assert!(conv.push(&[0x01]).is_empty());
        // Second byte completes one sample; one output on the whole position
        let out = conv.push(&[0x00]);
        assert_eq!(bytes_to_samples(&out), vec![1]);
    }

    #[test]
    fn split_sample_across_pushes_matches_one_shot() {
        let input = samples_to_bytes(&[1000, 2000, 3000, 4000]);

        let mut whole = RateConverter::upsampler();
        let mut expect = whole.push(&input);
        expect.extend(whole.flush());

        let mut split = RateConverter::upsampler();
        let mut got = Vec::new();
        for b in &input {
            got.extend(split.push(std::slice::from_ref(b)));
        }
        got.extend(split.flush());

        assert_eq!(got, expect);
    }

    // -- chunking invariance --------------------------------------------------

    fn ramp(len: usize) -> Vec<i16> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| ((i * 37) % 4001) as i16 - 2000).collect()
    }

    #[test]
    fn chunking_invariance_linear_up() {
        chunking_invariance(RateConverter::upsampler, &ramp(480));
    }

    #[test]
    fn chunking_invariance_linear_down() {
        chunking_invariance(
            || RateConverter::downsampler(Interpolation::Linear),
            &ramp(480),
        );
    }

    #[test]
    fn chunking_invariance_cubic_down() {
        chunking_invariance(
            || RateConverter::downsampler(Interpolation::CatmullRom),
            &ramp(480),
        );
    }

    fn chunking_invariance(mk: impl Fn() -> RateConverter, input: &[i16]) {
        let bytes = samples_to_bytes(input);

        let mut whole = mk();
        let mut expect = whole.push(&bytes);
        expect.extend(whole.flush());

        // A few fixed chunkings plus a deterministic pseudo-random one
        let splits: &[&[usize]] = &[&[1], &[2], &[3], &[7], &[640], &[1, 2, 3, 5, 8, 13]];
        for sizes in splits {
            let mut conv = mk();
            let mut got = Vec::new();
            let mut cursor = 0;
            let mut k = 0;
            while cursor < bytes.len() {
                let take = sizes[k % sizes.len()].min(bytes.len() - cursor);
                got.extend(conv.push(&bytes[cursor..cursor + take]));
                cursor += take;
                k += 1;
            }
            got.extend(conv.flush());
            assert_eq!(got, expect, "chunking {sizes:?} diverged");
        }
    }

    // -- flush / reset --------------------------------------------------------

    #[test]
    fn flush_resets_state() {
        let mut conv = RateConverter::upsampler();
        conv.push(&samples_to_bytes(&[100, 200, 300]));
        conv.flush();

        // After flush the converter behaves like a fresh one
        let mut fresh = RateConverter::upsampler();
        let input = samples_to_bytes(&[5, 10, 15]);
        assert_eq!(conv.push(&input), fresh.push(&input));
    }

    #[test]
    fn new_rejects_zero_rates() {
        assert!(RateConverter::new(0, 24_000, Interpolation::Linear).is_err());
        assert!(RateConverter::new(16_000, 0, Interpolation::Linear).is_err());
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut conv = RateConverter::new(16_000, 16_000, Interpolation::Linear)
            .expect("valid rates");
        let input = [0i16, -5, 31000, -31000];
        assert_eq!(one_shot(&mut conv, &input), input.to_vec());
    }
}
