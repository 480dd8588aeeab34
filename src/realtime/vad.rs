//! Local voice-activity detection
//!
//! A deliberately small energy detector: RMS per chunk against a fixed
//! threshold, with a hang time before silence is declared. Used when server
//! turn detection is disabled, and as a belt-and-braces turn closer when the
//! server is slow to decide.

use std::time::{Duration, Instant};

/// Emits one silence signal per sustained-silence episode.
///
/// The detector arms on the first above-threshold chunk and fires once the
/// energy has stayed below threshold for the hang duration. After firing it
/// disarms, so an arbitrarily long silence produces exactly one signal;
/// the next burst of speech re-arms it.
#[derive(Debug)]
pub struct SilenceDetector {
    threshold: f32,
    hang: Duration,
    last_loud: Instant,
    armed: bool,
}

impl SilenceDetector {
    #[must_use]
    pub fn new(threshold: f32, hang: Duration) -> Self {
        Self {
            threshold,
            hang,
            last_loud: Instant::now(),
            armed: false,
        }
    }

    /// Feed one chunk of samples. Returns `true` when sustained silence is
    /// detected; at most once until speech is heard again.
    pub fn push(&mut self, samples: &[i16], now: Instant) -> bool {
        if rms(samples) >= self.threshold {
            self.last_loud = now;
            self.armed = true;
            return false;
        }
        if self.armed && now.duration_since(self.last_loud) >= self.hang {
            self.armed = false;
            return true;
        }
        false
    }

    /// Forget everything heard so far. Leading silence after a reset never
    /// fires.
    pub fn reset(&mut self) {
        self.armed = false;
        self.last_loud = Instant::now();
    }
}

/// Root-mean-square energy as a fraction of full scale.
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let mean = (sum_squares / samples.len() as f64).sqrt() as f32;
    mean / f32::from(i16::MAX)
}
