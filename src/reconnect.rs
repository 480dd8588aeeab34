//! Reconnection policy shared by both protocol clients
//!
//! Both the satellite TCP client and the realtime WebSocket client recover
//! from transport failures the same way: exponential backoff with a capped
//! maximum delay and 0-25% jitter, retried indefinitely. The attempt counter
//! resets after every successful connect, so the first delay after a fresh
//! failure is always `base_delay`.

use std::time::Duration;

use rand::Rng;

/// Connection lifecycle shared by both protocol clients.
///
/// Exactly one reconnection attempt is in flight at a time: the client task
/// moves `Reconnecting -> Connecting` itself, so a second concurrent attempt
/// is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet
    Idle,
    /// Dialing / handshaking
    Connecting,
    /// Handshake complete, traffic flowing
    Connected,
    /// Waiting out a backoff delay before the next connect
    Reconnecting,
    /// Deliberately shut down; no further attempts
    Closed,
}

impl ConnectionState {
    /// True while the client still intends to (re)establish a connection.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Backoff policy for reconnect attempts
///
/// There is no retry cap: transient connectivity loss is never surfaced as a
/// hard failure, the delay just stops growing at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Compute the delay before reconnect attempt `attempt` (0-based).
///
/// Follows `min(base_delay * 2^attempt, max_delay)` plus 0-25% jitter, the
/// total capped at `max_delay`. Jitter spreads out reconnect storms when
/// several bridges lose the same upstream at once.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_fraction = rand::thread_rng().gen_range(0.0..0.25);
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- ConnectionState ------------------------------------------------------

    #[test]
    fn closed_is_not_active() {
        assert!(ConnectionState::Idle.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Closed.is_active());
    }

    // -- delay_for_attempt ----------------------------------------------------

    #[test]
    fn exponential_growth() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };

        let d0 = delay_for_attempt(&policy, 0);
        let d1 = delay_for_attempt(&policy, 1);
        let d2 = delay_for_attempt(&policy, 2);

        // Each attempt's base doubles; jitter adds at most 25%, so the lower
        // bound of each attempt is its base delay
        assert!(d0 >= Duration::from_millis(100), "attempt 0: {d0:?}");
        assert!(d1 >= Duration::from_millis(200), "attempt 1: {d1:?}");
        assert!(d2 >= Duration::from_millis(400), "attempt 2: {d2:?}");
    }

    #[test]
    fn monotonic_up_to_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        };

        // Compare jitter-free lower bounds: each attempt's minimum delay is
        // non-decreasing until the cap absorbs it
        let mut prev = Duration::ZERO;
        for attempt in 0..12 {
            let floor = policy
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(policy.max_delay);
            assert!(floor >= prev, "attempt {attempt}: {floor:?} < {prev:?}");
            prev = floor;
        }
        assert_eq!(prev, policy.max_delay);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
        };

        // 10s * 2^3 = 80s, capped at 15s even with jitter
        let d = delay_for_attempt(&policy, 3);
        assert!(d <= policy.max_delay, "delay {d:?} exceeds max");
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        };

        for _ in 0..50 {
            let d = delay_for_attempt(&policy, 0);
            assert!(d >= Duration::from_millis(1000), "below base: {d:?}");
            assert!(d <= Duration::from_millis(1250), "above 125%: {d:?}");
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        let d = delay_for_attempt(&policy, u32::MAX);
        assert_eq!(d, policy.max_delay);
    }

    // -- Default policy -------------------------------------------------------

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }
}
