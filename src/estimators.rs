//! Numeric models for round trip time and send window. Both are updated from acks (success)
//!  and retransmissions (failure).
//!
//! There is no explicit exponential backoff for retries: failures push the RTT estimate towards
//!  its maximum, and since the retry delay is derived from the RTT estimate, repeated failures
//!  stretch retry intervals.

use std::cmp::{max, min};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    current: Duration,
    max: Duration,
}

impl RttEstimator {
    /// weight of a new sample is 1/SMOOTHING
    const SMOOTHING: i128 = 8;
    const MIN_RTT: Duration = Duration::from_millis(1);

    pub fn new(initial: Duration, max: Duration) -> RttEstimator {
        RttEstimator {
            current: initial,
            max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_sample(&mut self, sample: Duration) {
        let sample = min(sample, self.max);
        let current = self.current.as_nanos() as i128;
        let updated = current + (sample.as_nanos() as i128 - current) / Self::SMOOTHING;
        self.current = max(Duration::from_nanos(updated as u64), Self::MIN_RTT);
        trace!("RTT sample {:?} -> RTT estimate {:?}", sample, self.current);
    }

    /// a sample representing a failed transmission
    pub fn on_failure(&mut self) {
        self.on_sample(self.max);
    }

    pub fn retry_delay(&self, delayed_ack_allowance: Duration) -> Duration {
        2 * self.current + delayed_ack_allowance
    }
}

/// AIMD window of reliable packets in flight: the window grows by one packet per window of
///  acknowledged packets, and it is halved on a retransmission.
#[derive(Debug, Clone)]
pub struct WindowEstimator {
    window: u32,
    max_window: u32,
    acks_since_increase: u32,
}

impl WindowEstimator {
    pub fn new(initial: u32, max_window: u32) -> WindowEstimator {
        WindowEstimator {
            window: initial,
            max_window,
            acks_since_increase: 0,
        }
    }

    pub fn current(&self) -> u32 {
        self.window
    }

    pub fn on_ack(&mut self) {
        self.acks_since_increase += 1;
        if self.acks_since_increase >= self.window {
            self.acks_since_increase = 0;
            self.window = min(self.window + 1, self.max_window);
        }
    }

    pub fn on_failure(&mut self) {
        self.acks_since_increase = 0;
        self.window = max(self.window / 2, 1);
        trace!("window reduced to {}", self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::same(100, 100, 100)]
    #[case::lower(100, 20, 90)]
    #[case::higher(100, 180, 110)]
    #[case::capped_at_max(100, 10_000, 150)]
    fn test_rtt_sample(#[case] initial_millis: u64, #[case] sample_millis: u64, #[case] expected_millis: u64) {
        let mut rtt = RttEstimator::new(Duration::from_millis(initial_millis), Duration::from_millis(500));
        rtt.on_sample(Duration::from_millis(sample_millis));
        assert_eq!(rtt.current(), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_rtt_failures_converge_to_max() {
        let mut rtt = RttEstimator::new(Duration::from_millis(10), Duration::from_millis(1000));
        let mut previous = rtt.current();
        for _ in 0..100 {
            rtt.on_failure();
            assert!(rtt.current() >= previous);
            assert!(rtt.current() <= Duration::from_millis(1000));
            previous = rtt.current();
        }
        assert!(rtt.current() > Duration::from_millis(990));
    }

    #[test]
    fn test_rtt_has_lower_bound() {
        let mut rtt = RttEstimator::new(Duration::from_millis(1), Duration::from_millis(1000));
        for _ in 0..20 {
            rtt.on_sample(Duration::ZERO);
        }
        assert_eq!(rtt.current(), Duration::from_millis(1));
    }

    #[test]
    fn test_retry_delay() {
        let rtt = RttEstimator::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(rtt.retry_delay(Duration::from_millis(20)), Duration::from_millis(220));
    }

    #[test]
    fn test_window_additive_increase() {
        let mut window = WindowEstimator::new(2, 4);
        window.on_ack();
        assert_eq!(window.current(), 2);
        window.on_ack();
        assert_eq!(window.current(), 3);
        for _ in 0..3 {
            window.on_ack();
        }
        assert_eq!(window.current(), 4);
        for _ in 0..20 {
            window.on_ack();
        }
        assert_eq!(window.current(), 4);
    }

    #[rstest]
    #[case::halve(8, 4)]
    #[case::odd(5, 2)]
    #[case::lower_bound(1, 1)]
    fn test_window_multiplicative_decrease(#[case] initial: u32, #[case] expected: u32) {
        let mut window = WindowEstimator::new(initial, 100);
        window.on_failure();
        assert_eq!(window.current(), expected);
    }
}
