// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, for stream reconnects.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Fraction of the delay randomized in each direction.
    const JITTER: f64 = 0.2;

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Standard policy for bus/RPC reconnects: 250 ms doubling to 30 s.
    pub fn standard() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(20)).min(self.cap);
        if self.attempt < u32::MAX {
            self.attempt += 1;
        }
        let jitter = rand::thread_rng().gen_range(-Self::JITTER..=Self::JITTER);
        exp.mul_f64(1.0 + jitter).min(self.cap.mul_f64(1.0 + Self::JITTER))
    }
}

#[cfg(test)]
mod tests {
    use crate::backoff::Backoff;
    use std::time::Duration;

    #[test]
    fn grows_to_cap_with_jitter_bounds() {
        let mut backoff = Backoff::standard();
        let mut previous_max = Duration::ZERO;
        for attempt in 0..12 {
            let delay = backoff.next_delay();
            let nominal = Duration::from_millis(250)
                .saturating_mul(1 << attempt)
                .min(Duration::from_secs(30));
            assert!(delay >= nominal.mul_f64(0.8), "attempt {}", attempt);
            assert!(delay <= nominal.mul_f64(1.2), "attempt {}", attempt);
            previous_max = previous_max.max(delay);
        }
        assert!(previous_max <= Duration::from_secs(36));
    }

    #[test]
    fn reset_restarts() {
        let mut backoff = Backoff::standard();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(300));
    }
}
