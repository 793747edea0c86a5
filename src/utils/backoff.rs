//! Capped exponential backoff helper for unbounded retry loops.

use rand::Rng;

use tokio::time::{self, Duration};

use crate::utils::CausalKvError;

/// Capped exponential backoff with jitter. Each call to `next_delay()`
/// doubles the nominal delay until it reaches the cap; the returned delay is
/// drawn uniformly from the upper half of the nominal one so that senders
/// retrying against the same peer do not stay in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Nominal delay of the first retry.
    base: Duration,

    /// Largest nominal delay.
    cap: Duration,

    /// Number of delays handed out since the last reset.
    attempts: u32,
}

impl Backoff {
    /// Creates a new backoff helper.
    pub fn new(base: Duration, cap: Duration) -> Result<Self, CausalKvError> {
        if base.is_zero() {
            return Err(CausalKvError::msg("invalid backoff base 0 ms"));
        }
        if cap < base {
            return Err(CausalKvError::msg(format!(
                "backoff cap {} ms < base {} ms",
                cap.as_millis(),
                base.as_millis()
            )));
        }
        Ok(Backoff {
            base,
            cap,
            attempts: 0,
        })
    }

    /// Nominal (jitter-free) delay for the current attempt.
    fn nominal(&self) -> Duration {
        let factor =
            1u32.checked_shl(self.attempts.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Returns the delay to wait before the next retry and advances the
    /// attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal();
        self.attempts = self.attempts.saturating_add(1);
        let half = nominal / 2;
        let jitter_us = rand::thread_rng()
            .gen_range(0..=(nominal - half).as_micros() as u64);
        half + Duration::from_micros(jitter_us)
    }

    /// Sleeps for the next delay.
    pub async fn wait(&mut self) {
        time::sleep(self.next_delay()).await;
    }

    /// Resets to the base delay, e.g. after a successful exchange.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod backoff_tests {
    use super::*;

    #[test]
    fn invalid_params() {
        assert!(Backoff::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(10)
        )
        .is_err());
    }

    #[test]
    fn grows_then_caps() -> Result<(), CausalKvError> {
        let base = Duration::from_millis(10);
        let cap = Duration::from_millis(160);
        let mut backoff = Backoff::new(base, cap)?;
        let mut nominal = base;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= nominal / 2);
            assert!(delay <= nominal);
            assert!(delay <= cap);
            nominal = (nominal * 2).min(cap);
        }
        Ok(())
    }

    #[test]
    fn reset_to_base() -> Result<(), CausalKvError> {
        let base = Duration::from_millis(10);
        let mut backoff = Backoff::new(base, Duration::from_secs(5))?;
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= base);
        Ok(())
    }
}
