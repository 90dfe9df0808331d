use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Bounded polling with exponential backoff.
///
/// Every wait in this crate goes through a `RetryPolicy`: the loop stops after
/// `max_attempts` checks no matter what the condition says, so the worst case
/// wall time is bounded by [`RetryPolicy::worst_case`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

/// What a bounded poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { attempts } | PollOutcome::Exhausted { attempts } => *attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, handy when the caller already knows the
    /// backend answers synchronously.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Upper bound on the time spent sleeping by [`RetryPolicy::poll_until`].
    pub fn worst_case(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }

    /// Runs `check` until it reports `true` or the attempt budget runs out.
    /// A check that errors counts as "not yet" and is logged.
    pub async fn poll_until<F, Fut, E>(&self, what: &str, mut check: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        for attempt in 1..=max {
            match check().await {
                Ok(true) => {
                    if attempt > 1 {
                        info!(attempts = attempt, what, "Condition reached after retries");
                    }
                    return PollOutcome::Satisfied { attempts: attempt };
                }
                Ok(false) => debug!(attempt, max_attempts = max, what, "Condition not reached yet"),
                Err(e) => warn!(
                    error = %e,
                    attempt,
                    max_attempts = max,
                    what,
                    "Check failed, counting as not reached"
                ),
            }

            if attempt < max {
                tokio::time::sleep(self.delay_after(attempt)).await;
            }
        }

        warn!(attempts = max, what, "Retry budget exhausted");
        PollOutcome::Exhausted { attempts: max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn worst_case_is_finite() {
        let policy = RetryPolicy::default();
        // 1 + 2 + 4 + 5 * 6
        assert_eq!(policy.worst_case(), Duration::from_secs(37));
        assert_eq!(RetryPolicy::immediate(10).worst_case(), Duration::ZERO);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let outcome = RetryPolicy::immediate(10)
            .poll_until("third time lucky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, String>(n == 3)
            })
            .await;
        assert_eq!(outcome, PollOutcome::Satisfied { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_exceeds_budget() {
        let calls = AtomicU32::new(0);
        let outcome = RetryPolicy::immediate(4)
            .poll_until("never", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>("backend hiccup")
            })
            .await;
        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
