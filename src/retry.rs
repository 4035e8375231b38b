use crate::config::ReconnectPolicy;
use backon::BackoffBuilder;
use std::time::Duration;

/// Progressive delays between open attempts within one sweep.
///
/// Retry `n` waits `delays[n]`; past the end of the table the last delay
/// repeats. Yields `max_attempts - 1` delays, so the operation runs at most
/// `max_attempts` times.
#[derive(Debug, Clone)]
pub struct ProgressiveBuilder {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl ProgressiveBuilder {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        Self { delays, max_attempts }
    }

    pub fn from_policy(policy: &ReconnectPolicy) -> Self {
        Self::new(
            policy.attempt_delays_ms.iter().copied().map(Duration::from_millis).collect(),
            policy.max_attempts_per_sweep,
        )
    }
}

impl BackoffBuilder for ProgressiveBuilder {
    type Backoff = ProgressiveBackoff;

    fn build(self) -> Self::Backoff {
        ProgressiveBackoff {
            delays: self.delays,
            remaining: self.max_attempts.saturating_sub(1),
            index: 0,
        }
    }
}

#[derive(Debug)]
pub struct ProgressiveBackoff {
    delays: Vec<Duration>,
    remaining: u32,
    index: usize,
}

impl Iterator for ProgressiveBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self
            .delays
            .get(self.index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO);
        self.index += 1;
        Some(delay)
    }
}
