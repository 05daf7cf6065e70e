use std::time::Duration;

/// What to do after a reconnectable close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect after `delay`; `attempt` is the new attempt counter.
    Retry { delay: Duration, attempt: u32 },
    /// Cap reached: stay disconnected until someone calls `connect()`.
    GiveUp,
}

/// Capped exponential backoff for socket reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// `min(initial * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn decide(&self, attempts_so_far: u32) -> ReconnectDecision {
        if attempts_so_far < self.max_attempts {
            ReconnectDecision::Retry {
                delay: self.delay_for(attempts_so_far),
                attempt: attempts_so_far + 1,
            }
        } else {
            ReconnectDecision::GiveUp
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(2_000), Duration::from_millis(60_000))
    }
}
