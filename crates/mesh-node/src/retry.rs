use std::time::Duration;

/// Default retry schedule: immediate, then 5s, 15s, 60s.
pub const DEFAULT_DELAYS_MS: [u64; 4] = [0, 5_000, 15_000, 60_000];

/// One retry policy shared by the send pipeline and the queue drainer.
/// `delays_ms[i]` is the wait before attempt `i`; the length is the attempt
/// budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_DELAYS_MS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn new(delays_ms: Vec<u64>) -> Self {
        assert!(!delays_ms.is_empty(), "retry policy needs at least one attempt");
        Self { delays_ms }
    }

    /// A single immediate attempt, no retries. Used for relay forwards and
    /// queue replays.
    pub fn single() -> Self {
        Self { delays_ms: vec![0] }
    }

    pub fn attempts(&self) -> usize {
        self.delays_ms.len()
    }

    pub fn delay_before(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.delays_ms.get(attempt).copied().unwrap_or(0))
    }
}

/// Classification of one HTTP POST attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Any 2xx.
    Delivered(u16),
    /// Connect failure, timeout or 5xx; eligible for another attempt.
    Retryable(String),
    /// 4xx; permanent, never retried.
    Permanent(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(3), Duration::from_secs(60));
    }

    #[test]
    fn single_is_one_immediate_attempt() {
        let policy = RetryPolicy::single();
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
    }
}
