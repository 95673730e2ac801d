//! Capped exponential backoff

use std::time::Duration;

/// Delay schedule for retrying one operation
///
/// The first delay is `initial`; each following delay doubles, capped at
/// `max_delay`. After `max_retries` delays the schedule is exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_delay: Duration,
    max_retries: u32,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            max_delay,
            max_retries,
            attempt: 0,
            current: initial,
        }
    }

    /// Delay before the next retry, or `None` if retries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        self.attempt += 1;
        let delay = self.current.min(self.max_delay);
        self.current = self.current.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }

    /// Retries handed out so far
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_zero_retries() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0);
        assert_eq!(backoff.next_delay(), None);
    }
}
