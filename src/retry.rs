//! Exponential backoff with jitter, shared by store writes, publish retries and peer sends.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    delay_ms: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter_ms: u64) -> Self {
        let initial_ms = (initial.as_millis() as u64).max(1);
        Self {
            initial_ms,
            max_ms: (max.as_millis() as u64).max(initial_ms),
            jitter_ms,
            delay_ms: initial_ms,
        }
    }

    /// 150ms doubling up to 1200ms, plus up to 50ms of jitter.
    pub fn store() -> Self {
        Self::new(Duration::from_millis(150), Duration::from_millis(1200), 50)
    }

    /// Delay before the next attempt; every call doubles the base up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::random::<u64>() % self.jitter_ms
        } else {
            0
        };
        let delay = Duration::from_millis(self.delay_ms + jitter);
        self.delay_ms = (self.delay_ms * 2).min(self.max_ms);
        delay
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    pub fn reset(&mut self) {
        self.delay_ms = self.initial_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 0);

        let delays: Vec<u64> = (0..4)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let mut backoff = Backoff::store();

        for base in [150u64, 300, 600, 1200, 1200] {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((base..base + 50).contains(&delay), "{} not near {}", delay, base);
        }
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(80), 0);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
