use std::time::Duration;

/// Fibonacci reconnect delays: 1s, 1s, 2s, 3s, 5s ... capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    previous: Duration,
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            previous: Duration::ZERO,
            current: initial,
            initial,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        let next = self.previous + self.current;
        self.previous = self.current;
        self.current = next.min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.previous = Duration::ZERO;
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence_capped() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..12).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
