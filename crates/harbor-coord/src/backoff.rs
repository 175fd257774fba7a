//! Bounded exponential backoff for transient failures.

use std::time::Duration;

/// Doubling delay from 100 ms up to a 30 s cap.
///
/// Callers sleep for [`next`](Backoff::next) after each transient failure
/// and [`reset`](Backoff::reset) after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(Duration::from_millis(100), Duration::from_secs(30))
    }

    pub fn with_limits(base: Duration, cap: Duration) -> Self {
        Self {
            current: base,
            base,
            cap,
        }
    }

    /// The delay to sleep now; doubles for next time, saturating at the cap.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let mut b = Backoff::new();
        assert_eq!(b.next(), Duration::from_millis(100));
        assert_eq!(b.next(), Duration::from_millis(200));
        assert_eq!(b.next(), Duration::from_millis(400));
        for _ in 0..16 {
            b.next();
        }
        assert_eq!(b.next(), Duration::from_secs(30));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::new();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_millis(100));
    }
}
