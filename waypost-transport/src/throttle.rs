//! Rate limiting for repeated log lines.

use std::time::Duration;

/// Default interval between two emitted lines.
pub const DEFAULT_LOG_THROTTLE_INTERVAL: Duration = Duration::from_secs(5);

/// Lets one log line through per interval and counts the rest.
///
/// ```text
/// if let Some(suppressed) = throttle.check(now) {
///     warn!(suppressed, "dropping packet with bad hash");
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last_emitted: Option<Duration>,
    suppressed: u64,
}

impl LogThrottle {
    /// Create a throttle with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
            suppressed: 0,
        }
    }

    /// Register an occurrence at `now`.
    ///
    /// Returns the number of occurrences suppressed since the last emitted
    /// line when this one should be logged, `None` otherwise.
    pub fn check(&mut self, now: Duration) -> Option<u64> {
        match self.last_emitted {
            Some(last) if now.saturating_sub(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_emitted = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_THROTTLE_INTERVAL)
    }
}
