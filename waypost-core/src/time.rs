//! Time provider abstraction for real and manually driven time.
//!
//! Last-heard timestamps, silence thresholds and ICE attempt bookkeeping all
//! read time through [`TimeProvider::now`]. Periodic timers in the reactors use
//! Tokio intervals directly; only the bookkeeping needs to be steerable from
//! tests, which is what [`ManualTimeProvider`] is for.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

/// Provider trait for time operations.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since the provider was created.
    fn now(&self) -> Duration;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    /// Start time for calculating elapsed duration
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same clock. `sleep` advances the clock by the requested
/// duration and yields once, so code written against [`TimeProvider`] makes
/// progress without waiting on the wall clock.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeProvider {
    micros: Arc<AtomicU64>,
}

impl ManualTimeProvider {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for ManualTimeProvider {
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
