//! Time source for the pool and dispatcher
//!
//! All bookkeeping uses unix milliseconds so it survives a round-trip through
//! the account snapshot. `ManualClock` makes every timing rule testable
//! without real sleeps: its `sleep` advances virtual time instantly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Wall clock plus the ability to wait.
pub trait Clock: Send + Sync {
    /// Current time as unix milliseconds.
    fn now_millis(&self) -> u64;

    /// Suspend the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System time and tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        iflow_auth::now_millis()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for tests. Sleeping advances time and is recorded.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_advances_and_records() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_secs(2)).await;
        clock.advance(Duration::from_millis(500));

        assert_eq!(clock.now_millis(), 3_500);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_sleeps_on_tokio_timer() {
        let start = tokio::time::Instant::now();
        SystemClock.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn system_clock_reports_unix_millis() {
        // 2020-01-01 in unix millis
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
