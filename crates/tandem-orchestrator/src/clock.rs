//! Clock and ticker: a monotonic time source plus periodic ticks.
//!
//! Kept as a trait so engine tests can inject a virtual clock instead of
//! waiting on real wall time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Drives periodic ticks at a fixed period until cancelled. `on_tick` is
/// invoked with the elapsed duration since the previous tick.
pub struct Ticker {
    period: Duration,
    cancel: CancellationToken,
    stopped: Arc<Notify>,
}

impl Ticker {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        Self {
            period,
            cancel,
            stopped: Arc::new(Notify::new()),
        }
    }

    /// Spawns the ticking task, calling `on_tick` on every period until the
    /// cancellation token fires.
    pub fn spawn<F>(self, mut on_tick: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        let period = self.period;
        let cancel = self.cancel;
        let stopped = self.stopped;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => on_tick(),
                }
            }
            stopped.notify_waiters();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_until_cancelled() {
        let cancel = CancellationToken::new();
        let ticker = Ticker::new(Duration::from_millis(10), cancel.clone());
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let handle = ticker.spawn(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_millis(35)).await;
        cancel.cancel();
        let _ = handle.await;
        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
