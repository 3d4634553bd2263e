//! Monotonic clock and cancellable timers.
//!
//! Timers deliver a message into an mpsc channel when they fire; cancellation
//! is idempotent and implied by dropping the handle. Coordinators use these
//! for age promotion and interrupt retransmission.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Monotonic clock anchored at service start.
#[derive(Copy, Clone, Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock's epoch.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an armed timer. Cancelling is idempotent; dropping cancels.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer. Safe to call more than once, and safe to call
    /// after the timer has already fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Arms a one-shot timer that sends `msg` on `tx` after `delay`.
pub fn one_shot<T: Send + 'static>(delay: Duration, tx: mpsc::Sender<T>, msg: T) -> TimerHandle {
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(msg).await;
    });
    TimerHandle { task }
}

/// Arms a periodic timer that sends `make_msg()` on `tx` every `interval`
/// until cancelled or the receiver goes away.
pub fn periodic<T, F>(interval: Duration, tx: mpsc::Sender<T>, make_msg: F) -> TimerHandle
where
    T: Send + 'static,
    F: Fn() -> T + Send + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if tx.send(make_msg()).await.is_err() {
                break;
            }
        }
    });
    TimerHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_now_ms_advances() {
        let clock = MonotonicClock::new();
        let t0 = clock.now_ms();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(clock.now_ms() >= t0 + 10);
    }

    #[tokio::test]
    async fn test_one_shot_fires() {
        let (tx, mut rx) = mpsc::channel(1);
        let _timer = one_shot(Duration::from_millis(10), tx, 42u32);
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_one_shot_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let timer = one_shot(Duration::from_millis(50), tx, 42u32);
        timer.cancel();
        timer.cancel(); // idempotent
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (tx, mut rx) = mpsc::channel(1);
        {
            let _timer = one_shot(Duration::from_millis(50), tx, 42u32);
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_periodic_repeats() {
        let (tx, mut rx) = mpsc::channel(8);
        let _timer = periodic(Duration::from_millis(10), tx, || 7u32);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_periodic_cancel_stops() {
        let (tx, mut rx) = mpsc::channel(8);
        let timer = periodic(Duration::from_millis(10), tx, || 7u32);
        assert_eq!(rx.recv().await, Some(7));
        timer.cancel();
        // drain whatever was already in flight, then expect silence
        tokio::time::sleep(Duration::from_millis(40)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
    }
}
