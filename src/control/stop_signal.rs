//! Shared cooperative stop signal.
//!
//! One `StopSignal` is shared between whoever may cancel (CLI Ctrl-C handler,
//! session `stop()`) and the loops that must observe it. Setting it wakes every
//! interruptible sleep immediately, so cancellation latency does not depend on
//! the tick period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cloneable stop flag with async wake-up.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// New, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Wakes all waiters.
    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Re-arm for the next session.
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is set.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent `set` is not missed
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `true` if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline` unless stopped first. Returns `true` if stopped.
    pub async fn sleep_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            () = self.cancelled() => true,
            () = tokio::time::sleep_until(deadline) => self.is_set(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_when_not_stopped() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.sleep(Duration::from_secs(2)).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn set_interrupts_sleep() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            remote.set();
        });

        assert!(stop.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_set_returns_immediately() {
        let stop = StopSignal::new();
        stop.set();
        stop.cancelled().await;
        assert!(stop.sleep(Duration::from_secs(60)).await);

        stop.clear();
        assert!(!stop.is_set());
    }
}
