//! Wall-clock abstraction and the shutdown/cancellable-sleep primitive.
//!
//! The tick loop never calls `Utc::now()` or `tokio::time::sleep` directly:
//! it goes through [`Clock`] (swappable in tests) and [`ShutdownListener::sleep`]
//! (wakes early when shutdown is broadcast).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Source of UTC instants with at least second resolution.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

/// Broadcast shutdown flag.  Cloning a listener is cheap; triggering is
/// idempotent and wakes every listener currently inside [`ShutdownListener::sleep`].
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the flag.  Listeners wake immediately.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`, returning early if shutdown is triggered.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the sleep
    /// was cut short by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = self.rx.changed() => {
                // A closed channel means the `Shutdown` handle was dropped;
                // treat that the same as a trigger so loops can exit.
                match changed {
                    Ok(()) => !*self.rx.borrow(),
                    Err(_) => false,
                }
            }
        }
    }

    /// Wait until shutdown is triggered (or the handle is dropped).
    pub async fn wait(&mut self) {
        while !self.is_triggered() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a, "clock should be monotonic enough for scheduling");
    }

    #[tokio::test]
    async fn sleep_completes_when_not_triggered() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        let slept = listener.sleep(Duration::from_millis(10)).await;
        assert!(slept, "undisturbed sleep should run to completion");
    }

    #[tokio::test]
    async fn sleep_returns_early_on_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();

        let started = Instant::now();
        let sleeper = tokio::spawn(async move { listener.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let slept = sleeper.await.expect("sleeper task");
        assert!(!slept, "sleep should be interrupted by shutdown");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "wake-up should be prompt, not after the full duration"
        );
    }

    #[tokio::test]
    async fn sleep_after_trigger_is_immediate() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        shutdown.trigger();
        let slept = listener.sleep(Duration::from_secs(30)).await;
        assert!(!slept, "sleep after shutdown should not block");
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        drop(shutdown);
        let slept = listener.sleep(Duration::from_secs(30)).await;
        assert!(!slept, "dropped Shutdown handle should wake sleepers");
    }
}
