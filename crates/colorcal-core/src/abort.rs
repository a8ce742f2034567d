//! Cooperative abort flag.
//!
//! A lock-free flag checked at every wait point: between probe attempts, on each
//! negotiation round and host wait, between stabilization samples, and on every
//! poller tick. Triggering it never interrupts an exchange mid-frame; the
//! in-flight exchange finishes (bounded by its own timeout) and the loop around
//! it unwinds with [`ColorError::UserAbort`].

use crate::error::{ColorError, ColorResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity at which long waits re-check the flag.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared abort flag. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag {
    flag: Arc<AtomicBool>,
}

impl AbortFlag {
    /// Create a new, untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request abort.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous abort so the session can be reused.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether abort has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(UserAbort)` once triggered.
    pub fn check(&self) -> ColorResult<()> {
        if self.is_triggered() {
            Err(ColorError::UserAbort)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `UserAbort` if the flag is raised.
    pub async fn sleep(&self, duration: Duration) -> ColorResult<()> {
        self.guard(tokio::time::sleep(duration)).await
    }

    /// Run `fut` to completion unless the flag is raised first.
    ///
    /// Dropping `fut` on abort releases anything it holds, including a transport
    /// lock.
    pub async fn guard<F: Future>(&self, fut: F) -> ColorResult<F::Output> {
        self.check()?;
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = tokio::time::sleep(ABORT_POLL_INTERVAL) => self.check()?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.trigger();
        assert!(matches!(flag.check(), Err(ColorError::UserAbort)));
        flag.reset();
        assert!(!other.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_unwinds_on_abort() {
        let flag = AbortFlag::new();
        let trigger = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });
        let started = tokio::time::Instant::now();
        let result = flag.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(ColorError::UserAbort)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_returns_output() {
        let flag = AbortFlag::new();
        let value = flag.guard(async { 7 }).await;
        assert_eq!(value.ok(), Some(7));
    }
}
