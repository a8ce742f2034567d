//! Background trigger-switch poller.
//!
//! A tokio task ticks every `interval`, asks the driver's [`StatusPoll`] for the
//! switch state and publishes [`SwitchEvent::Pressed`] on the idle → pressed
//! edge. The status query only ever waits a bounded time for the shared link,
//! so a foreground calibration or measurement is never held up by a tick.
//!
//! The task stops when [`SwitchPoller::stop`] is called, when the poller is
//! dropped, when the abort flag is raised or when the link reports closed.

use chrono::{DateTime, Utc};
use colorcal_core::abort::AbortFlag;
use colorcal_core::driver::{StatusPoll, SwitchState};
use colorcal_core::error::{ColorError, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Capacity of the event channel.
pub const EVENT_CAPACITY: usize = 16;

/// Something the user did on the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEvent {
    /// The trigger switch was pressed.
    Pressed {
        /// When the press was observed.
        at: DateTime<Utc>,
    },
}

/// Handle to a running poll task.
#[derive(Debug)]
pub struct SwitchPoller {
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SwitchPoller {
    /// Start polling `status` every `interval`, publishing on `events`.
    pub fn spawn(
        status: Arc<dyn StatusPoll>,
        interval: Duration,
        abort: AbortFlag,
        events: broadcast::Sender<SwitchEvent>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = SwitchState::Idle;
            tracing::debug!(target: "colorcal::poller", ?interval, "Switch poller started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if abort.is_triggered() {
                            tracing::debug!(target: "colorcal::poller", "Abort raised, stopping");
                            break;
                        }
                        match status.poll().await {
                            Ok(Some(state)) => {
                                if state == SwitchState::Pressed && last == SwitchState::Idle {
                                    tracing::info!(target: "colorcal::poller", "Switch pressed");
                                    // No subscribers is fine.
                                    let _ = events.send(SwitchEvent::Pressed { at: Utc::now() });
                                }
                                last = state;
                            }
                            Ok(None) => {
                                tracing::trace!(target: "colorcal::poller", "Link busy, tick skipped");
                            }
                            Err(ColorError::TransportFailure(TransportError::Closed)) => {
                                tracing::debug!(target: "colorcal::poller", "Link closed, stopping");
                                break;
                            }
                            Err(e) => {
                                tracing::debug!(target: "colorcal::poller", error = %e, "Status query failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!(target: "colorcal::poller", "Switch poller stopped");
        });
        Self {
            task: Some(task),
            shutdown: Some(shutdown_tx),
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.take() {
            if let Err(e) = handle.await {
                tracing::warn!(target: "colorcal::poller", error = %e, "Switch poller join error");
            }
        }
    }
}

impl Drop for SwitchPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}
