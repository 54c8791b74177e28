//! Periodic background jobs with explicit cancellation.
//!
//! A job runs immediately, then on every tick of a monotonic interval, until its
//! [`CancellationToken`] fires. Missed ticks are skipped rather than replayed, so a slow pass
//! never causes a burst of catch-up runs.

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a spawned periodic job.
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the job to stop and wait up to `grace` for it to exit; abort it otherwise.
    /// Returns `true` when the job exited on its own.
    pub async fn stop(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let abort = self.join.abort_handle();
        match tokio::time::timeout(grace, self.join).await {
            Ok(Ok(())) => {
                debug!("Task '{}' stopped", self.name);
                true
            }
            Ok(Err(e)) => {
                warn!("Task '{}' ended abnormally: {}", self.name, e);
                false
            }
            Err(_) => {
                warn!("Task '{}' did not stop within {:?}; aborting", self.name, grace);
                abort.abort();
                false
            }
        }
    }
}

/// Spawn `job` every `period` until `cancel` fires. A cancel during a pass lets the pass finish
/// and then exits.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut job: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Task '{}' started (every {:?})", name, period);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
        info!("Task '{}' cancelled", name);
    });
    TaskHandle { name, cancel, join }
}
