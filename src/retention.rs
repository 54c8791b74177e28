//! Retention cleanup.
//!
//! [`RetentionWorker`] prunes `packet_history` rows older than the retention window and then
//! the `node_info` rows that are stale and no longer referenced. It runs once at startup and
//! then on a fixed interval; a window of zero hours or less disables it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{spawn_periodic, TaskHandle};
use crate::storage::{PruneReport, Storage};

#[derive(Clone)]
pub struct RetentionWorker {
    storage: Storage,
    retention_hours: i64,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(storage: Storage, retention_hours: i64) -> Self {
        Self {
            storage,
            retention_hours,
            interval: Duration::from_secs(3600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_hours > 0
    }

    /// Oldest timestamp kept. A window reaching past the representable range keeps
    /// everything.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ChronoDuration::try_hours(self.retention_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One cleanup pass relative to `now`. Returns `None` when disabled or when the pass
    /// failed; a failed pass has been rolled back and logged.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Option<PruneReport> {
        if !self.is_enabled() {
            return None;
        }
        let cutoff = self.cutoff(now);
        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || storage.prune_before(cutoff)).await {
            Ok(Ok(report)) => {
                if report.packets_deleted > 0 || report.nodes_deleted > 0 {
                    info!(
                        "Retention cleanup removed {} packets and {} nodes older than {}",
                        report.packets_deleted,
                        report.nodes_deleted,
                        cutoff.to_rfc3339()
                    );
                } else {
                    debug!("Retention cleanup: nothing older than {}", cutoff.to_rfc3339());
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!("Retention cleanup failed and was rolled back: {}", e);
                None
            }
            Err(e) => {
                error!("Retention cleanup task failed: {}", e);
                None
            }
        }
    }

    /// Start the periodic worker. Returns `None` when retention is disabled.
    pub fn spawn(self, cancel: CancellationToken) -> Option<TaskHandle> {
        if !self.is_enabled() {
            info!("Retention cleanup disabled (retention_hours={})", self.retention_hours);
            return None;
        }
        info!(
            "Retention cleanup keeps {}h of history, running every {:?}",
            self.retention_hours, self.interval
        );
        let interval = self.interval;
        Some(spawn_periodic("retention", interval, cancel, move || {
            let worker = self.clone();
            async move {
                worker.run_once(Utc::now()).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PacketRecord;

    #[tokio::test]
    async fn disabled_worker_does_nothing() {
        let storage = Storage::open_in_memory().unwrap();
        let mut old = PacketRecord::new("msh/US/2/e/LongFast/!abcd1234", Utc::now() - ChronoDuration::days(30));
        old.from_node_id = Some(1);
        storage.insert_packet(&old).unwrap();

        let worker = RetentionWorker::new(storage.clone(), 0);
        assert!(worker.run_once(Utc::now()).await.is_none());
        assert!(worker.clone().spawn(CancellationToken::new()).is_none());
        assert_eq!(storage.count_packets().unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_window_prunes_nothing() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_packet(&PacketRecord::new("t", Utc::now() - ChronoDuration::days(400)))
            .unwrap();

        let worker = RetentionWorker::new(storage.clone(), 5_000_000_000);
        assert_eq!(worker.cutoff(Utc::now()), DateTime::<Utc>::MIN_UTC);
        let report = worker.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.packets_deleted, 0);
        assert_eq!(storage.count_packets().unwrap(), 1);

        let worker = RetentionWorker::new(storage.clone(), i64::MAX);
        assert!(worker.run_once(Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn spawned_worker_runs_at_startup_and_stops() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_packet(&PacketRecord::new("t", Utc::now() - ChronoDuration::hours(5)))
            .unwrap();

        let handle = RetentionWorker::new(storage.clone(), 1)
            .with_interval(Duration::from_secs(3600))
            .spawn(CancellationToken::new())
            .unwrap();

        let mut remaining = 1;
        for _ in 0..50 {
            remaining = storage.count_packets().unwrap();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining, 0);
        assert!(handle.stop(Duration::from_secs(2)).await);
    }
}
