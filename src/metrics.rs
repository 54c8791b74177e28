//! Ingest counters.
//! Owned by the service that does the ingesting; nothing here is global.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    decoded: AtomicU64,
    decrypted: AtomicU64,
    opaque: AtomicU64,
    failed: AtomicU64,
    skipped_json: AtomicU64,
    nodes_updated: AtomicU64,
    store_errors: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decrypted(&self) {
        self.decrypted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_opaque(&self) {
        self.opaque.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_skipped_json(&self) {
        self.skipped_json.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_nodes_updated(&self) {
        self.nodes_updated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_store_errors(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decrypted: self.decrypted.load(Ordering::Relaxed),
            opaque: self.opaque.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_json: self.skipped_json.load(Ordering::Relaxed),
            nodes_updated: self.nodes_updated.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub received: u64,
    pub decoded: u64,
    pub decrypted: u64,
    pub opaque: u64,
    pub failed: u64,
    pub skipped_json: u64,
    pub nodes_updated: u64,
    pub store_errors: u64,
}

impl Snapshot {
    /// Share of received messages that ended up decoded, in percent.
    pub fn decode_rate(&self) -> Option<f64> {
        let considered = self.received.saturating_sub(self.skipped_json);
        if considered == 0 {
            None
        } else {
            Some(self.decoded as f64 * 100.0 / considered as f64)
        }
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} decoded={} decrypted={} opaque={} failed={} skipped_json={} nodes_updated={} store_errors={}",
            self.received,
            self.decoded,
            self.decrypted,
            self.opaque,
            self.failed,
            self.skipped_json,
            self.nodes_updated,
            self.store_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let stats = IngestStats::new();
        assert_eq!(stats.snapshot(), Snapshot::default());
        assert_eq!(stats.snapshot().decode_rate(), None);

        for _ in 0..4 {
            stats.inc_received();
        }
        stats.inc_skipped_json();
        stats.inc_decoded();
        stats.inc_decoded();
        stats.inc_decrypted();
        stats.inc_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.received, 4);
        assert_eq!(snap.decoded, 2);
        assert_eq!(snap.decrypted, 1);
        assert_eq!(snap.failed, 1);
        let rate = snap.decode_rate().unwrap();
        assert!((rate - 66.666).abs() < 0.01);
        assert!(snap.to_string().starts_with("received=4 decoded=2"));
    }
}
