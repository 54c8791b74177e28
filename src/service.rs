//! Collector service: owns the store, the ingest pipeline and the background tasks.
//!
//! ```rust,no_run
//! use meshtrace::{config::Config, service::CollectorService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut service = CollectorService::open(Config::default())?;
//!     service.start();
//!     service.wait().await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::graph::CombinedGraph;
use crate::ingest::{Ingestor, NodeDirectory};
use crate::location::{LocationCache, StorageLocationSource};
use crate::logutil::escape_log;
use crate::metrics::{IngestStats, Snapshot};
use crate::mqtt::{MessageSink, MqttSubscriber, TransportError};
use crate::retention::RetentionWorker;
use crate::scheduler::{spawn_periodic, TaskHandle};
use crate::storage::{PruneReport, Storage};
use crate::traceroute::{PathKind, TraceroutePacket};

impl MessageSink for Ingestor {
    fn deliver(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.handle(topic, payload, Utc::now()) {
            error!("Failed to store message from {}: {}", escape_log(topic), e);
        }
    }
}

pub struct CollectorService {
    config: Config,
    storage: Storage,
    directory: Arc<NodeDirectory>,
    stats: Arc<IngestStats>,
    ingestor: Arc<Ingestor>,
    cancel: CancellationToken,
    tasks: Vec<TaskHandle>,
    transport: Option<JoinHandle<Result<(), TransportError>>>,
}

impl CollectorService {
    /// Open the configured database and build the service around it.
    pub fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(&config.database.path)
            .with_context(|| format!("opening packet store {}", config.database.path))?;
        Ok(Self::with_storage(config, storage))
    }

    pub fn with_storage(config: Config, storage: Storage) -> Self {
        let directory = Arc::new(NodeDirectory::new(storage.clone()));
        let stats = Arc::new(IngestStats::new());
        let ingestor = Arc::new(Ingestor::new(
            storage.clone(),
            config.decryption.keys.clone(),
            directory.clone(),
            stats.clone(),
        ));
        Self {
            config,
            storage,
            directory,
            stats,
            ingestor,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            transport: None,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start retention cleanup and node-name eviction. Idempotent.
    pub fn start_background(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let retention = RetentionWorker::new(self.storage.clone(), self.config.retention.hours)
            .with_interval(self.config.retention.interval());
        if let Some(handle) = retention.spawn(self.cancel.child_token()) {
            self.tasks.push(handle);
        }

        let directory = self.directory.clone();
        self.tasks.push(spawn_periodic(
            "node-name-eviction",
            self.config.cache.eviction_interval(),
            self.cancel.child_token(),
            move || {
                let directory = directory.clone();
                async move {
                    directory.clear();
                }
            },
        ));
    }

    /// Start the background tasks and the MQTT subscription.
    pub fn start(&mut self) {
        self.start_background();
        if self.transport.is_some() {
            return;
        }
        let subscriber = MqttSubscriber::new(self.config.mqtt.clone());
        let sink: Arc<dyn MessageSink> = self.ingestor.clone();
        let cancel = self.cancel.child_token();
        self.transport = Some(tokio::spawn(async move { subscriber.run(sink, cancel).await }));
    }

    /// Wait for Ctrl-C or for the transport to end on its own.
    pub async fn wait(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for shutdown signal: {}", e);
            }
            return;
        };
        let finished = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            result = transport => Some(result),
        };
        match finished {
            None => info!("Shutdown requested"),
            Some(result) => {
                self.transport = None;
                match result {
                    Ok(Ok(())) => info!("MQTT transport finished"),
                    Ok(Err(e)) => error!("MQTT transport stopped: {}", e),
                    Err(e) => error!("MQTT transport task failed: {}", e),
                }
            }
        }
    }

    /// Stop everything, waiting up to the configured grace per task. Returns the final
    /// ingest counters.
    pub async fn shutdown(mut self) -> Snapshot {
        self.cancel.cancel();
        let grace = self.config.retention.stop_grace();
        if let Some(mut transport) = self.transport.take() {
            match tokio::time::timeout(grace, &mut transport).await {
                Ok(Ok(Err(e))) => warn!("MQTT transport ended with error: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("MQTT transport did not stop within {:?}; aborting", grace);
                    transport.abort();
                }
            }
        }
        for task in self.tasks.drain(..) {
            task.stop(grace).await;
        }
        let snapshot = self.stats.snapshot();
        info!("Ingest totals: {}", snapshot);
        snapshot
    }

    /// One retention pass right now.
    pub async fn cleanup_once(&self) -> Option<PruneReport> {
        RetentionWorker::new(self.storage.clone(), self.config.retention.hours)
            .run_once(Utc::now())
            .await
    }

    /// Reconstruct one stored traceroute with names and RF hop distances.
    pub fn traceroute(&self, record_id: i64) -> Result<TraceroutePacket> {
        let record = self
            .storage
            .get_packet(record_id)?
            .ok_or_else(|| anyhow!("no packet with id {}", record_id))?;
        if !record.is_traceroute() {
            return Err(anyhow!(
                "packet {} is {}, not a traceroute",
                record_id,
                record.portnum_name.as_deref().unwrap_or("undecoded")
            ));
        }
        let mut packet = TraceroutePacket::from_record(&record);
        packet.resolve_names(self.directory.as_ref());
        let source = StorageLocationSource::new(self.storage.clone());
        packet.annotate_distances(&[PathKind::CombinedRf], &source, None);
        Ok(packet)
    }

    /// Merge every stored reception of `probe_id` into one graph.
    pub fn probe_graph(&self, probe_id: u32) -> Result<CombinedGraph> {
        let records: Vec<_> = self
            .storage
            .packets_by_probe(probe_id)?
            .into_iter()
            .filter(|r| r.is_traceroute())
            .collect();
        if records.is_empty() {
            return Err(anyhow!("no traceroute packets for probe {:08x}", probe_id));
        }
        let mut graph = CombinedGraph::build(&records);
        graph.resolve_names(self.directory.as_ref());
        Ok(graph)
    }

    /// Reconstruct the latest traceroutes, sharing one location cache across them.
    pub fn recent_traceroutes(&self, limit: usize) -> Result<Vec<TraceroutePacket>> {
        let source = StorageLocationSource::new(self.storage.clone());
        let mut cache = LocationCache::new();
        let packets = self
            .storage
            .recent_traceroutes(limit)?
            .iter()
            .map(|record| {
                let mut packet = TraceroutePacket::from_record(record);
                packet.resolve_names(self.directory.as_ref());
                packet.annotate_distances(&[PathKind::CombinedRf], &source, Some(&mut cache));
                packet
            })
            .collect();
        Ok(packets)
    }
}
