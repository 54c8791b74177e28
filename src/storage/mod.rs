//! # Storage Module - Durable Packet Store
//!
//! Every received MQTT message becomes one row in `packet_history`, whether or not it could be
//! decoded. Identity announcements additionally maintain `node_info`. The schema is read by
//! external dashboards, so column names are part of the contract.
//!
//! ## Concurrency
//!
//! All access goes through a single SQLite connection guarded by one mutex. [`Storage`] is a
//! cheap clone around that shared handle; ingestion writes, retention deletes and cold cache
//! reads therefore serialize on the same lock.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshtrace::storage::Storage;
//!
//! fn main() -> anyhow::Result<()> {
//!     let storage = Storage::open("meshtrace.db")?;
//!     let recent = storage.recent_traceroutes(10)?;
//!     println!("{} traceroute packets", recent.len());
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::protobuf::meshtastic_generated as proto;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage lock poisoned")]
    LockPoisoned,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// One received transport message, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    /// Auto-increment row id; ignored on insert.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub from_node_id: Option<u32>,
    pub to_node_id: Option<u32>,
    pub portnum: Option<i32>,
    pub portnum_name: Option<String>,
    pub gateway_id: Option<String>,
    pub channel_id: Option<String>,
    /// Mesh packet id; groups receptions of the same probe through different gateways.
    pub probe_id: Option<u32>,
    pub rssi: Option<i32>,
    pub snr: Option<f64>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub payload_length: usize,
    #[serde(skip)]
    pub raw_payload: Vec<u8>,
    pub processed_successfully: bool,
    pub message_type: Option<String>,
    #[serde(skip)]
    pub raw_service_envelope: Vec<u8>,
    pub parsing_error: Option<String>,
}

impl PacketRecord {
    /// Empty record for `topic` received at `timestamp`; callers fill in what they decoded.
    pub fn new(topic: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            timestamp,
            topic: topic.into(),
            from_node_id: None,
            to_node_id: None,
            portnum: None,
            portnum_name: None,
            gateway_id: None,
            channel_id: None,
            probe_id: None,
            rssi: None,
            snr: None,
            hop_limit: None,
            hop_start: None,
            payload_length: 0,
            raw_payload: Vec::new(),
            processed_successfully: false,
            message_type: None,
            raw_service_envelope: Vec::new(),
            parsing_error: None,
        }
    }

    pub fn is_traceroute(&self) -> bool {
        self.portnum == Some(proto::PortNum::TracerouteApp as i32)
    }
}

/// Metadata about a node, merged from identity announcements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub node_id: u32,
    pub hex_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub is_licensed: Option<bool>,
    pub primary_channel: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl NodeRecord {
    /// Best human-facing name: long name, then short name.
    pub fn display_name(&self) -> Option<&str> {
        [self.long_name.as_deref(), self.short_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty())
    }
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub packets_deleted: usize,
    pub nodes_deleted: usize,
}

/// Shared handle to the packet store.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

const PACKET_COLUMNS: &str = "id, timestamp, topic, from_node_id, to_node_id, portnum, portnum_name, \
     gateway_id, channel_id, probe_id, rssi, snr, hop_limit, hop_start, payload_length, raw_payload, \
     processed_successfully, message_type, raw_service_envelope, parsing_error";

const NODE_COLUMNS: &str = "node_id, hex_id, long_name, short_name, hw_model, role, is_licensed, \
     primary_channel, first_seen, last_updated";

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let storage = Self::from_connection(conn)?;
        info!("Opened packet store at {}", path.as_ref().display());
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            conn.execute_batch(include_str!("../../migrations/0001_packet_store.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            debug!("Applied packet store migration 0001");
        }

        Ok(())
    }

    /// Append one packet. Returns the new row id.
    pub fn insert_packet(&self, record: &PacketRecord) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO packet_history (
                timestamp, topic, from_node_id, to_node_id, portnum, portnum_name,
                gateway_id, channel_id, probe_id, rssi, snr, hop_limit, hop_start,
                payload_length, raw_payload, processed_successfully, message_type,
                raw_service_envelope, parsing_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ",
            params![
                to_epoch(record.timestamp),
                record.topic,
                record.from_node_id,
                record.to_node_id,
                record.portnum,
                record.portnum_name,
                record.gateway_id,
                record.channel_id,
                record.probe_id,
                record.rssi,
                record.snr,
                record.hop_limit,
                record.hop_start,
                record.payload_length as i64,
                record.raw_payload,
                record.processed_successfully,
                record.message_type,
                record.raw_service_envelope,
                record.parsing_error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_packet(&self, id: i64) -> Result<Option<PacketRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM packet_history WHERE id = ?1", PACKET_COLUMNS);
        Ok(conn.query_row(&sql, params![id], packet_from_row).optional()?)
    }

    /// All receptions of one probe, oldest first.
    pub fn packets_by_probe(&self, probe_id: u32) -> Result<Vec<PacketRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM packet_history WHERE probe_id = ?1 ORDER BY timestamp ASC, id ASC",
            PACKET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![probe_id], packet_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent successfully decoded traceroute packets, newest first.
    pub fn recent_traceroutes(&self, limit: usize) -> Result<Vec<PacketRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM packet_history WHERE portnum = ?1 AND processed_successfully = 1 \
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            PACKET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![proto::PortNum::TracerouteApp as i32, limit as i64],
            packet_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Position packets sent by `node_id` at or before `at`, newest first.
    pub fn recent_positions(
        &self,
        node_id: u32,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PacketRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM packet_history WHERE from_node_id = ?1 AND portnum = ?2 \
             AND processed_successfully = 1 AND timestamp <= ?3 \
             ORDER BY timestamp DESC, id DESC LIMIT ?4",
            PACKET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                node_id,
                proto::PortNum::PositionApp as i32,
                to_epoch(at),
                limit as i64
            ],
            packet_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_packets(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM packet_history", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Insert or merge node metadata. Non-null incoming fields replace stored ones; nulls
    /// never erase what is already known.
    pub fn upsert_node(&self, node: &NodeRecord) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO node_info (
                node_id, hex_id, long_name, short_name, hw_model, role, is_licensed,
                primary_channel, first_seen, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(node_id) DO UPDATE SET
                hex_id = excluded.hex_id,
                long_name = COALESCE(excluded.long_name, node_info.long_name),
                short_name = COALESCE(excluded.short_name, node_info.short_name),
                hw_model = COALESCE(excluded.hw_model, node_info.hw_model),
                role = COALESCE(excluded.role, node_info.role),
                is_licensed = COALESCE(excluded.is_licensed, node_info.is_licensed),
                primary_channel = COALESCE(excluded.primary_channel, node_info.primary_channel),
                first_seen = MIN(node_info.first_seen, excluded.first_seen),
                last_updated = MAX(node_info.last_updated, excluded.last_updated)
            ",
            params![
                node.node_id,
                node.hex_id,
                node.long_name,
                node.short_name,
                node.hw_model,
                node.role,
                node.is_licensed,
                node.primary_channel,
                to_epoch(node.first_seen),
                to_epoch(node.last_updated),
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, node_id: u32) -> Result<Option<NodeRecord>, StorageError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM node_info WHERE node_id = ?1", NODE_COLUMNS);
        Ok(conn.query_row(&sql, params![node_id], node_from_row).optional()?)
    }

    pub fn count_nodes(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM node_info", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Delete packets older than `cutoff`, then nodes that are both stale and no longer
    /// referenced by any remaining packet. Both deletions commit together or not at all.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, StorageError> {
        let cutoff = to_epoch(cutoff);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let packets_deleted = tx.execute(
            "DELETE FROM packet_history WHERE timestamp < ?1",
            params![cutoff],
        )?;
        let nodes_deleted = tx.execute(
            "
            DELETE FROM node_info
            WHERE last_updated < ?1
              AND node_id NOT IN (
                  SELECT from_node_id FROM packet_history WHERE from_node_id IS NOT NULL
              )
              AND node_id NOT IN (
                  SELECT to_node_id FROM packet_history WHERE to_node_id IS NOT NULL
              )
            ",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(PruneReport {
            packets_deleted,
            nodes_deleted,
        })
    }
}

pub(crate) fn to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn from_epoch(idx: usize, secs: f64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64)
        .single()
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Real,
                format!("timestamp out of range: {}", secs).into(),
            )
        })
}

fn packet_from_row(row: &Row<'_>) -> rusqlite::Result<PacketRecord> {
    let payload_length: i64 = row.get(14)?;
    Ok(PacketRecord {
        id: row.get(0)?,
        timestamp: from_epoch(1, row.get(1)?)?,
        topic: row.get(2)?,
        from_node_id: row.get(3)?,
        to_node_id: row.get(4)?,
        portnum: row.get(5)?,
        portnum_name: row.get(6)?,
        gateway_id: row.get(7)?,
        channel_id: row.get(8)?,
        probe_id: row.get(9)?,
        rssi: row.get(10)?,
        snr: row.get(11)?,
        hop_limit: row.get(12)?,
        hop_start: row.get(13)?,
        payload_length: payload_length.max(0) as usize,
        raw_payload: row.get::<_, Option<Vec<u8>>>(15)?.unwrap_or_default(),
        processed_successfully: row.get(16)?,
        message_type: row.get(17)?,
        raw_service_envelope: row.get::<_, Option<Vec<u8>>>(18)?.unwrap_or_default(),
        parsing_error: row.get(19)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        node_id: row.get(0)?,
        hex_id: row.get(1)?,
        long_name: row.get(2)?,
        short_name: row.get(3)?,
        hw_model: row.get(4)?,
        role: row.get(5)?,
        is_licensed: row.get(6)?,
        primary_channel: row.get(7)?,
        first_seen: from_epoch(8, row.get(8)?)?,
        last_updated: from_epoch(9, row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn node(id: u32, long_name: Option<&str>, updated: DateTime<Utc>) -> NodeRecord {
        NodeRecord {
            node_id: id,
            hex_id: crate::node_id::format_node_id(id),
            long_name: long_name.map(str::to_string),
            short_name: None,
            hw_model: None,
            role: None,
            is_licensed: None,
            primary_channel: None,
            first_seen: updated,
            last_updated: updated,
        }
    }

    #[test]
    fn migrates_fresh_database() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
        // Running again is a no-op.
        storage.migrate().unwrap();
        assert_eq!(storage.count_packets().unwrap(), 0);
    }

    #[test]
    fn packet_round_trips_through_store() {
        let storage = Storage::open_in_memory().unwrap();
        let ts = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        let mut record = PacketRecord::new("msh/US/2/e/LongFast/!abcd1234", ts);
        record.from_node_id = Some(0xdeadbeef);
        record.probe_id = Some(42);
        record.raw_payload = vec![1, 2, 3];
        record.payload_length = 3;
        record.snr = Some(-7.25);
        record.processed_successfully = true;

        let id = storage.insert_packet(&record).unwrap();
        let loaded = storage.get_packet(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.timestamp, ts);
        assert_eq!(loaded.from_node_id, Some(0xdeadbeef));
        assert_eq!(loaded.raw_payload, vec![1, 2, 3]);
        assert_eq!(loaded.snr, Some(-7.25));
        assert!(loaded.processed_successfully);
        assert!(storage.get_packet(id + 1).unwrap().is_none());
    }

    #[test]
    fn upsert_merges_without_erasing() {
        let storage = Storage::open_in_memory().unwrap();
        let t0 = Utc::now() - ChronoDuration::hours(3);
        storage.upsert_node(&node(7, Some("Base Camp"), t0)).unwrap();

        let mut update = node(7, None, Utc::now());
        update.short_name = Some("BC".into());
        storage.upsert_node(&update).unwrap();

        let merged = storage.get_node(7).unwrap().unwrap();
        assert_eq!(merged.long_name.as_deref(), Some("Base Camp"));
        assert_eq!(merged.short_name.as_deref(), Some("BC"));
        assert_eq!(merged.first_seen, Utc.timestamp_millis_opt(t0.timestamp_millis()).unwrap());
        assert!(merged.last_updated > merged.first_seen);
        assert_eq!(storage.count_nodes().unwrap(), 1);
    }

    #[test]
    fn prune_with_nothing_old_is_a_noop() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_packet(&PacketRecord::new("msh/US/2/e/LongFast/!1", Utc::now()))
            .unwrap();
        let report = storage.prune_before(Utc::now() - ChronoDuration::hours(1)).unwrap();
        assert_eq!(report, PruneReport::default());
        assert_eq!(storage.count_packets().unwrap(), 1);
    }
}
