//! # Ingest Module - Packet Ingestion Pipeline
//!
//! One transport message in, exactly one `packet_history` row out (JSON-feed topics excepted,
//! which are skipped before anything is decoded). The per-message flow is:
//!
//! ```text
//! received ── envelope ok ──┬─ decoded payload ───────────────────────► stored (success)
//!    │                      └─ ciphertext ─ try keys ─┬─ decrypted ───► stored (success)
//!    │                                                └─ exhausted ───► stored (opaque)
//!    └─ envelope error ───────────────────────────────────────────────► stored (failure + error)
//! ```
//!
//! Identity announcements (`NODEINFO_APP`) additionally merge into `node_info`.

mod directory;

pub use directory::NodeDirectory;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::sync::Arc;

use crate::crypto;
use crate::decode::{self, AppPayload};
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics::IngestStats;
use crate::node_id::{format_node_id, parse_node_id};
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::{NodeRecord, PacketRecord, Storage, StorageError};
use crate::topic::{describe_message_type, is_json_topic, TopicInfo};

/// How a stored message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    Decoded,
    Decrypted,
    /// Still encrypted after every candidate key.
    Opaque,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    SkippedJson,
    Stored { record_id: i64, status: PacketStatus },
}

pub struct Ingestor {
    storage: Storage,
    keys: Vec<String>,
    directory: Arc<NodeDirectory>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(storage: Storage, keys: Vec<String>, directory: Arc<NodeDirectory>, stats: Arc<IngestStats>) -> Self {
        Self {
            storage,
            keys,
            directory,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    /// Process one message received on `topic` at `received_at`.
    ///
    /// Only a storage failure is an error; decode and decrypt failures are recorded on the
    /// stored row.
    pub fn handle(&self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> Result<IngestOutcome, StorageError> {
        self.stats.inc_received();

        if is_json_topic(topic) {
            self.stats.inc_skipped_json();
            trace!("Skipping JSON topic {}", escape_log(topic));
            return Ok(IngestOutcome::SkippedJson);
        }

        let info = TopicInfo::parse(topic);
        let mut record = PacketRecord::new(topic, received_at);
        record.message_type = info.message_type.clone();
        record.raw_service_envelope = payload.to_vec();

        let status = match decode::decode_envelope(payload) {
            Err(e) => {
                warn!(
                    "Undecodable envelope on {} ({} bytes, {}): {}",
                    escape_log(topic),
                    payload.len(),
                    hex_snippet(payload, 12),
                    e
                );
                record.parsing_error = Some(e.to_string());
                PacketStatus::Failed
            }
            Ok((envelope, packet)) => self.process_packet(&info, envelope, packet, &mut record, received_at),
        };

        match status {
            PacketStatus::Decoded => self.stats.inc_decoded(),
            PacketStatus::Decrypted => {
                self.stats.inc_decoded();
                self.stats.inc_decrypted();
            }
            PacketStatus::Opaque => self.stats.inc_opaque(),
            PacketStatus::Failed => self.stats.inc_failed(),
        }

        let record_id = self.storage.insert_packet(&record).map_err(|e| {
            self.stats.inc_store_errors();
            e
        })?;
        Ok(IngestOutcome::Stored { record_id, status })
    }

    fn process_packet(
        &self,
        info: &TopicInfo,
        envelope: proto::ServiceEnvelope,
        mut packet: proto::MeshPacket,
        record: &mut PacketRecord,
        received_at: DateTime<Utc>,
    ) -> PacketStatus {
        record.gateway_id = non_empty(&envelope.gateway_id);
        record.channel_id = non_empty(&envelope.channel_id);
        record.from_node_id = Some(packet.from);
        record.to_node_id = Some(packet.to);
        record.probe_id = (packet.id != 0).then_some(packet.id);
        record.rssi = (packet.rx_rssi != 0).then_some(packet.rx_rssi);
        record.snr = (packet.rx_snr != 0.0).then_some(packet.rx_snr as f64);
        record.hop_limit = Some(packet.hop_limit);
        record.hop_start = (packet.hop_start != 0).then_some(packet.hop_start);

        let mut decrypted = false;
        if decode::is_decryption_candidate(&packet) {
            decrypted = self.decrypt(&mut packet, info, &envelope);
        }

        let data = match packet.payload_variant.take() {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => data,
            Some(proto::mesh_packet::PayloadVariant::Encrypted(ciphertext)) => {
                debug!(
                    "Packet {:08x} from {} stays encrypted ({} bytes, {})",
                    packet.id,
                    format_node_id(packet.from),
                    ciphertext.len(),
                    describe_message_type(info.message_type.as_deref().unwrap_or(""))
                );
                record.portnum = Some(proto::PortNum::UnknownApp as i32);
                record.portnum_name = Some(proto::PortNum::UnknownApp.as_str_name().to_string());
                record.payload_length = ciphertext.len();
                record.raw_payload = ciphertext.to_vec();
                record.processed_successfully = true;
                return PacketStatus::Opaque;
            }
            None => {
                record.parsing_error = Some("mesh packet carries no payload".to_string());
                return PacketStatus::Failed;
            }
        };

        let port = proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp);
        record.portnum = Some(data.portnum);
        record.portnum_name = Some(port.as_str_name().to_string());
        record.payload_length = data.payload.len();
        record.raw_payload = data.payload.to_vec();

        match AppPayload::decode(port, &data.payload) {
            Ok(app) => {
                record.processed_successfully = true;
                if let AppPayload::NodeInfo(user) = &app {
                    self.record_node(&packet, user, info, &envelope, received_at);
                }
                info!(
                    "{} -> {} via {}: {}",
                    escape_log(&self.directory.label(packet.from)),
                    self.describe_destination(packet.to),
                    escape_log(record.gateway_id.as_deref().unwrap_or("?")),
                    escape_log(&app.summary())
                );
                if decrypted {
                    PacketStatus::Decrypted
                } else {
                    PacketStatus::Decoded
                }
            }
            Err(e) => {
                warn!(
                    "Packet {:08x} from {}: {}",
                    packet.id,
                    format_node_id(packet.from),
                    e
                );
                record.parsing_error = Some(e.to_string());
                PacketStatus::Failed
            }
        }
    }

    /// Try the candidate keys against the packet. With a channel name from the topic, derive
    /// for that channel; otherwise try the plain keys first and the envelope's channel second.
    fn decrypt(&self, packet: &mut proto::MeshPacket, info: &TopicInfo, envelope: &proto::ServiceEnvelope) -> bool {
        let attempts: Vec<&str> = match info.channel_name.as_deref() {
            Some(channel) => vec![channel],
            None if !envelope.channel_id.is_empty() => vec!["", envelope.channel_id.as_str()],
            None => vec![""],
        };
        let ok = attempts
            .into_iter()
            .any(|channel| crypto::try_decrypt(packet, channel, &self.keys));
        if ok {
            debug!("Decrypted packet {:08x} from {}", packet.id, format_node_id(packet.from));
        }
        ok
    }

    fn record_node(
        &self,
        packet: &proto::MeshPacket,
        user: &proto::User,
        info: &TopicInfo,
        envelope: &proto::ServiceEnvelope,
        seen_at: DateTime<Utc>,
    ) {
        let node_id = if packet.from != 0 {
            packet.from
        } else {
            match parse_node_id(&user.id) {
                Some(id) => id,
                None => {
                    debug!("NODEINFO without usable sender id: {}", escape_log(&user.id));
                    return;
                }
            }
        };

        let node = NodeRecord {
            node_id,
            hex_id: format_node_id(node_id),
            long_name: non_empty(&user.long_name),
            short_name: non_empty(&user.short_name),
            hw_model: proto::HardwareModel::try_from(user.hw_model)
                .ok()
                .filter(|m| *m != proto::HardwareModel::Unset)
                .map(|m| m.as_str_name().to_string()),
            // Proto3 defaults mean "not announced" and must not overwrite known values.
            role: (user.role != 0)
                .then(|| proto::config::device_config::Role::try_from(user.role).ok())
                .flatten()
                .map(|r| r.as_str_name().to_string()),
            is_licensed: user.is_licensed.then_some(true),
            primary_channel: info.channel_name.clone().or_else(|| non_empty(&envelope.channel_id)),
            first_seen: seen_at,
            last_updated: seen_at,
        };

        match self.storage.upsert_node(&node) {
            Ok(()) => {
                self.stats.inc_nodes_updated();
                if let Some(name) = node.display_name() {
                    self.directory.remember(node_id, name);
                }
            }
            Err(e) => {
                self.stats.inc_store_errors();
                warn!("Failed to update node {}: {}", node.hex_id, e);
            }
        }
    }

    fn describe_destination(&self, to: u32) -> String {
        if to == crate::node_id::BROADCAST_NODE_ID {
            "broadcast".to_string()
        } else {
            escape_log(&self.directory.label(to))
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use prost::Message;

    fn ingestor() -> Ingestor {
        let storage = Storage::open_in_memory().unwrap();
        let directory = Arc::new(NodeDirectory::new(storage.clone()));
        Ingestor::new(
            storage,
            vec![crypto::DEFAULT_CHANNEL_KEY.to_string()],
            directory,
            Arc::new(IngestStats::new()),
        )
    }

    fn envelope(packet: proto::MeshPacket) -> Vec<u8> {
        proto::ServiceEnvelope {
            packet: Some(packet),
            channel_id: "LongFast".into(),
            gateway_id: "!abcd1234".into(),
        }
        .encode_to_vec()
    }

    #[test]
    fn json_topics_are_skipped_without_storing() {
        let ing = ingestor();
        let out = ing.handle("msh/US/2/json/LongFast/!abcd1234", b"{}", Utc::now()).unwrap();
        assert_eq!(out, IngestOutcome::SkippedJson);
        assert_eq!(ing.storage.count_packets().unwrap(), 0);
        assert_eq!(ing.stats.snapshot().skipped_json, 1);
    }

    #[test]
    fn garbage_is_stored_with_error() {
        let ing = ingestor();
        let out = ing.handle("msh/US/2/e/LongFast/!abcd1234", &[0xff, 0xff, 0xff], Utc::now()).unwrap();
        let id = match out {
            IngestOutcome::Stored { record_id, status } => {
                assert_eq!(status, PacketStatus::Failed);
                record_id
            }
            other => panic!("unexpected {:?}", other),
        };
        let rec = ing.storage.get_packet(id).unwrap().unwrap();
        assert!(!rec.processed_successfully);
        assert!(rec.parsing_error.is_some());
        assert_eq!(rec.raw_service_envelope, vec![0xff, 0xff, 0xff]);
        assert_eq!(rec.message_type.as_deref(), Some("e"));
    }

    #[test]
    fn decoded_text_is_stored() {
        let ing = ingestor();
        let packet = proto::MeshPacket {
            from: 0x11,
            to: crate::node_id::BROADCAST_NODE_ID,
            id: 77,
            hop_limit: 3,
            hop_start: 3,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::from_static(b"hi"),
                ..Default::default()
            })),
            ..Default::default()
        };
        let out = ing.handle("msh/US/2/c/LongFast/!abcd1234", &envelope(packet), Utc::now()).unwrap();
        let IngestOutcome::Stored { record_id, status } = out else {
            panic!("not stored");
        };
        assert_eq!(status, PacketStatus::Decoded);
        let rec = ing.storage.get_packet(record_id).unwrap().unwrap();
        assert_eq!(rec.portnum_name.as_deref(), Some("TEXT_MESSAGE_APP"));
        assert_eq!(rec.probe_id, Some(77));
        assert_eq!(rec.gateway_id.as_deref(), Some("!abcd1234"));
        assert_eq!(rec.raw_payload, b"hi".to_vec());
        assert!(rec.processed_successfully);
    }

    #[test]
    fn packet_without_payload_is_a_failure() {
        let ing = ingestor();
        let packet = proto::MeshPacket {
            from: 0x11,
            to: 0x22,
            ..Default::default()
        };
        let out = ing.handle("msh/US/2/e/LongFast/!abcd1234", &envelope(packet), Utc::now()).unwrap();
        assert!(matches!(
            out,
            IngestOutcome::Stored {
                status: PacketStatus::Failed,
                ..
            }
        ));
    }
}
