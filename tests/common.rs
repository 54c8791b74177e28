//! Test utilities & fixtures.
//! Builders for traceroute records and sealed MQTT envelopes, plus on-disk stores.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use meshtrace::crypto;
use meshtrace::protobuf::meshtastic_generated as proto;
use meshtrace::storage::{PacketRecord, Storage};
use prost::Message;

pub const GATEWAY: &str = "!abcd1234";
pub const TOPIC: &str = "msh/US/2/e/LongFast/!abcd1234";

/// A store in a fresh temp dir; keep the `TempDir` alive for the test's duration.
#[allow(dead_code)]
pub fn temp_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(dir.path().join("meshtrace.db")).expect("open store");
    (dir, storage)
}

/// Route discovery with SNR already in quarter-dB wire units.
#[allow(dead_code)]
pub fn route_discovery(route: &[u32], snr_towards: &[i32], route_back: &[u32], snr_back: &[i32]) -> proto::RouteDiscovery {
    proto::RouteDiscovery {
        route: route.to_vec(),
        snr_towards: snr_towards.to_vec(),
        route_back: route_back.to_vec(),
        snr_back: snr_back.to_vec(),
    }
}

#[allow(dead_code)]
pub fn traceroute_record(from: u32, to: u32, rd: &proto::RouteDiscovery, at: DateTime<Utc>) -> PacketRecord {
    let mut r = PacketRecord::new(TOPIC, at);
    r.from_node_id = Some(from);
    r.to_node_id = Some(to);
    r.portnum = Some(proto::PortNum::TracerouteApp as i32);
    r.portnum_name = Some("TRACEROUTE_APP".into());
    r.gateway_id = Some(GATEWAY.into());
    r.raw_payload = rd.encode_to_vec();
    r.payload_length = r.raw_payload.len();
    r.processed_successfully = true;
    r
}

/// Mesh packet whose `Data` is encrypted under `channel`'s derivation of `base_key`.
#[allow(dead_code)]
pub fn sealed_packet(from: u32, to: u32, id: u32, data: &proto::Data, channel: &str, base_key: &str) -> proto::MeshPacket {
    let key = crypto::derive_key(channel, base_key);
    let ciphertext = crypto::encrypt(&data.encode_to_vec(), id, from, &key);
    proto::MeshPacket {
        from,
        to,
        id,
        hop_limit: 2,
        hop_start: 3,
        rx_snr: 6.25,
        rx_rssi: -97,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(Bytes::from(ciphertext))),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn envelope_bytes(packet: proto::MeshPacket, channel_id: &str) -> Vec<u8> {
    proto::ServiceEnvelope {
        packet: Some(packet),
        channel_id: channel_id.to_string(),
        gateway_id: GATEWAY.to_string(),
    }
    .encode_to_vec()
}

#[allow(dead_code)]
pub fn data(port: proto::PortNum, payload: Vec<u8>) -> proto::Data {
    proto::Data {
        portnum: port as i32,
        payload: Bytes::from(payload),
        ..Default::default()
    }
}
