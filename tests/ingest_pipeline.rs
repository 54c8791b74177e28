//! End-to-end ingestion: envelopes in, `packet_history`/`node_info` rows out.
mod common;

use chrono::{Duration, Utc};
use common::{data, envelope_bytes, sealed_packet, temp_storage, GATEWAY, TOPIC};
use meshtrace::crypto::DEFAULT_CHANNEL_KEY;
use meshtrace::ingest::{IngestOutcome, Ingestor, NodeDirectory, PacketStatus};
use meshtrace::metrics::IngestStats;
use meshtrace::protobuf::meshtastic_generated as proto;
use meshtrace::storage::Storage;
use meshtrace::traceroute::TraceroutePacket;
use prost::Message;
use std::sync::Arc;

fn ingestor(storage: &Storage, keys: &[&str]) -> Ingestor {
    Ingestor::new(
        storage.clone(),
        keys.iter().map(|k| k.to_string()).collect(),
        Arc::new(NodeDirectory::new(storage.clone())),
        Arc::new(IngestStats::new()),
    )
}

fn stored_id(outcome: IngestOutcome, expected: PacketStatus) -> i64 {
    match outcome {
        IngestOutcome::Stored { record_id, status } => {
            assert_eq!(status, expected);
            record_id
        }
        other => panic!("expected stored packet, got {:?}", other),
    }
}

#[test]
fn encrypted_traceroute_is_decrypted_and_reconstructable() {
    let (_dir, storage) = temp_storage();
    let ing = ingestor(&storage, &[DEFAULT_CHANNEL_KEY]);

    let rd = common::route_discovery(&[0x111], &[-20, -32], &[], &[]);
    let packet = sealed_packet(
        0x1234_5678,
        0x8765_4321,
        0xCAFE,
        &data(proto::PortNum::TracerouteApp, rd.encode_to_vec()),
        "LongFast",
        DEFAULT_CHANNEL_KEY,
    );
    let outcome = ing.handle(TOPIC, &envelope_bytes(packet, "LongFast"), Utc::now()).unwrap();
    let id = stored_id(outcome, PacketStatus::Decrypted);

    let record = storage.get_packet(id).unwrap().unwrap();
    assert!(record.processed_successfully);
    assert_eq!(record.portnum_name.as_deref(), Some("TRACEROUTE_APP"));
    assert_eq!(record.probe_id, Some(0xCAFE));
    assert_eq!(record.gateway_id.as_deref(), Some(GATEWAY));
    assert_eq!(record.hop_start, Some(3));
    assert_eq!(record.hop_limit, Some(2));
    assert_eq!(record.rssi, Some(-97));
    assert_eq!(record.snr, Some(6.25));
    assert!(!record.raw_service_envelope.is_empty());

    let tr = TraceroutePacket::from_record(&record);
    assert!(tr.is_complete());
    assert_eq!(tr.hop_snr(0x111, 0x8765_4321), Some(-8.0));

    let stats = ing.stats().snapshot();
    assert_eq!((stats.received, stats.decoded, stats.decrypted), (1, 1, 1));
}

#[test]
fn topic_without_channel_tries_plain_key_first() {
    let storage = Storage::open_in_memory().unwrap();
    let ing = ingestor(&storage, &[DEFAULT_CHANNEL_KEY]);

    let text = "ping from the ridge, ".repeat(5);
    let packet = sealed_packet(7, 8, 9, &data(proto::PortNum::TextMessageApp, text.into_bytes()), "", DEFAULT_CHANNEL_KEY);
    let outcome = ing
        .handle("msh/US/2/e/!abcd1234", &envelope_bytes(packet, "LongFast"), Utc::now())
        .unwrap();
    stored_id(outcome, PacketStatus::Decrypted);

    // Same topic shape, but the sender used the envelope's channel for derivation.
    let text = "second message on a named channel ".repeat(4);
    let packet = sealed_packet(7, 8, 10, &data(proto::PortNum::TextMessageApp, text.into_bytes()), "Hikers", DEFAULT_CHANNEL_KEY);
    let outcome = ing
        .handle("msh/US/2/e/!abcd1234", &envelope_bytes(packet, "Hikers"), Utc::now())
        .unwrap();
    stored_id(outcome, PacketStatus::Decrypted);
}

#[test]
fn unknown_key_is_stored_opaque() {
    let storage = Storage::open_in_memory().unwrap();
    let ing = ingestor(&storage, &[DEFAULT_CHANNEL_KEY]);

    let text = "only the private channel can read this ".repeat(4);
    let packet = sealed_packet(
        0x42,
        0x43,
        0x44,
        &data(proto::PortNum::TextMessageApp, text.into_bytes()),
        "Private",
        "c2VjcmV0c2VjcmV0c2VjcmV0c2VjcmV0MTIzNDU2Nzg=",
    );
    let outcome = ing.handle(TOPIC, &envelope_bytes(packet, "LongFast"), Utc::now()).unwrap();
    let id = stored_id(outcome, PacketStatus::Opaque);

    let record = storage.get_packet(id).unwrap().unwrap();
    assert_eq!(record.portnum_name.as_deref(), Some("UNKNOWN_APP"));
    assert!(record.processed_successfully);
    assert!(record.payload_length > 0);
    assert_eq!(ing.stats().snapshot().opaque, 1);
}

#[test]
fn every_message_is_persisted_exactly_once() {
    let storage = Storage::open_in_memory().unwrap();
    let ing = ingestor(&storage, &[DEFAULT_CHANNEL_KEY]);
    let now = Utc::now();

    ing.handle(TOPIC, b"not protobuf at all \xff\xff", now).unwrap();
    ing.handle("msh/US/2/json/LongFast/!abcd1234", b"{\"from\":1}", now).unwrap();
    let packet = sealed_packet(1, 2, 3, &data(proto::PortNum::TextMessageApp, b"hello".to_vec()), "LongFast", DEFAULT_CHANNEL_KEY);
    ing.handle(TOPIC, &envelope_bytes(packet, "LongFast"), now).unwrap();

    // JSON is skipped; the other two each produce one row.
    assert_eq!(storage.count_packets().unwrap(), 2);
    let snap = ing.stats().snapshot();
    assert_eq!(snap.received, 3);
    assert_eq!(snap.skipped_json, 1);
    assert_eq!(snap.failed, 1);
}

#[test]
fn node_info_merges_without_erasing() {
    let storage = Storage::open_in_memory().unwrap();
    let ing = ingestor(&storage, &[DEFAULT_CHANNEL_KEY]);
    let t0 = Utc::now() - Duration::hours(1);

    let full = proto::User {
        id: "!00000042".into(),
        long_name: "Hilltop Relay".into(),
        short_name: "HTR".into(),
        hw_model: proto::HardwareModel::Rak4631 as i32,
        role: proto::config::device_config::Role::Router as i32,
        is_licensed: true,
        ..Default::default()
    };
    let packet = sealed_packet(0x42, 0xFFFF_FFFF, 1, &data(proto::PortNum::NodeinfoApp, full.encode_to_vec()), "LongFast", DEFAULT_CHANNEL_KEY);
    ing.handle(TOPIC, &envelope_bytes(packet, "LongFast"), t0).unwrap();

    // Later announcement with blank names and default role/licence must not wipe them.
    let sparse = proto::User {
        id: "!00000042".into(),
        long_name: "".into(),
        short_name: " ".into(),
        role: 0,
        is_licensed: false,
        ..Default::default()
    };
    let packet = sealed_packet(0x42, 0xFFFF_FFFF, 2, &data(proto::PortNum::NodeinfoApp, sparse.encode_to_vec()), "LongFast", DEFAULT_CHANNEL_KEY);
    ing.handle(TOPIC, &envelope_bytes(packet, "LongFast"), Utc::now()).unwrap();

    let node = storage.get_node(0x42).unwrap().unwrap();
    assert_eq!(node.long_name.as_deref(), Some("Hilltop Relay"));
    assert_eq!(node.short_name.as_deref(), Some("HTR"));
    assert_eq!(node.hw_model.as_deref(), Some("RAK4631"));
    assert_eq!(node.role.as_deref(), Some("ROUTER"));
    assert_eq!(node.is_licensed, Some(true));
    assert_eq!(node.primary_channel.as_deref(), Some("LongFast"));
    assert!(node.last_updated > node.first_seen);
    assert_eq!(storage.count_nodes().unwrap(), 1);
    assert_eq!(ing.directory().label(0x42), "Hilltop Relay");
}
