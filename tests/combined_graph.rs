//! Combined graphs built from every stored reception of a probe.
mod common;

use chrono::{Duration, Utc};
use common::{route_discovery, temp_storage, traceroute_record};
use meshtrace::config::Config;
use meshtrace::graph::{CombinedGraph, NodeRole};
use meshtrace::node_id::format_node_id;
use meshtrace::service::CollectorService;
use meshtrace::storage::{NodeRecord, Storage};
use meshtrace::traceroute::PathKind;

const A: u32 = 0x0000_00A1;
const B: u32 = 0x0000_00B2;
const PROBE: u32 = 0x5150;

fn store_reception(storage: &Storage, from: u32, to: u32, snr_raw: i32, gateway: &str, minutes_ago: i64) {
    let rd = route_discovery(&[], &[snr_raw], &[], &[]);
    let mut record = traceroute_record(from, to, &rd, Utc::now() - Duration::minutes(minutes_ago));
    record.probe_id = Some(PROBE);
    record.gateway_id = Some(gateway.to_string());
    storage.insert_packet(&record).unwrap();
}

#[test]
fn opposite_receptions_share_one_edge() {
    let (_dir, storage) = temp_storage();
    store_reception(&storage, A, B, -16, &format_node_id(B), 2);
    store_reception(&storage, B, A, 8, &format_node_id(A), 1);

    let records = storage.packets_by_probe(PROBE).unwrap();
    assert_eq!(records.len(), 2);
    let graph = CombinedGraph::build(&records);

    assert_eq!(graph.edges.len(), 1);
    let edge = graph.edge(A, B).unwrap();
    assert_eq!(edge.count, 2);
    assert!(edge.is_bidirectional);
    assert_eq!(edge.avg_snr, Some(-1.0));
    assert_eq!(graph.paths.len(), 2);
    assert!(graph.paths.iter().all(|p| p.kind == PathKind::CombinedRf && p.is_complete));
    assert_eq!(graph.source_node, Some(A));
}

#[test]
fn gateway_that_only_listened_is_a_node() {
    let (_dir, storage) = temp_storage();
    store_reception(&storage, A, B, 12, "!0000c0de", 1);
    // Non-node gateway ids never become graph nodes.
    store_reception(&storage, A, B, 12, "mqtt-bridge", 0);

    let graph = CombinedGraph::build(&storage.packets_by_probe(PROBE).unwrap());
    assert_eq!(graph.nodes.len(), 3);
    assert_eq!(graph.node(0xc0de).unwrap().role, NodeRole::Gateway);
    assert_eq!(graph.edge(A, B).unwrap().count, 2);
    assert!(graph.edge(A, 0xc0de).is_none());
}

#[test]
fn service_graph_resolves_names() {
    let storage = Storage::open_in_memory().unwrap();
    store_reception(&storage, A, B, 4, "!0000c0de", 1);
    let now = Utc::now();
    storage
        .upsert_node(&NodeRecord {
            node_id: A,
            hex_id: format_node_id(A),
            long_name: Some("Base Camp".into()),
            short_name: Some("BC".into()),
            hw_model: None,
            role: None,
            is_licensed: None,
            primary_channel: None,
            first_seen: now,
            last_updated: now,
        })
        .unwrap();

    let service = CollectorService::with_storage(Config::default(), storage);
    let graph = service.probe_graph(PROBE).unwrap();
    assert_eq!(graph.node(A).unwrap().name.as_deref(), Some("Base Camp"));
    assert!(service.probe_graph(0xdead).is_err());
}
