//! # Combined Graph Builder
//!
//! Merges many receptions of a traceroute probe (typically every record sharing one
//! `probe_id`) into a single node/edge graph. Only actual RF hops contribute: a display hop that
//! never transmitted has no place in a link graph.

use log::debug;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::node_id::{format_node_id, gateway_node_id};
use crate::storage::PacketRecord;
use crate::traceroute::{NodeNameLookup, PathKind, TraceroutePacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Router,
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: u32,
    pub hex_id: String,
    pub name: Option<String>,
    pub role: NodeRole,
    pub is_source: bool,
    pub is_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionCount {
    pub from: u32,
    pub to: u32,
    pub count: usize,
}

/// Aggregated link between two nodes; `node_a < node_b`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub node_a: u32,
    pub node_b: u32,
    pub count: usize,
    pub snr_samples: Vec<f64>,
    pub avg_snr: Option<f64>,
    /// Observed directions in first-seen order.
    pub directions: Vec<DirectionCount>,
    pub majority_from: u32,
    pub majority_to: u32,
    pub is_bidirectional: bool,
}

impl GraphEdge {
    fn new(a: u32, b: u32) -> Self {
        let (node_a, node_b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            node_a,
            node_b,
            count: 0,
            snr_samples: Vec::new(),
            avg_snr: None,
            directions: Vec::new(),
            majority_from: a,
            majority_to: b,
            is_bidirectional: false,
        }
    }

    fn observe(&mut self, from: u32, to: u32, snr: Option<f64>) {
        self.count += 1;
        if let Some(snr) = snr {
            self.snr_samples.push(snr);
        }
        match self.directions.iter_mut().find(|d| d.from == from && d.to == to) {
            Some(d) => d.count += 1,
            None => self.directions.push(DirectionCount { from, to, count: 1 }),
        }
    }

    fn finish(&mut self) {
        self.avg_snr = mean(&self.snr_samples);
        // Ties go to the direction seen first.
        let mut best: Option<&DirectionCount> = None;
        for d in &self.directions {
            if best.map_or(true, |b| d.count > b.count) {
                best = Some(d);
            }
        }
        if let Some(best) = best {
            self.majority_from = best.from;
            self.majority_to = best.to;
        }
        self.is_bidirectional = self.directions.len() > 1;
    }
}

/// One reception's RF route, kept separate for per-observation highlighting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphPath {
    pub packet_id: i64,
    pub gateway_id: Option<String>,
    pub kind: PathKind,
    pub node_ids: Vec<u32>,
    pub avg_snr: Option<f64>,
    pub hop_count: usize,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinedGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub paths: Vec<GraphPath>,
    pub source_node: Option<u32>,
    pub target_node: Option<u32>,
}

impl CombinedGraph {
    /// Build from persisted records; each must carry its raw traceroute payload. Malformed
    /// payloads contribute an empty path rather than failing the build.
    pub fn build(records: &[PacketRecord]) -> Self {
        let packets: Vec<TraceroutePacket> = records.iter().map(TraceroutePacket::from_record).collect();
        Self::from_packets(&packets)
    }

    pub fn from_packets(packets: &[TraceroutePacket]) -> Self {
        let gateways: HashSet<u32> = packets
            .iter()
            .filter_map(|p| p.gateway_id.as_deref().and_then(gateway_node_id))
            .collect();

        let mut node_order: Vec<u32> = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut edge_index: HashMap<(u32, u32), usize> = HashMap::new();
        let mut paths = Vec::with_capacity(packets.len());

        for packet in packets {
            for hop in packet.rf_hops() {
                for id in [hop.from_node, hop.to_node] {
                    if seen.insert(id) {
                        node_order.push(id);
                    }
                }
                let key = unordered(hop.from_node, hop.to_node);
                let idx = *edge_index.entry(key).or_insert_with(|| {
                    edges.push(GraphEdge::new(hop.from_node, hop.to_node));
                    edges.len() - 1
                });
                edges[idx].observe(hop.from_node, hop.to_node, hop.snr);
            }

            let samples: Vec<f64> = packet.rf_hops().iter().filter_map(|h| h.snr).collect();
            paths.push(GraphPath {
                packet_id: packet.packet_id,
                gateway_id: packet.gateway_id.clone(),
                kind: PathKind::CombinedRf,
                node_ids: packet.rf_path.node_ids.clone(),
                avg_snr: mean(&samples),
                hop_count: packet.rf_path.hop_count(),
                is_complete: packet.is_complete(),
            });
        }

        // Gateways that heard the probe but never relayed it.
        let mut gateway_only: Vec<u32> = gateways.iter().copied().filter(|id| !seen.contains(id)).collect();
        gateway_only.sort_unstable();
        node_order.extend(gateway_only);

        for edge in edges.iter_mut() {
            edge.finish();
        }

        let source_node = packets.first().map(|p| p.from_node_id);
        let target_node = packets.first().map(|p| p.to_node_id);

        let nodes = node_order
            .into_iter()
            .map(|id| GraphNode {
                id,
                hex_id: format_node_id(id),
                name: None,
                role: if gateways.contains(&id) {
                    NodeRole::Gateway
                } else {
                    NodeRole::Router
                },
                is_source: Some(id) == source_node,
                is_target: Some(id) == target_node,
            })
            .collect::<Vec<_>>();

        debug!(
            "Combined graph from {} packets: {} nodes, {} edges",
            packets.len(),
            nodes.len(),
            edges.len()
        );

        Self {
            nodes,
            edges,
            paths,
            source_node,
            target_node,
        }
    }

    pub fn node(&self, id: u32) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, a: u32, b: u32) -> Option<&GraphEdge> {
        let (lo, hi) = unordered(a, b);
        self.edges.iter().find(|e| e.node_a == lo && e.node_b == hi)
    }

    pub fn resolve_names(&mut self, lookup: &dyn NodeNameLookup) {
        for node in self.nodes.iter_mut() {
            node.name = lookup.display_name(node.id);
        }
    }
}

fn unordered(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
