//! # Traceroute Path Reconstruction
//!
//! A `TRACEROUTE_APP` payload ([`proto::RouteDiscovery`]) accumulates the nodes a probe passed
//! and one SNR sample per radio hop that actually happened. The two lists disagree on purpose:
//! `route` names the relays, while the number of SNR samples says how far the probe really got.
//! [`TraceroutePacket`] turns one persisted reception into three views:
//!
//! - the **forward display path**, following the firmware's display convention,
//! - the **return path**, when the reply leg carries data,
//! - the **actual RF path**, built only from hops that have an SNR sample.
//!
//! Hop queries ([`TraceroutePacket::contains_hop`], [`TraceroutePacket::hop_snr`]) only ever
//! look at the RF hops, so an intended-but-unobserved hop never counts as a link.
//!
//! SNR samples are quarter-dB integers on the wire and are scaled to dB by
//! [`RouteRecord::from_wire`]; `-128` is the firmware's "unknown" marker and becomes `None`.

use chrono::{DateTime, Utc};
use log::{debug, trace};
use prost::Message;
use serde::Serialize;

use crate::location::{LocationCache, LocationSource, NodeLocation};
use crate::node_id::format_node_id;
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::PacketRecord;

/// Raw SNR value the firmware writes when it has no measurement.
pub const SNR_UNKNOWN_RAW: i32 = -128;

/// Resolves node ids to display names for [`Path::resolve_names`].
pub trait NodeNameLookup {
    fn display_name(&self, node_id: u32) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopDirection {
    Forward,
    Return,
    ForwardRf,
    ReturnRf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    Forward,
    ForwardWithReturn,
    Return,
    ForwardRf,
    ReturnRf,
    CombinedRf,
}

impl PathKind {
    pub fn is_rf(self) -> bool {
        matches!(self, PathKind::ForwardRf | PathKind::ReturnRf | PathKind::CombinedRf)
    }
}

/// Route-accumulation fields of a traceroute payload, SNR already in dB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteRecord {
    pub route_nodes: Vec<u32>,
    pub snr_towards: Vec<Option<f64>>,
    pub route_back: Vec<u32>,
    pub snr_back: Vec<Option<f64>>,
}

impl RouteRecord {
    /// Build from SNR values that are already in dB.
    pub fn new(route_nodes: Vec<u32>, snr_towards: Vec<f64>, route_back: Vec<u32>, snr_back: Vec<f64>) -> Self {
        Self {
            route_nodes,
            snr_towards: snr_towards.into_iter().map(Some).collect(),
            route_back,
            snr_back: snr_back.into_iter().map(Some).collect(),
        }
    }

    /// Build from the wire message, scaling quarter-dB samples to dB.
    pub fn from_wire(rd: &proto::RouteDiscovery) -> Self {
        Self {
            route_nodes: rd.route.clone(),
            snr_towards: rd.snr_towards.iter().copied().map(scale_snr).collect(),
            route_back: rd.route_back.clone(),
            snr_back: rd.snr_back.iter().copied().map(scale_snr).collect(),
        }
    }

    pub fn try_parse(payload: &[u8]) -> Result<Self, prost::DecodeError> {
        proto::RouteDiscovery::decode(payload).map(|rd| Self::from_wire(&rd))
    }

    /// Parse a payload, degrading to an empty record when it is malformed.
    pub fn parse(payload: &[u8]) -> Self {
        match Self::try_parse(payload) {
            Ok(record) => record,
            Err(e) => {
                debug!("Malformed traceroute payload ({} bytes): {}", payload.len(), e);
                Self::default()
            }
        }
    }

    pub fn has_return_data(&self) -> bool {
        !self.route_back.is_empty()
    }
}

fn scale_snr(raw: i32) -> Option<f64> {
    if raw == SNR_UNKNOWN_RAW {
        None
    } else {
        Some(raw as f64 / 4.0)
    }
}

/// One link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub from_node: u32,
    pub to_node: u32,
    pub snr: Option<f64>,
    pub direction: HopDirection,
    pub distance_meters: Option<f64>,
    /// Why `distance_meters` is missing, when it is.
    pub distance_note: Option<String>,
    pub from_location_age_secs: Option<i64>,
    pub to_location_age_secs: Option<i64>,
    pub location_warning: Option<String>,
}

impl Hop {
    pub fn new(from_node: u32, to_node: u32, snr: Option<f64>, direction: HopDirection) -> Self {
        Self {
            from_node,
            to_node,
            snr,
            direction,
            distance_meters: None,
            distance_note: None,
            from_location_age_secs: None,
            to_location_age_secs: None,
            location_warning: None,
        }
    }

    /// True when this hop links `a` and `b`, in either direction.
    pub fn connects(&self, a: u32, b: u32) -> bool {
        (self.from_node == a && self.to_node == b) || (self.from_node == b && self.to_node == a)
    }

    fn apply_locations(&mut self, at: DateTime<Utc>, from: Option<&NodeLocation>, to: Option<&NodeLocation>) {
        self.from_location_age_secs = from.map(|l| l.age_at(at).num_seconds());
        self.to_location_age_secs = to.map(|l| l.age_at(at).num_seconds());

        let warnings: Vec<String> = [from, to]
            .iter()
            .flatten()
            .filter_map(|l| l.age_warning.clone())
            .collect();
        self.location_warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        };

        match (from, to) {
            (Some(a), Some(b)) => {
                self.distance_meters = Some(a.distance_to(b));
                self.distance_note = None;
            }
            _ => {
                let missing: Vec<String> = [(self.from_node, from), (self.to_node, to)]
                    .iter()
                    .filter(|(_, loc)| loc.is_none())
                    .map(|(id, _)| format_node_id(*id))
                    .collect();
                self.distance_meters = None;
                self.distance_note = Some(format!("no location for {}", missing.join(", ")));
            }
        }
    }
}

/// An ordered walk through the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Path {
    pub kind: PathKind,
    pub node_ids: Vec<u32>,
    /// Parallel to `node_ids`; filled by [`Path::resolve_names`].
    pub node_names: Vec<Option<String>>,
    pub hops: Vec<Hop>,
    pub is_complete: bool,
}

impl Path {
    /// Path over `nodes` with one hop per adjacent pair; hop `i` takes `snrs[i]` if present.
    fn from_nodes(kind: PathKind, nodes: Vec<u32>, snrs: &[Option<f64>], direction: HopDirection, is_complete: bool) -> Self {
        let hops = nodes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| Hop::new(pair[0], pair[1], snrs.get(i).copied().flatten(), direction))
            .collect();
        Self {
            kind,
            node_names: vec![None; nodes.len()],
            node_ids: nodes,
            hops,
            is_complete,
        }
    }

    /// Path whose nodes are the order-preserving, de-duplicated endpoints of `hops`.
    pub fn from_hops(kind: PathKind, hops: Vec<Hop>, is_complete: bool) -> Self {
        let mut node_ids: Vec<u32> = Vec::new();
        for hop in &hops {
            for id in [hop.from_node, hop.to_node] {
                if !node_ids.contains(&id) {
                    node_ids.push(id);
                }
            }
        }
        Self {
            kind,
            node_names: vec![None; node_ids.len()],
            node_ids,
            hops,
            is_complete,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn resolve_names(&mut self, lookup: &dyn NodeNameLookup) {
        self.node_names = self.node_ids.iter().map(|id| lookup.display_name(*id)).collect();
    }
}

/// One traceroute reception with its reconstructed paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceroutePacket {
    pub packet_id: i64,
    pub probe_id: Option<u32>,
    pub from_node_id: u32,
    pub to_node_id: u32,
    pub timestamp: DateTime<Utc>,
    pub gateway_id: Option<String>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub route: RouteRecord,
    pub forward_path: Path,
    pub return_path: Option<Path>,
    pub rf_path: Path,
}

impl TraceroutePacket {
    /// Reconstruct from a persisted record, parsing its raw payload.
    pub fn from_record(record: &PacketRecord) -> Self {
        if !record.is_traceroute() {
            trace!("Record {} is not a traceroute (portnum {:?})", record.id, record.portnum);
        }
        let route = RouteRecord::parse(&record.raw_payload);
        Self::from_record_with_route(record, route)
    }

    /// Reconstruct from a persisted record and an already parsed route.
    pub fn from_record_with_route(record: &PacketRecord, route: RouteRecord) -> Self {
        let from = record.from_node_id.unwrap_or(0);
        let to = record.to_node_id.unwrap_or(0);

        let forward_path = build_forward_path(from, to, &route);
        let return_path = build_return_path(from, to, &route);
        let rf_path = build_rf_path(from, to, &route, record.hop_start, record.hop_limit);

        Self {
            packet_id: record.id,
            probe_id: record.probe_id,
            from_node_id: from,
            to_node_id: to,
            timestamp: record.timestamp,
            gateway_id: record.gateway_id.clone(),
            hop_start: record.hop_start,
            hop_limit: record.hop_limit,
            route,
            forward_path,
            return_path,
            rf_path,
        }
    }

    pub fn has_return_path(&self) -> bool {
        self.route.has_return_data()
    }

    /// The probe has already passed its outward leg even though no return data was recorded.
    pub fn is_going_back(&self) -> bool {
        is_going_back(&self.route, self.hop_start, self.hop_limit)
    }

    /// More outward samples than route nodes: the final hop to the destination happened.
    pub fn forward_complete(&self) -> bool {
        self.route.snr_towards.len() > self.route.route_nodes.len()
    }

    pub fn return_complete(&self) -> bool {
        self.route.snr_back.len() > self.route.route_back.len()
    }

    /// Completion of what actually transmitted: both legs when a return leg exists.
    pub fn is_complete(&self) -> bool {
        self.rf_path.is_complete
    }

    pub fn rf_hops(&self) -> &[Hop] {
        &self.rf_path.hops
    }

    /// The actual RF hops split into their outward and return legs.
    pub fn rf_legs(&self) -> (Path, Option<Path>) {
        let (fwd, ret): (Vec<Hop>, Vec<Hop>) = self
            .rf_path
            .hops
            .iter()
            .cloned()
            .partition(|h| h.direction == HopDirection::ForwardRf);
        let forward = Path::from_hops(PathKind::ForwardRf, fwd, self.forward_complete());
        let back = if self.has_return_path() {
            Some(Path::from_hops(PathKind::ReturnRf, ret, self.return_complete()))
        } else {
            None
        };
        (forward, back)
    }

    /// Display hops of the forward path followed by those of the return path.
    pub fn display_hops(&self) -> Vec<&Hop> {
        self.forward_path
            .hops
            .iter()
            .chain(self.return_path.iter().flat_map(|p| p.hops.iter()))
            .collect()
    }

    /// Whether `a` and `b` were linked by an observed RF hop, in either direction.
    pub fn contains_hop(&self, a: u32, b: u32) -> bool {
        self.rf_path.hops.iter().any(|h| h.connects(a, b))
    }

    /// SNR of the first observed RF hop linking `a` and `b` (either direction) that has a
    /// known sample.
    pub fn hop_snr(&self, a: u32, b: u32) -> Option<f64> {
        self.rf_path
            .hops
            .iter()
            .find_map(|h| h.connects(a, b).then_some(h.snr).flatten())
    }

    pub fn resolve_names(&mut self, lookup: &dyn NodeNameLookup) {
        self.forward_path.resolve_names(lookup);
        if let Some(path) = self.return_path.as_mut() {
            path.resolve_names(lookup);
        }
        self.rf_path.resolve_names(lookup);
    }

    /// Annotate the hops of every path whose kind is listed in `kinds` with great-circle
    /// distances. Any RF kind selects the actual RF path. Safe to call repeatedly; missing
    /// locations leave the distance empty with a note. Returns the number of hops that got a
    /// distance.
    pub fn annotate_distances(
        &mut self,
        kinds: &[PathKind],
        source: &dyn LocationSource,
        mut cache: Option<&mut LocationCache>,
    ) -> usize {
        let at = self.timestamp;
        let wants_rf = kinds.iter().any(|k| k.is_rf());
        let mut annotated = 0;

        let mut paths: Vec<&mut Path> = Vec::new();
        if kinds.contains(&self.forward_path.kind) {
            paths.push(&mut self.forward_path);
        }
        if let Some(path) = self.return_path.as_mut() {
            if kinds.contains(&path.kind) {
                paths.push(path);
            }
        }
        if wants_rf {
            paths.push(&mut self.rf_path);
        }

        for path in paths {
            for hop in path.hops.iter_mut() {
                let from = lookup_location(source, cache.as_deref_mut(), hop.from_node, at);
                let to = lookup_location(source, cache.as_deref_mut(), hop.to_node, at);
                hop.apply_locations(at, from.as_ref(), to.as_ref());
                if hop.distance_meters.is_some() {
                    annotated += 1;
                }
            }
        }
        annotated
    }

    pub fn summary(&self) -> TracerouteSummary {
        TracerouteSummary {
            packet_id: self.packet_id,
            probe_id: self.probe_id,
            from_node_id: self.from_node_id,
            to_node_id: self.to_node_id,
            from_hex: format_node_id(self.from_node_id),
            to_hex: format_node_id(self.to_node_id),
            timestamp: self.timestamp,
            gateway_id: self.gateway_id.clone(),
            hop_start: self.hop_start,
            hop_limit: self.hop_limit,
            forward_nodes: self.forward_path.node_ids.clone(),
            return_nodes: self.return_path.as_ref().map(|p| p.node_ids.clone()),
            rf_nodes: self.rf_path.node_ids.clone(),
            forward_hop_count: self.forward_path.hop_count(),
            return_hop_count: self.return_path.as_ref().map(Path::hop_count),
            rf_hop_count: self.rf_path.hop_count(),
            forward_complete: self.forward_path.is_complete,
            return_complete: self.return_path.as_ref().map(|p| p.is_complete),
            is_complete: self.is_complete(),
            is_going_back: self.is_going_back(),
            rf_hops: self.rf_path.hops.clone(),
        }
    }
}

fn lookup_location(
    source: &dyn LocationSource,
    cache: Option<&mut LocationCache>,
    node_id: u32,
    at: DateTime<Utc>,
) -> Option<NodeLocation> {
    match cache {
        Some(cache) => cache.lookup(source, node_id, at),
        None => source.location_at(node_id, at),
    }
}

/// Plain, serializable view of one reconstructed traceroute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerouteSummary {
    pub packet_id: i64,
    pub probe_id: Option<u32>,
    pub from_node_id: u32,
    pub to_node_id: u32,
    pub from_hex: String,
    pub to_hex: String,
    pub timestamp: DateTime<Utc>,
    pub gateway_id: Option<String>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub forward_nodes: Vec<u32>,
    pub return_nodes: Option<Vec<u32>>,
    pub rf_nodes: Vec<u32>,
    pub forward_hop_count: usize,
    pub return_hop_count: Option<usize>,
    pub rf_hop_count: usize,
    pub forward_complete: bool,
    pub return_complete: Option<bool>,
    pub is_complete: bool,
    pub is_going_back: bool,
    pub rf_hops: Vec<Hop>,
}

fn is_going_back(route: &RouteRecord, hop_start: Option<u32>, hop_limit: Option<u32>) -> bool {
    let (start, limit) = match (hop_start, hop_limit) {
        (Some(s), Some(l)) => (s, l),
        _ => return false,
    };
    let consumed = start.saturating_sub(limit) as usize;
    route.snr_towards.len() > route.route_nodes.len() && route.route_nodes.len() > consumed
}

fn build_forward_path(from: u32, to: u32, route: &RouteRecord) -> Path {
    let is_complete = route.route_nodes.last() == Some(&to);
    if route.has_return_data() {
        // Return data means the outward leg is over: show it from the destination's side.
        let mut nodes = Vec::with_capacity(route.route_nodes.len() + 2);
        nodes.push(to);
        nodes.extend_from_slice(&route.route_nodes);
        nodes.push(from);
        Path::from_nodes(PathKind::ForwardWithReturn, nodes, &route.snr_towards, HopDirection::Forward, is_complete)
    } else {
        let mut nodes = Vec::with_capacity(route.route_nodes.len() + 1);
        nodes.push(from);
        nodes.extend_from_slice(&route.route_nodes);
        Path::from_nodes(PathKind::Forward, nodes, &route.snr_towards, HopDirection::Forward, is_complete)
    }
}

fn build_return_path(from: u32, to: u32, route: &RouteRecord) -> Option<Path> {
    if !route.has_return_data() {
        return None;
    }
    let closed = route.route_back.last() == Some(&from) || route.snr_back.len() > route.route_back.len();
    let mut nodes = Vec::with_capacity(route.route_back.len() + 2);
    nodes.push(from);
    nodes.extend_from_slice(&route.route_back);
    if closed {
        nodes.push(to);
    }
    Some(Path::from_nodes(PathKind::Return, nodes, &route.snr_back, HopDirection::Return, closed))
}

fn build_rf_path(from: u32, to: u32, route: &RouteRecord, hop_start: Option<u32>, hop_limit: Option<u32>) -> Path {
    let has_return = route.has_return_data();
    let going_back = is_going_back(route, hop_start, hop_limit);

    let outward: Vec<u32> = if route.route_nodes.is_empty() {
        match (route.snr_towards.is_empty(), has_return) {
            (true, _) => Vec::new(),
            // A direct hop heard while the probe was already on its way back.
            (false, true) => vec![to, from],
            (false, false) => vec![from, to],
        }
    } else if has_return || going_back {
        let mut nodes = vec![to];
        nodes.extend_from_slice(&route.route_nodes);
        nodes.push(from);
        nodes
    } else {
        let mut nodes = vec![from];
        nodes.extend_from_slice(&route.route_nodes);
        nodes.push(to);
        nodes
    };

    // Only hops with a sample happened; the rest were merely intended.
    let mut hops: Vec<Hop> = outward
        .windows(2)
        .zip(route.snr_towards.iter())
        .map(|(pair, snr)| Hop::new(pair[0], pair[1], *snr, HopDirection::ForwardRf))
        .collect();

    if has_return {
        let taken = route.route_back.len().min(route.snr_back.len());
        let mut back = Vec::with_capacity(taken + 2);
        back.push(from);
        back.extend_from_slice(&route.route_back[..taken]);
        if route.snr_back.len() > taken {
            back.push(to);
        }
        hops.extend(
            back.windows(2)
                .zip(route.snr_back.iter())
                .map(|(pair, snr)| Hop::new(pair[0], pair[1], *snr, HopDirection::ReturnRf)),
        );
    }

    let forward_complete = route.snr_towards.len() > route.route_nodes.len();
    let is_complete = if has_return {
        forward_complete && route.snr_back.len() > route.route_back.len()
    } else {
        forward_complete
    };
    let kind = if has_return { PathKind::CombinedRf } else { PathKind::ForwardRf };
    Path::from_hops(kind, hops, is_complete)
}
