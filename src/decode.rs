//! Envelope and application-payload decoding.
//!
//! The set of application payloads the collector understands is closed: each known
//! [`PortNum`](proto::PortNum) maps to one [`AppPayload`] variant through a single `match`,
//! and everything else lands in [`AppPayload::Opaque`].

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::logutil::truncate_for_log;
use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("service envelope decode failed: {0}")]
    Envelope(#[source] prost::DecodeError),

    #[error("service envelope carries no mesh packet")]
    MissingPacket,

    #[error("{port} payload decode failed: {source}")]
    Payload {
        port: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("text payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Outcome of decoding one application payload.
pub type DecodeOutcome = Result<AppPayload, DecodeError>;

/// Decoded application payload, one variant per port the collector interprets.
#[derive(Debug, Clone, PartialEq)]
pub enum AppPayload {
    Text(String),
    Position(proto::Position),
    NodeInfo(proto::User),
    Traceroute(proto::RouteDiscovery),
    /// Any other port, or a payload that is still encrypted.
    Opaque { port: proto::PortNum, bytes: Bytes },
}

impl AppPayload {
    /// Decode `payload` according to `port`.
    pub fn decode(port: proto::PortNum, payload: &[u8]) -> DecodeOutcome {
        use proto::PortNum;
        match port {
            PortNum::TextMessageApp => Ok(AppPayload::Text(std::str::from_utf8(payload)?.to_string())),
            PortNum::PositionApp => proto::Position::decode(payload)
                .map(AppPayload::Position)
                .map_err(|source| DecodeError::Payload { port: "POSITION_APP", source }),
            PortNum::NodeinfoApp => proto::User::decode(payload)
                .map(AppPayload::NodeInfo)
                .map_err(|source| DecodeError::Payload { port: "NODEINFO_APP", source }),
            PortNum::TracerouteApp => proto::RouteDiscovery::decode(payload)
                .map(AppPayload::Traceroute)
                .map_err(|source| DecodeError::Payload { port: "TRACEROUTE_APP", source }),
            other => Ok(AppPayload::Opaque {
                port: other,
                bytes: Bytes::copy_from_slice(payload),
            }),
        }
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        match self {
            AppPayload::Text(text) => format!("text \"{}\"", truncate_for_log(text, 80)),
            AppPayload::Position(pos) => {
                match (pos.latitude_i, pos.longitude_i) {
                    (Some(lat), Some(lon)) => format!(
                        "position lat={:.5} lon={:.5}{}",
                        lat as f64 * 1e-7,
                        lon as f64 * 1e-7,
                        pos.altitude.map(|a| format!(" alt={}m", a)).unwrap_or_default()
                    ),
                    _ => "position (no fix)".to_string(),
                }
            }
            AppPayload::NodeInfo(user) => {
                let ln = user.long_name.trim();
                let sn = user.short_name.trim();
                format!("user {} ({})", truncate_for_log(ln, 40), truncate_for_log(sn, 8))
            }
            AppPayload::Traceroute(rd) => format!(
                "traceroute route={} snr_towards={} route_back={} snr_back={}",
                rd.route.len(),
                rd.snr_towards.len(),
                rd.route_back.len(),
                rd.snr_back.len()
            ),
            AppPayload::Opaque { port, bytes } => {
                format!("{} len={}", port.as_str_name(), bytes.len())
            }
        }
    }
}

/// Decode the outer MQTT service envelope and make sure it carries a packet.
pub fn decode_envelope(raw: &[u8]) -> Result<(proto::ServiceEnvelope, proto::MeshPacket), DecodeError> {
    let mut envelope = proto::ServiceEnvelope::decode(raw).map_err(DecodeError::Envelope)?;
    let packet = envelope.packet.take().ok_or(DecodeError::MissingPacket)?;
    Ok((envelope, packet))
}

/// Port of the packet's decoded payload; encrypted packets report `UNKNOWN_APP`.
pub fn packet_port(packet: &proto::MeshPacket) -> proto::PortNum {
    match &packet.payload_variant {
        Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => {
            proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp)
        }
        _ => proto::PortNum::UnknownApp,
    }
}

/// Raw bytes of the packet payload: the decoded `Data.payload`, or the ciphertext.
pub fn packet_payload(packet: &proto::MeshPacket) -> Bytes {
    match &packet.payload_variant {
        Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => data.payload.clone(),
        Some(proto::mesh_packet::PayloadVariant::Encrypted(bytes)) => bytes.clone(),
        None => Bytes::new(),
    }
}

/// A packet is a decryption candidate when its port is unknown and it carries ciphertext.
pub fn is_decryption_candidate(packet: &proto::MeshPacket) -> bool {
    packet_port(packet) == proto::PortNum::UnknownApp
        && matches!(
            &packet.payload_variant,
            Some(proto::mesh_packet::PayloadVariant::Encrypted(bytes)) if !bytes.is_empty()
        )
}
