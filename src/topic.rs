//! Transport topic parsing.
//!
//! Gateways publish on `{root}/{region}/{version}/{type}/{channel}/{gateway}`, e.g.
//! `msh/US/2/e/LongFast/!abcd1234`. Segment 3 carries a one-letter message-type code used for
//! diagnostics only; segment 4 names the channel unless it starts with the node-id sentinel.

use crate::node_id::NODE_ID_PREFIX;

/// Topic segment that marks the JSON-encoded variant of the feed.
pub const JSON_MARKER: &str = "json";

/// What a topic tells us before the payload is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub message_type: Option<String>,
    pub channel_name: Option<String>,
    pub is_json: bool,
}

impl TopicInfo {
    pub fn parse(topic: &str) -> Self {
        let segments: Vec<&str> = topic.split('/').collect();
        Self {
            message_type: message_type(&segments),
            channel_name: channel_name(&segments),
            is_json: segments.iter().any(|s| *s == JSON_MARKER),
        }
    }
}

/// True when the topic belongs to the JSON variant and must be skipped.
pub fn is_json_topic(topic: &str) -> bool {
    topic.split('/').any(|s| s == JSON_MARKER)
}

fn message_type(segments: &[&str]) -> Option<String> {
    if segments.len() < 4 {
        return None;
    }
    let code = segments[3];
    if code.len() == 1 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_string())
    } else {
        None
    }
}

fn channel_name(segments: &[&str]) -> Option<String> {
    let candidate = segments.get(4)?;
    if candidate.is_empty() || candidate.starts_with(NODE_ID_PREFIX) {
        return None;
    }
    Some((*candidate).to_string())
}

/// Human-readable label for a message-type code.
pub fn describe_message_type(code: &str) -> &'static str {
    match code {
        "e" => "encrypted",
        "c" => "command",
        "p" => "position",
        "s" => "stat",
        "m" => "map",
        _ => "other",
    }
}
