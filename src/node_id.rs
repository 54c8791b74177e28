//! Node identifier helpers.
//!
//! Meshtastic nodes are addressed by a 32-bit number. Gateways and user records carry the
//! textual form `!xxxxxxxx` (lowercase hex, zero padded).

/// Destination used by broadcast packets.
pub const BROADCAST_NODE_ID: u32 = 0xFFFF_FFFF;

/// Sentinel character that prefixes textual node ids.
pub const NODE_ID_PREFIX: char = '!';

/// Format a numeric node id as `!xxxxxxxx`.
pub fn format_node_id(id: u32) -> String {
    format!("{}{:08x}", NODE_ID_PREFIX, id)
}

/// Parse `!xxxxxxxx` (or a bare hex string) back into a node id.
///
/// Returns `None` for anything that is not 1-8 hex digits after the optional prefix.
pub fn parse_node_id(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let hex = trimmed.strip_prefix(NODE_ID_PREFIX).unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Resolve a gateway identifier to a node id. Only the `!xxxxxxxx` form resolves.
pub fn gateway_node_id(gateway_id: &str) -> Option<u32> {
    if !gateway_id.starts_with(NODE_ID_PREFIX) {
        return None;
    }
    parse_node_id(gateway_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses() {
        assert_eq!(format_node_id(0x12345678), "!12345678");
        assert_eq!(format_node_id(0xab), "!000000ab");
        assert_eq!(parse_node_id("!12345678"), Some(0x12345678));
        assert_eq!(parse_node_id("deadBEEF"), Some(0xdeadbeef));
        assert_eq!(parse_node_id("!"), None);
        assert_eq!(parse_node_id("!123456789"), None);
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn gateway_requires_prefix() {
        assert_eq!(gateway_node_id("!87654321"), Some(0x87654321));
        assert_eq!(gateway_node_id("87654321"), None);
        assert_eq!(gateway_node_id("LongFast"), None);
    }
}
