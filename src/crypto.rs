//! # Channel Key Derivation & Payload Decryption
//!
//! Gateways that cannot (or will not) decrypt a packet forward it with the raw AES-CTR
//! ciphertext. This module recovers the inner [`Data`](proto::Data) payload by trying each
//! configured channel key in turn.
//!
//! - [`derive_key`] turns a base64 channel key (plus an optional channel name) into the
//!   effective cipher key.
//! - [`decrypt`] runs AES-CTR with the Meshtastic nonce layout.
//! - [`try_decrypt`] walks the candidate keys and rewrites the packet in place on success.
//!
//! None of these functions return errors. A key that does not work simply produces an empty
//! plaintext or an unparseable payload, and the caller moves on to the next candidate.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use log::{debug, trace};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::protobuf::meshtastic_generated as proto;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Well-known key of the default public channel (`AQ==` shorthand).
pub const DEFAULT_CHANNEL_KEY: &str = "1PG7OiApB1nwvP+rz05pAQ==";

/// Length of the fallback key handed out when a base key cannot be decoded.
pub const FALLBACK_KEY_LEN: usize = 32;

const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
    0x01,
];

/// Derive the effective cipher key for `channel_name` from a base64 `base_key_b64`.
///
/// With a non-empty channel name the key is `SHA-256(base_key || channel_name)`. With an
/// empty name the decoded base key is used as-is. An undecodable base key yields an all-zero
/// key of [`FALLBACK_KEY_LEN`] bytes.
pub fn derive_key(channel_name: &str, base_key_b64: &str) -> Vec<u8> {
    let base = match decode_base_key(base_key_b64) {
        Some(k) => k,
        None => {
            debug!("Channel key could not be decoded; using zero key");
            return vec![0u8; FALLBACK_KEY_LEN];
        }
    };

    if channel_name.is_empty() {
        return base;
    }

    let mut hasher = Sha256::new();
    hasher.update(&base);
    hasher.update(channel_name.as_bytes());
    hasher.finalize()[..32].to_vec()
}

fn decode_base_key(base_key_b64: &str) -> Option<Vec<u8>> {
    let raw = STANDARD.decode(base_key_b64.trim()).ok()?;
    match raw.as_slice() {
        [] => None,
        // Single-byte "simple PSK": 0 disables crypto, 1..=10 select a default-key variant.
        [0] => None,
        [n] => {
            let mut key = DEFAULT_PSK;
            key[15] = key[15].wrapping_add(n - 1);
            Some(key.to_vec())
        }
        _ => Some(raw),
    }
}

/// Build the 16-byte CTR nonce: little-endian packet id followed by little-endian sender id,
/// each widened to 64 bits.
pub fn build_nonce(packet_id: u32, sender_id: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    nonce[8..].copy_from_slice(&(sender_id as u64).to_le_bytes());
    nonce
}

/// Decrypt `ciphertext` with AES-CTR. 16-byte keys select AES-128, 32-byte keys AES-256.
///
/// Returns an empty vector on empty input or on any cipher failure (wrong key length,
/// keystream exhaustion); the caller treats that as "this key did not work".
pub fn decrypt(ciphertext: &[u8], packet_id: u32, sender_id: u32, key: &[u8]) -> Vec<u8> {
    if ciphertext.is_empty() {
        return Vec::new();
    }
    let nonce = build_nonce(packet_id, sender_id);
    let mut buf = ciphertext.to_vec();
    let applied = match key.len() {
        16 => Aes128Ctr::new_from_slices(key, &nonce)
            .ok()
            .and_then(|mut c| c.try_apply_keystream(&mut buf).ok()),
        32 => Aes256Ctr::new_from_slices(key, &nonce)
            .ok()
            .and_then(|mut c| c.try_apply_keystream(&mut buf).ok()),
        other => {
            trace!("Unsupported key length {} for packet {}", other, packet_id);
            None
        }
    };
    match applied {
        Some(()) => buf,
        None => Vec::new(),
    }
}

/// CTR mode is symmetric; exposed under its own name for building test fixtures and for
/// re-encrypting captures.
pub fn encrypt(plaintext: &[u8], packet_id: u32, sender_id: u32, key: &[u8]) -> Vec<u8> {
    decrypt(plaintext, packet_id, sender_id, key)
}

/// Attempt to decrypt the packet's opaque payload with each candidate key in order.
///
/// A candidate wins only if the plaintext parses as [`proto::Data`] and its port is not
/// `UNKNOWN_APP`. On success the packet's payload is replaced by the decoded variant and
/// `true` is returned; otherwise the packet is left untouched.
pub fn try_decrypt(packet: &mut proto::MeshPacket, channel_name: &str, candidate_keys: &[String]) -> bool {
    use proto::mesh_packet::PayloadVariant;

    let ciphertext: Bytes = match &packet.payload_variant {
        Some(PayloadVariant::Encrypted(bytes)) if !bytes.is_empty() => bytes.clone(),
        _ => return false,
    };

    let decoded = candidate_keys.iter().enumerate().find_map(|(idx, base)| {
        let key = derive_key(channel_name, base);
        let plaintext = decrypt(&ciphertext, packet.id, packet.from, &key);
        if plaintext.is_empty() {
            return None;
        }
        match proto::Data::decode(plaintext.as_slice()) {
            Ok(data) if data.portnum != proto::PortNum::UnknownApp as i32 => {
                trace!(
                    "Packet {} decrypted with candidate key #{} (channel '{}')",
                    packet.id,
                    idx,
                    channel_name
                );
                Some(data)
            }
            _ => None,
        }
    });

    match decoded {
        Some(data) => {
            packet.payload_variant = Some(PayloadVariant::Decoded(data));
            true
        }
        None => false,
    }
}
