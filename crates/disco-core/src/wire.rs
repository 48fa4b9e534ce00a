//! Disco wire format: what an announcement looks like on the group.
//!
//! Every announcement is one UDP datagram:
//!
//!   [PacketHeader (8 bytes)] [body]
//!
//! The body is a JSON `Envelope`. When the group is encrypted the body is
//! sealed with the shared key and the header is authenticated as
//! associated data, so a flipped flag bit fails to open. Sealed bodies also
//! carry a sender sequence number; `PacketDecoder` drops any it has seen.
//!
//! The header is #[repr(C, packed)] with zerocopy derives; the JSON body
//! keeps payloads opaque and self-describing.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{AnnounceCipher, CryptoError, ReplayWindow};

/// Topic of the always-present discovery probe.
pub const DISCOVERY_TOPIC: &str = "discovery";

pub const MAGIC: [u8; 4] = *b"DSCO";

/// Wire format version. A receiver seeing another version drops the packet.
pub const WIRE_VERSION: u8 = 0x01;

/// Header flag: body is sealed with the group key.
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed prefix of every datagram.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Always `MAGIC`. Anything else on the port is not ours.
    pub magic: [u8; 4],
    pub version: u8,
    /// bit 0: body encrypted. bits 1-7: reserved, must be zero.
    pub flags: u8,
    pub reserved: [u8; 2],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 8]);

impl PacketHeader {
    fn new(encrypted: bool) -> Self {
        Self {
            magic: MAGIC,
            version: WIRE_VERSION,
            flags: if encrypted { FLAG_ENCRYPTED } else { 0 },
            reserved: [0; 2],
        }
    }

    fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Who sent an announcement. Also the shape merged into a peer registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub info: Option<Value>,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: None,
            port: None,
            info: None,
        }
    }
}

/// A broadcast as seen by handlers: sender identity plus optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub node: PeerInfo,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// A message tagged with the topic it was published under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub message: Message,
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode an envelope into one datagram, sealing the body if `cipher` is set.
pub fn encode_packet(
    envelope: &Envelope,
    cipher: Option<&AnnounceCipher>,
) -> Result<Bytes, WireError> {
    let header = PacketHeader::new(cipher.is_some());
    let body = serde_json::to_vec(envelope)?;

    let body = match cipher {
        Some(cipher) => cipher.seal(header.as_bytes(), &body)?,
        None => body,
    };

    let len = std::mem::size_of::<PacketHeader>() + body.len();
    if len > MAX_DATAGRAM {
        return Err(WireError::TooLarge(len));
    }

    let mut packet = BytesMut::with_capacity(len);
    packet.put_slice(header.as_bytes());
    packet.put_slice(&body);
    Ok(packet.freeze())
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub envelope: Envelope,
    /// Sender sequence number. Only sealed packets carry one.
    pub seq: Option<u64>,
}

/// Decode a single datagram without replay tracking.
///
/// A group either encrypts everything or nothing: with a cipher configured
/// plaintext packets are rejected, and without one sealed packets are.
pub fn decode_packet(
    packet: &[u8],
    cipher: Option<&AnnounceCipher>,
) -> Result<Decoded, WireError> {
    let header = PacketHeader::read_from_prefix(packet).ok_or(WireError::TooShort)?;
    let body = &packet[std::mem::size_of::<PacketHeader>()..];

    if header.magic != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = header.version;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    match (header.is_encrypted(), cipher) {
        (true, Some(cipher)) => {
            let opened = cipher.open(header.as_bytes(), body)?;
            Ok(Decoded {
                envelope: serde_json::from_slice(&opened.plaintext)?,
                seq: Some(opened.seq),
            })
        }
        (false, None) => Ok(Decoded {
            envelope: serde_json::from_slice(body)?,
            seq: None,
        }),
        (true, None) => Err(WireError::UnexpectedEncrypted),
        (false, Some(_)) => Err(WireError::UnexpectedPlaintext),
    }
}

// ── PacketDecoder ─────────────────────────────────────────────────────────────

/// Stateful receive side of a group.
///
/// On an encrypted group every sender id gets a `ReplayWindow`; a sealed
/// packet whose sequence number is a duplicate or too old for its sender is
/// rejected, so a captured datagram cannot be re-injected to fake liveness.
/// Plaintext groups have nothing authenticated to track.
#[derive(Debug)]
pub struct PacketDecoder {
    cipher: Option<Arc<AnnounceCipher>>,
    windows: HashMap<String, ReplayWindow>,
}

impl PacketDecoder {
    pub fn new(cipher: Option<Arc<AnnounceCipher>>) -> Self {
        Self {
            cipher,
            windows: HashMap::new(),
        }
    }

    /// Senders with replay state.
    pub fn tracked_senders(&self) -> usize {
        self.windows.len()
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Envelope, WireError> {
        let decoded = decode_packet(packet, self.cipher.as_deref())?;
        let Some(seq) = decoded.seq else {
            return Ok(decoded.envelope);
        };

        let sender = &decoded.envelope.message.node.id;
        let window = self.windows.entry(sender.clone()).or_default();
        if !window.accept(seq) {
            return Err(WireError::Replayed {
                sender: sender.clone(),
                seq,
            });
        }
        Ok(decoded.envelope)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet shorter than the 8-byte header")]
    TooShort,
    #[error("bad magic, not a disco packet")]
    BadMagic,
    #[error("unsupported wire version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("encrypted packet but no group key configured")]
    UnexpectedEncrypted,
    #[error("plaintext packet on an encrypted group")]
    UnexpectedPlaintext,
    #[error("packet of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error("replayed or stale packet from {sender} (seq {seq})")]
    Replayed { sender: String, seq: u64 },
    #[error("malformed body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionConfig, DEFAULT_KEY_CONTEXT};
    use serde_json::json;

    fn envelope(payload: Option<Value>) -> Envelope {
        Envelope {
            topic: DISCOVERY_TOPIC.into(),
            message: Message {
                node: PeerInfo {
                    id: "a1b2c3d4e5f60718".into(),
                    host: Some("10.0.0.7".into()),
                    port: Some(50_123),
                    info: None,
                },
                payload,
            },
        }
    }

    fn cipher(key: &str) -> AnnounceCipher {
        AnnounceCipher::new(&EncryptionConfig {
            key: key.into(),
            context: DEFAULT_KEY_CONTEXT.into(),
        })
        .unwrap()
    }

    #[test]
    fn plaintext_packet_starts_with_header() {
        let packet = encode_packet(&envelope(Some(json!("hello"))), None).unwrap();
        assert_eq!(&packet[..4], b"DSCO");
        assert_eq!(packet[4], WIRE_VERSION);
        assert_eq!(packet[5], 0);

        let decoded = decode_packet(&packet, None).unwrap();
        assert_eq!(decoded.envelope, envelope(Some(json!("hello"))));
        assert_eq!(decoded.seq, None);
    }

    #[test]
    fn encrypted_body_hides_payload() {
        let c = cipher("qwqweqweqweq");
        let packet = encode_packet(&envelope(Some(json!("default discovery message"))), Some(&c))
            .unwrap();
        assert_eq!(packet[5] & FLAG_ENCRYPTED, FLAG_ENCRYPTED);

        let text = String::from_utf8_lossy(&packet);
        assert!(!text.contains("discovery message"));

        let decoded = decode_packet(&packet, Some(&cipher("qwqweqweqweq"))).unwrap();
        assert!(decoded.seq.is_some());
        assert_eq!(
            decoded.envelope.message.payload,
            Some(json!("default discovery message"))
        );
    }

    #[test]
    fn mixed_groups_reject_each_other() {
        let c = cipher("k");
        let sealed = encode_packet(&envelope(None), Some(&c)).unwrap();
        let plain = encode_packet(&envelope(None), None).unwrap();

        assert!(matches!(
            decode_packet(&sealed, None),
            Err(WireError::UnexpectedEncrypted)
        ));
        assert!(matches!(
            decode_packet(&plain, Some(&c)),
            Err(WireError::UnexpectedPlaintext)
        ));
    }

    #[test]
    fn flipped_flag_bits_fail_authentication() {
        let c = cipher("k");
        let mut sealed = encode_packet(&envelope(None), Some(&c)).unwrap().to_vec();
        sealed[5] |= 0x80;
        assert!(matches!(
            decode_packet(&sealed, Some(&c)),
            Err(WireError::Crypto(CryptoError::Authentication))
        ));
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        assert!(matches!(decode_packet(b"DSC", None), Err(WireError::TooShort)));
        assert!(matches!(
            decode_packet(b"HTTP/1.1 200 OK", None),
            Err(WireError::BadMagic)
        ));

        let mut packet = encode_packet(&envelope(None), None).unwrap().to_vec();
        packet[4] = 0x09;
        assert!(matches!(
            decode_packet(&packet, None),
            Err(WireError::UnsupportedVersion(0x09))
        ));
    }

    #[test]
    fn missing_optional_fields_decode_as_none() {
        let body = br#"{"topic":"discovery","message":{"node":{"id":"x"}}}"#;
        let mut packet = PacketHeader::new(false).as_bytes().to_vec();
        packet.extend_from_slice(body);

        let decoded = decode_packet(&packet, None).unwrap().envelope;
        assert_eq!(decoded.message.node, PeerInfo::new("x"));
        assert_eq!(decoded.message.payload, None);
    }

    #[test]
    fn replayed_sealed_packet_is_accepted_once() {
        let sender = cipher("k");
        let mut receiver = PacketDecoder::new(Some(Arc::new(cipher("k"))));
        let packet = encode_packet(&envelope(None), Some(&sender)).unwrap();

        let accepted = (0..1000)
            .filter(|_| receiver.decode(&packet).is_ok())
            .count();
        assert_eq!(accepted, 1);
        assert!(matches!(
            receiver.decode(&packet),
            Err(WireError::Replayed { sender, .. }) if sender == "a1b2c3d4e5f60718"
        ));

        let next = encode_packet(&envelope(None), Some(&sender)).unwrap();
        assert!(receiver.decode(&next).is_ok());
        assert_eq!(receiver.tracked_senders(), 1);
    }

    #[test]
    fn replay_state_is_per_sender() {
        let sender = cipher("k");
        let mut receiver = PacketDecoder::new(Some(Arc::new(cipher("k"))));
        let from_a = encode_packet(&envelope(None), Some(&sender)).unwrap();
        let mut other = envelope(None);
        other.message.node.id = "ffeeddccbbaa9988".into();
        let from_b = encode_packet(&other, Some(&sender)).unwrap();

        // b's packet carries a later sequence number; a's older one is still fresh for a.
        assert!(receiver.decode(&from_b).is_ok());
        assert!(receiver.decode(&from_a).is_ok());
        assert_eq!(receiver.tracked_senders(), 2);
    }

    #[test]
    fn restarted_sender_is_not_mistaken_for_a_replay() {
        let mut receiver = PacketDecoder::new(Some(Arc::new(cipher("k"))));
        let first_run = cipher("k");
        assert!(receiver
            .decode(&encode_packet(&envelope(None), Some(&first_run)).unwrap())
            .is_ok());

        std::thread::sleep(std::time::Duration::from_millis(2));
        let second_run = cipher("k");
        assert!(receiver
            .decode(&encode_packet(&envelope(None), Some(&second_run)).unwrap())
            .is_ok());
    }

    #[test]
    fn plaintext_groups_skip_replay_tracking() {
        let mut receiver = PacketDecoder::new(None);
        let packet = encode_packet(&envelope(None), None).unwrap();
        assert!(receiver.decode(&packet).is_ok());
        assert!(receiver.decode(&packet).is_ok());
        assert_eq!(receiver.tracked_senders(), 0);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let big = "x".repeat(MAX_DATAGRAM);
        assert!(matches!(
            encode_packet(&envelope(Some(json!(big))), None),
            Err(WireError::TooLarge(_))
        ));
    }
}
