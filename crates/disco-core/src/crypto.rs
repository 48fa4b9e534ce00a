//! Cryptographic primitives for Disco.
//!
//! Provides three things:
//!   1. BLAKE3 hashing and key derivation from a shared passphrase
//!   2. ChaCha20-Poly1305 sealing of announcement bodies
//!   3. A sliding replay window over per-sender sequence numbers
//!
//! The AEAD comes from snow's default resolver, so the group key never
//! touches a hand-written cipher. Derived key material is wiped on drop.
//! There is no unsafe code in this module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use snow::params::CipherChoice;
use snow::resolvers::{CryptoResolver, DefaultResolver};
use snow::types::Cipher;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::EncryptionConfig;

/// Random salt prefixed to every sealed body. Selects the packet subkey.
pub const SALT_LEN: usize = 16;

/// Sender sequence number carried inside the sealed plaintext.
pub const SEQ_LEN: usize = 8;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// BLAKE3 context for per-packet subkeys. Fixed by the wire format.
const SUBKEY_CONTEXT: &str = "disco 2024-03-01 announcement packet subkey";

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a 32-byte symmetric key from a passphrase.
///
/// `context` must be identical on every member of the group; changing it
/// yields an unrelated key.
pub fn derive_key(context: &str, secret: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3::derive_key(context, secret))
}

// ── AnnounceCipher ────────────────────────────────────────────────────────────

/// Symmetric AEAD shared by every member of an encrypted group.
///
/// Sealed layout:
///   [salt (16 bytes)] [ChaCha20-Poly1305( seq u64 LE ‖ plaintext ) + 16-byte MAC]
///
/// Many senders share one group key and cannot agree on a nonce counter, so
/// each datagram is sealed under its own subkey
/// `derive_key(SUBKEY_CONTEXT, group_key ‖ salt)` with nonce zero. A nonce
/// is therefore never reused under any key unless two 128-bit salts collide.
///
/// `seq` starts at the wall clock in microseconds and increments per
/// datagram, so a restarted sender with a fixed id still moves forward.
/// Receivers feed it to a `ReplayWindow` per sender.
pub struct AnnounceCipher {
    key: Zeroizing<[u8; 32]>,
    fingerprint: [u8; 8],
    next_seq: AtomicU64,
}

/// A successfully opened body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub seq: u64,
    pub plaintext: Vec<u8>,
}

impl AnnounceCipher {
    /// Build a cipher from the configured key descriptor.
    pub fn new(settings: &EncryptionConfig) -> Result<Self, CryptoError> {
        DefaultResolver
            .resolve_cipher(&CipherChoice::ChaChaPoly)
            .ok_or(CryptoError::CipherUnavailable)?;

        let key = derive_key(&settings.context, settings.key.as_bytes());
        let mut fingerprint = [0u8; 8];
        fingerprint.copy_from_slice(&hash(&*key)[..8]);

        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();

        Ok(Self {
            key,
            fingerprint,
            next_seq: AtomicU64::new(now_micros),
        })
    }

    /// Short, non-secret identifier of the derived key, for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.fingerprint)
    }

    fn packet_cipher(&self, salt: &[u8; SALT_LEN]) -> Result<Box<dyn Cipher>, CryptoError> {
        let mut material = Zeroizing::new([0u8; 32 + SALT_LEN]);
        material[..32].copy_from_slice(&*self.key);
        material[32..].copy_from_slice(salt);
        let subkey = derive_key(SUBKEY_CONTEXT, &*material);

        let mut cipher = DefaultResolver
            .resolve_cipher(&CipherChoice::ChaChaPoly)
            .ok_or(CryptoError::CipherUnavailable)?;
        let subkey_bytes: &[u8; 32] = &subkey;
        cipher.set(subkey_bytes);
        Ok(cipher)
    }

    /// Seal `plaintext` under the next sequence number, authenticating `aad`
    /// alongside it.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let salt: [u8; SALT_LEN] = rand::random();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cipher = self.packet_cipher(&salt)?;

        let mut body = Zeroizing::new(Vec::with_capacity(SEQ_LEN + plaintext.len()));
        body.extend_from_slice(&seq.to_le_bytes());
        body.extend_from_slice(plaintext);

        let mut out = vec![0u8; SALT_LEN + body.len() + TAG_LEN];
        out[..SALT_LEN].copy_from_slice(&salt);
        let written = cipher.encrypt(0, aad, &body, &mut out[SALT_LEN..]);
        out.truncate(SALT_LEN + written);
        Ok(out)
    }

    /// Open a body produced by `seal` with the same group key and `aad`.
    ///
    /// This only authenticates; rejecting a replayed `seq` is the caller's job.
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Opened, CryptoError> {
        if sealed.len() < SALT_LEN + SEQ_LEN + TAG_LEN {
            return Err(CryptoError::TooShort);
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&sealed[..SALT_LEN]);
        let cipher = self.packet_cipher(&salt)?;

        let mut body = vec![0u8; sealed.len() - SALT_LEN - TAG_LEN];
        let written = cipher
            .decrypt(0, aad, &sealed[SALT_LEN..], &mut body)
            .map_err(|_| CryptoError::Authentication)?;
        body.truncate(written);

        let mut seq = [0u8; SEQ_LEN];
        seq.copy_from_slice(&body[..SEQ_LEN]);
        body.drain(..SEQ_LEN);
        Ok(Opened {
            seq: u64::from_le_bytes(seq),
            plaintext: body,
        })
    }
}

impl std::fmt::Debug for AnnounceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnounceCipher")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sequence numbers remembered behind the highest one seen.
pub const WINDOW_SIZE: u64 = 2048;

const WINDOW_WORDS: usize = (WINDOW_SIZE / 64) as usize;

/// Sliding-window replay protection (RFC 6479 style) for one sender.
///
/// Tracks the highest accepted sequence number and a bitmap of the
/// `WINDOW_SIZE` numbers below it. Bit `d` stands for `highest - d`.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: [u64; WINDOW_WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0; WINDOW_WORDS],
        }
    }

    /// Returns true if `seq` is neither a duplicate nor behind the window.
    pub fn check(&self, seq: u64) -> bool {
        if seq > self.highest {
            return true;
        }
        let diff = self.highest - seq;
        if diff >= WINDOW_SIZE {
            return false;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark `seq` as seen. Call only after the body authenticated.
    pub fn mark(&mut self, seq: u64) {
        if seq > self.highest {
            self.shift_window(seq - self.highest);
            self.highest = seq;
        }
        let diff = self.highest - seq;
        if diff < WINDOW_SIZE {
            let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
            self.bitmap[word] |= 1u64 << bit;
        }
    }

    /// `check` then `mark`. Returns whether `seq` was fresh.
    pub fn accept(&mut self, seq: u64) -> bool {
        if !self.check(seq) {
            return false;
        }
        self.mark(seq);
        true
    }

    /// Move every remembered bit `shift` positions further from `highest`.
    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap = [0; WINDOW_WORDS];
            return;
        }
        let words = (shift / 64) as usize;
        let bits = (shift % 64) as u32;
        for i in (0..WINDOW_WORDS).rev() {
            let high = if i >= words { self.bitmap[i - words] } else { 0 };
            let low = if bits > 0 && i > words {
                self.bitmap[i - words - 1]
            } else {
                0
            };
            self.bitmap[i] = if bits > 0 {
                (high << bits) | (low >> (64 - bits))
            } else {
                high
            };
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ChaChaPoly is not available from the crypto resolver")]
    CipherUnavailable,

    #[error("sealed body too short (need at least 40 bytes: 16 salt + 8 seq + 16 MAC)")]
    TooShort,

    #[error("authentication failed (wrong key or tampered body)")]
    Authentication,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
