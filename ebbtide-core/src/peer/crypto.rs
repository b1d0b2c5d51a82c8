//! Stream obfuscation transforms and the two-slot hot-swap holder
//!
//! A connection owns one transform per direction. Replacements are staged
//! into a pending slot and committed only at message boundaries: the send
//! side commits right before the next whole message is transformed, the
//! receive side when the engine marks an inbound boundary. Bytes already
//! queued under the old transform are never touched again.

use sha1::{Digest, Sha1};

use super::state::Direction;
use super::InfoHash;

/// RC4 keystream bytes discarded after key setup, per the MSE convention.
const RC4_DISCARD: usize = 1024;

/// An opaque stream transform applied to outbound or inbound bytes.
///
/// Transforms are stateful stream ciphers: applying one advances its
/// keystream, so each direction owns its own instance.
pub trait CryptoTransform: Send {
    /// Short name for diagnostics ("plaintext", "rc4").
    fn name(&self) -> &'static str;

    /// Transforms `data` in place, advancing internal state.
    fn apply(&mut self, data: &mut [u8]);
}

/// Identity transform for unobfuscated connections.
pub struct PlaintextCrypto;

impl CryptoTransform for PlaintextCrypto {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn apply(&mut self, _data: &mut [u8]) {}
}

/// RC4 stream cipher as used by BitTorrent protocol encryption.
pub struct Rc4Crypto {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4Crypto {
    /// Key-schedules RC4 and discards the first keystream bytes, which are
    /// the ones with known biases.
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        let mut cipher = Self { s, i: 0, j: 0 };
        let mut discard = [0u8; RC4_DISCARD];
        cipher.apply(&mut discard);
        cipher
    }
}

impl CryptoTransform for Rc4Crypto {
    fn name(&self) -> &'static str {
        "rc4"
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

/// Derives the RC4 key pair for a negotiated shared secret.
///
/// `SHA1("keyA" || secret || info_hash)` keys the stream the connection
/// initiator sends on; `"keyB"` keys the other direction. Returns
/// `(send_key, recv_key)` for the given local direction.
pub fn derive_rc4_keys(
    secret: &[u8],
    info_hash: &InfoHash,
    direction: Direction,
) -> ([u8; 20], [u8; 20]) {
    let digest = |label: &[u8]| -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(label);
        hasher.update(secret);
        hasher.update(info_hash.as_bytes());
        let mut key = [0u8; 20];
        key.copy_from_slice(&hasher.finalize());
        key
    };

    let key_a = digest(b"keyA");
    let key_b = digest(b"keyB");
    match direction {
        Direction::Outgoing => (key_a, key_b),
        Direction::Incoming => (key_b, key_a),
    }
}

/// Two-slot transform holder: the active transform plus an optional staged
/// replacement committed at a message boundary.
pub struct CryptoSlot {
    active: Box<dyn CryptoTransform>,
    pending: Option<Box<dyn CryptoTransform>>,
}

impl CryptoSlot {
    pub fn plaintext() -> Self {
        Self {
            active: Box::new(PlaintextCrypto),
            pending: None,
        }
    }

    pub fn with_transform(transform: Box<dyn CryptoTransform>) -> Self {
        Self {
            active: transform,
            pending: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.active.name()
    }

    /// Stages a replacement transform. A second stage before the commit
    /// replaces the still-pending one.
    pub fn stage(&mut self, transform: Box<dyn CryptoTransform>) {
        self.pending = Some(transform);
    }

    /// Commits the staged transform, if any. Only called at message
    /// boundaries so no byte stream is ever split across two transforms.
    pub fn commit(&mut self) -> bool {
        match self.pending.take() {
            Some(transform) => {
                self.active = transform;
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Transforms a whole message's bytes under the active transform.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.active.apply(data);
    }
}

impl std::fmt::Debug for CryptoSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSlot")
            .field("active", &self.active.name())
            .field("pending", &self.pending.as_ref().map(|p| p.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rc4_pair(key: &[u8]) -> (Rc4Crypto, Rc4Crypto) {
        (Rc4Crypto::new(key), Rc4Crypto::new(key))
    }

    #[test]
    fn test_rc4_roundtrip() {
        let (mut enc, mut dec) = rc4_pair(b"a shared key");
        let mut data = b"hello peer wire".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"hello peer wire");
        dec.apply(&mut data);
        assert_eq!(&data, b"hello peer wire");
    }

    #[test]
    fn test_rc4_is_stateful_stream() {
        let (mut enc, mut dec) = rc4_pair(b"key");
        let mut first = vec![0u8; 16];
        let mut second = vec![0u8; 16];
        enc.apply(&mut first);
        enc.apply(&mut second);
        // Same plaintext, different keystream position.
        assert_ne!(first, second);

        dec.apply(&mut first);
        dec.apply(&mut second);
        assert_eq!(first, vec![0u8; 16]);
        assert_eq!(second, vec![0u8; 16]);
    }

    #[test]
    fn test_key_derivation_mirrors_between_directions() {
        let info_hash = InfoHash::new([9u8; 20]);
        let secret = [0x42u8; 96];

        let (out_send, out_recv) = derive_rc4_keys(&secret, &info_hash, Direction::Outgoing);
        let (in_send, in_recv) = derive_rc4_keys(&secret, &info_hash, Direction::Incoming);

        // What one side sends with, the other receives with.
        assert_eq!(out_send, in_recv);
        assert_eq!(out_recv, in_send);
        assert_ne!(out_send, out_recv);
    }

    #[test]
    fn test_key_derivation_matches_sha1_construction() {
        let info_hash = InfoHash::new([0u8; 20]);
        let secret = b"s";
        let (send_key, _) = derive_rc4_keys(secret, &info_hash, Direction::Outgoing);

        let mut hasher = Sha1::new();
        hasher.update(b"keyA");
        hasher.update(secret);
        hasher.update(info_hash.as_bytes());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(send_key, expected);
    }

    #[test]
    fn test_slot_commit_at_boundary() {
        let mut slot = CryptoSlot::plaintext();
        assert_eq!(slot.name(), "plaintext");

        slot.stage(Box::new(Rc4Crypto::new(b"key")));
        assert!(slot.has_pending());
        // Until committed, the active transform still applies.
        let mut data = b"abc".to_vec();
        slot.apply(&mut data);
        assert_eq!(&data, b"abc");

        assert!(slot.commit());
        assert_eq!(slot.name(), "rc4");
        assert!(!slot.commit()); // nothing staged anymore
    }

    #[test]
    fn test_restaging_replaces_pending() {
        let mut slot = CryptoSlot::plaintext();
        slot.stage(Box::new(Rc4Crypto::new(b"first")));
        slot.stage(Box::new(PlaintextCrypto));
        slot.commit();
        assert_eq!(slot.name(), "plaintext");
    }
}
