// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;

use data_encoding::HEXLOWER;

use rand::RngCore;

use std::fmt;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const DERIVE_CONTEXT: &str = "cirrus piece key v1";

/// Identifies a piece on its host. The host-side sector lookup key; here it
/// is the blake3 hash of the piece ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorRoot(pub [u8; 32]);

impl SectorRoot {
    pub fn for_sector(ciphertext: &[u8]) -> Self {
        Self(*blake3::hash(ciphertext).as_bytes())
    }
}

impl fmt::Debug for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorRoot({})", HEXLOWER.encode(&self.0[..6]))
    }
}

impl fmt::Display for SectorRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0[..6]))
    }
}

/// File-wide encryption key. Each (chunk, piece) pair gets its own derived
/// key and nonce so pieces can be re-uploaded to new hosts without nonce
/// reuse across positions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn derive(&self, chunk_index: u64, piece_index: u64) -> PieceKey {
        let mut material = [0u8; KEY_LEN + 16];
        material[..KEY_LEN].copy_from_slice(&self.0);
        material[KEY_LEN..KEY_LEN + 8].copy_from_slice(&chunk_index.to_le_bytes());
        material[KEY_LEN + 8..].copy_from_slice(&piece_index.to_le_bytes());

        // 32 bytes of key plus 12 bytes of nonce from one derivation.
        let mut okm = [0u8; KEY_LEN + NONCE_LEN];
        let mut reader = blake3::Hasher::new_derive_key(DERIVE_CONTEXT)
            .update(&material)
            .finalize_xof();
        reader.fill(&mut okm);

        let mut key = [0u8; KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        key.copy_from_slice(&okm[..KEY_LEN]);
        nonce.copy_from_slice(&okm[KEY_LEN..]);
        PieceKey { key, nonce }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        write!(f, "MasterKey(..)")
    }
}

/// Derived per-(chunk, piece) key. ChaCha20 keystream blocks are 64 bytes,
/// the same as the erasure segment unit, so a sector sub-range fetched at a
/// segment boundary decrypts by seeking the keystream to that offset.
pub struct PieceKey {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
}

impl PieceKey {
    /// Encrypts a full piece in place.
    pub fn encrypt_piece(&self, data: &mut [u8]) {
        self.apply_at(data, 0);
    }

    /// Decrypts `data`, which starts `offset` bytes into the piece
    /// ciphertext. `offset` must be a multiple of the segment unit.
    pub fn decrypt_range(&self, data: &mut [u8], offset: u64) {
        self.apply_at(data, offset);
    }

    fn apply_at(&self, data: &mut [u8], offset: u64) {
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.seek(offset);
        cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let master = MasterKey::generate();
        let key = master.derive(3, 1);

        let plaintext: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut data = plaintext.clone();
        key.encrypt_piece(&mut data);
        assert_ne!(data, plaintext);

        key.decrypt_range(&mut data, 0);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_decrypt_partial_range_at_segment_boundary() {
        let master = MasterKey::generate();
        let key = master.derive(0, 0);

        let plaintext: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut ciphertext = plaintext.clone();
        key.encrypt_piece(&mut ciphertext);

        // Decrypt only bytes [128, 384) by seeking.
        let mut window = ciphertext[128..384].to_vec();
        key.decrypt_range(&mut window, 128);
        assert_eq!(window, &plaintext[128..384]);
    }

    #[test]
    fn test_derived_keys_differ_per_position() {
        let master = MasterKey::from_bytes([7u8; 32]);
        let mut block = [0u8; 64];
        let mut a = block;
        master.derive(0, 0).encrypt_piece(&mut a);
        let mut b = block;
        master.derive(0, 1).encrypt_piece(&mut b);
        master.derive(1, 0).encrypt_piece(&mut block);
        assert_ne!(a, b);
        assert_ne!(a, block);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let master = MasterKey::from_bytes([42u8; 32]);
        let mut a = vec![1u8; 100];
        let mut b = vec![1u8; 100];
        master.derive(5, 2).encrypt_piece(&mut a);
        master.derive(5, 2).encrypt_piece(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sector_root_identifies_content() {
        let a = SectorRoot::for_sector(b"piece one");
        let b = SectorRoot::for_sector(b"piece two");
        assert_ne!(a, b);
        assert_eq!(a, SectorRoot::for_sector(b"piece one"));
    }
}
