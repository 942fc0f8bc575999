//! Noise IKpsk2 symmetric state
//!
//! Pattern: `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`. This module owns the
//! chaining key / hash pair that both handshake messages thread through, and
//! the final transport-key split.

use zeroize::Zeroizing;

use super::{aead, blake2s};
use crate::error::CryptoError;

pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
pub const LABEL_MAC1: &[u8] = b"mac1----";
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Chaining key + hash accumulator for an in-flight handshake.
#[derive(Clone)]
pub struct SymmetricState {
    pub chaining_key: [u8; 32],
    pub hash: [u8; 32],
}

impl SymmetricState {
    /// Initial state for an initiator who knows the responder's static key:
    /// ck = HASH(CONSTRUCTION), h = HASH(HASH(ck || IDENTIFIER) || spub_r).
    pub fn initiator(responder_static: &[u8; 32]) -> Self {
        let ck = blake2s::hash(CONSTRUCTION);
        let h = blake2s::hash2(&blake2s::hash2(&ck, IDENTIFIER), responder_static);
        Self {
            chaining_key: ck,
            hash: h,
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash2(&self.hash, data);
    }

    /// ck = KDF1(ck, input); used for ephemeral public keys.
    pub fn mix_chain(&mut self, input: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
    }

    /// (ck, k) = KDF2(ck, input); returns the derived message key.
    pub fn mix_key(&mut self, input: &[u8]) -> Zeroizing<[u8; 32]> {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        Zeroizing::new(key)
    }

    /// (ck, t, k) = KDF3(ck, psk); t is mixed into the hash. The psk2
    /// modifier step.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let (ck, tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        Zeroizing::new(key)
    }

    /// AEAD-seal with nonce 0 and the running hash as AAD, then absorb the
    /// ciphertext.
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ct = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ct);
        Ok(ct)
    }

    /// Inverse of [`encrypt_and_hash`](Self::encrypt_and_hash).
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let pt = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(pt)
    }

    /// Final key split. For the initiator the first output sends and the
    /// second receives; a responder would swap them.
    pub fn derive_transport_keys(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        let (send, recv) = blake2s::kdf2(&self.chaining_key, &[]);
        (Zeroizing::new(send), Zeroizing::new(recv))
    }
}

/// mac1 key: HASH(LABEL_MAC1 || responder_static)
pub fn mac1_key(peer_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash2(LABEL_MAC1, peer_static)
}

/// cookie decryption key: HASH(LABEL_COOKIE || responder_static)
pub fn cookie_key(peer_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash2(LABEL_COOKIE, peer_static)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_deterministic_per_peer() {
        let a = SymmetricState::initiator(&[1u8; 32]);
        let b = SymmetricState::initiator(&[1u8; 32]);
        let c = SymmetricState::initiator(&[2u8; 32]);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.chaining_key, b.chaining_key);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn encrypt_decrypt_keep_hashes_in_step() {
        let mut tx = SymmetricState::initiator(&[0u8; 32]);
        let mut rx = tx.clone();
        let key = [42u8; 32];
        let ct = tx.encrypt_and_hash(&key, b"static-key-material").unwrap();
        let pt = rx.decrypt_and_hash(&key, &ct).unwrap();
        assert_eq!(pt, b"static-key-material");
        assert_eq!(tx.hash, rx.hash);
    }

    #[test]
    fn transport_key_split_is_ordered() {
        let st = SymmetricState::initiator(&[0u8; 32]);
        let (send, recv) = st.derive_transport_keys();
        assert_ne!(*send, *recv);
    }

    #[test]
    fn mac1_and_cookie_keys_differ() {
        let peer = [9u8; 32];
        assert_ne!(mac1_key(&peer), cookie_key(&peer));
    }
}
