//! Cryptographic primitives for the WireGuard data plane
//!
//! - BLAKE2s hash, keyed MAC and HMAC-based KDF chain
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD
//! - X25519 Diffie-Hellman
//! - Noise IKpsk2 symmetric state

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;
