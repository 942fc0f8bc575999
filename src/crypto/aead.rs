//! AEAD constructions for handshake and transport packets
//!
//! Transport and handshake payloads use ChaCha20-Poly1305 with the 64-bit
//! packet counter as nonce; cookie replies use XChaCha20-Poly1305 with the
//! 24-byte nonce carried in the message.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// The counter goes in the last 8 bytes of the 96-bit nonce, little-endian.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// XChaCha20-Poly1305 open, used to decrypt the cookie in a cookie reply.
/// The AAD is the mac1 of the initiation that provoked the reply.
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chacha20poly1305::aead::Aead;

    #[test]
    fn seal_open_roundtrip() {
        let key = [3u8; 32];
        let sealed = seal(&key, 7, b"payload", b"aad").unwrap();
        assert_eq!(sealed.len(), 7 + TAG_LEN);
        assert_eq!(open(&key, 7, &sealed, b"aad").unwrap(), b"payload");
    }

    #[test]
    fn wrong_counter_fails_auth() {
        let key = [3u8; 32];
        let sealed = seal(&key, 7, b"payload", &[]).unwrap();
        assert!(open(&key, 8, &sealed, &[]).is_err());
    }

    #[test]
    fn empty_plaintext_is_just_a_tag() {
        // the handshake response carries AEAD(empty); keepalives likewise
        let key = [0u8; 32];
        let sealed = seal(&key, 0, &[], &[]).unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&key, 0, &sealed, &[]).unwrap().is_empty());
    }

    #[test]
    fn xopen_reverses_xchacha_seal() {
        let key = [9u8; 32];
        let nonce = [5u8; 24];
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: b"cookie-16-bytes!",
                    aad: b"mac1",
                },
            )
            .unwrap();
        assert_eq!(
            xopen(&key, &nonce, &sealed, b"mac1").unwrap(),
            b"cookie-16-bytes!"
        );
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let key = [0u8; 32];
        assert!(open(&key, 0, &[0u8; 8], &[]).is_err());
    }
}
