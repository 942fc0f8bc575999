//! Initiator-side Noise IKpsk2 handshake
//!
//! This client only ever initiates: it builds type-1 messages and consumes
//! type-2 responses. The scanner reuses the same machinery to probe Warp
//! peers with a genuine initiation.

use tai64::Tai64N;
use zeroize::Zeroizing;

use crate::crypto::noise::{self, SymmetricState};
use crate::crypto::{blake2s, x25519};
use crate::error::{CryptoError, ProtocolError, WarpError};
use crate::wg::messages::{HandshakeInitiation, HandshakeResponse};

/// A handshake in flight. Created per attempt; dropped on completion or
/// abandonment.
pub struct InitiatorHandshake {
    static_private: Zeroizing<[u8; 32]>,
    static_public: [u8; 32],
    peer_static: [u8; 32],
    psk: Zeroizing<[u8; 32]>,
    sender_index: u32,
    ephemeral_private: Zeroizing<[u8; 32]>,
    state: SymmetricState,
    /// mac1 of the last initiation we sent; the AAD for any cookie reply.
    pub last_mac1: [u8; 16],
}

impl InitiatorHandshake {
    pub fn new(
        static_private: [u8; 32],
        peer_static: [u8; 32],
        psk: [u8; 32],
        sender_index: u32,
    ) -> Self {
        let static_public = x25519::public_key(&static_private);
        Self {
            static_private: Zeroizing::new(static_private),
            static_public,
            peer_static,
            psk: Zeroizing::new(psk),
            sender_index,
            ephemeral_private: Zeroizing::new([0u8; 32]),
            state: SymmetricState::initiator(&peer_static),
            last_mac1: [0u8; 16],
        }
    }

    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }

    /// Build the initiation message. `cookie` feeds mac2 when a cookie
    /// reply was received within the refresh window; otherwise mac2 is
    /// zeros.
    pub fn create_initiation(
        &mut self,
        cookie: Option<&[u8; 16]>,
    ) -> Result<[u8; HandshakeInitiation::SIZE], WarpError> {
        // restart the transcript so retransmits are self-contained
        self.state = SymmetricState::initiator(&self.peer_static);

        let (eph_private, eph_public) = x25519::generate_keypair();
        self.ephemeral_private = Zeroizing::new(eph_private);

        // e
        self.state.mix_hash(&eph_public);
        self.state.mix_chain(&eph_public);

        // es
        let es = x25519::dh(&self.ephemeral_private, &self.peer_static);
        let key = self.state.mix_key(&es);
        let encrypted_static: [u8; 48] = self
            .state
            .encrypt_and_hash(&key, &self.static_public)?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        // ss
        let ss = x25519::dh(&self.static_private, &self.peer_static);
        let key = self.state.mix_key(&ss);
        let encrypted_timestamp: [u8; 28] = self
            .state
            .encrypt_and_hash(&key, &Tai64N::now().to_bytes())?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        let mut msg = HandshakeInitiation {
            sender_index: self.sender_index,
            ephemeral_public: eph_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        let mut bytes = msg.to_bytes();
        msg.mac1 = blake2s::mac(
            &noise::mac1_key(&self.peer_static),
            HandshakeInitiation::mac1_coverage(&bytes),
        );
        bytes[116..132].copy_from_slice(&msg.mac1);
        self.last_mac1 = msg.mac1;

        if let Some(cookie) = cookie {
            msg.mac2 = blake2s::mac(cookie, HandshakeInitiation::mac2_coverage(&bytes));
            bytes[132..148].copy_from_slice(&msg.mac2);
        }

        Ok(bytes)
    }

    /// Consume a type-2 response and derive the transport keys.
    pub fn process_response(
        &mut self,
        response: &HandshakeResponse,
    ) -> Result<HandshakeOutcome, WarpError> {
        if response.receiver_index != self.sender_index {
            return Err(ProtocolError::UnknownReceiverIndex {
                index: response.receiver_index,
            }
            .into());
        }

        // e
        self.state.mix_hash(&response.ephemeral_public);
        self.state.mix_chain(&response.ephemeral_public);

        // ee
        let ee = x25519::dh(&self.ephemeral_private, &response.ephemeral_public);
        self.state.mix_key(&ee);

        // se
        let se = x25519::dh(&self.static_private, &response.ephemeral_public);
        self.state.mix_key(&se);

        // psk2
        let key = self.state.mix_key_and_hash(&self.psk);
        self.state
            .decrypt_and_hash(&key, &response.encrypted_nothing)?;

        let (sending_key, receiving_key) = self.state.derive_transport_keys();
        Ok(HandshakeOutcome {
            local_index: self.sender_index,
            remote_index: response.sender_index,
            sending_key,
            receiving_key,
        })
    }
}

/// Keys and indices produced by a completed handshake.
pub struct HandshakeOutcome {
    pub local_index: u32,
    pub remote_index: u32,
    pub sending_key: Zeroizing<[u8; 32]>,
    pub receiving_key: Zeroizing<[u8; 32]>,
}

/// Verify mac1 on an inbound response. We are the initiator, so the
/// responder keyed it with OUR static public key.
pub fn verify_response_mac1(raw: &[u8], our_public: &[u8; 32]) -> Result<(), WarpError> {
    if raw.len() != HandshakeResponse::SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: HandshakeResponse::SIZE,
            got: raw.len(),
        }
        .into());
    }
    let expected = blake2s::mac(
        &noise::mac1_key(our_public),
        HandshakeResponse::mac1_coverage(raw),
    );
    if raw[60..76] != expected {
        return Err(ProtocolError::MacVerificationFailed.into());
    }
    Ok(())
}

/// Random non-zero session index.
pub fn random_sender_index() -> u32 {
    use rand::Rng;
    loop {
        let idx: u32 = rand::thread_rng().gen();
        if idx != 0 {
            return idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_has_mac1_and_fresh_ephemeral() {
        let (sk, _) = x25519::generate_keypair();
        let (_, peer_pub) = x25519::generate_keypair();
        let mut hs = InitiatorHandshake::new(sk, peer_pub, [0u8; 32], 321);

        let bytes = hs.create_initiation(None).unwrap();
        let msg = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(msg.sender_index, 321);
        assert!(msg.ephemeral_public.iter().any(|&b| b != 0));
        assert!(msg.mac1.iter().any(|&b| b != 0));
        assert_eq!(msg.mac2, [0u8; 16]);
    }

    #[test]
    fn cookie_fills_mac2() {
        let (sk, _) = x25519::generate_keypair();
        let (_, peer_pub) = x25519::generate_keypair();
        let mut hs = InitiatorHandshake::new(sk, peer_pub, [0u8; 32], 321);

        let bytes = hs.create_initiation(Some(&[6u8; 16])).unwrap();
        let msg = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert!(msg.mac2.iter().any(|&b| b != 0));
    }

    #[test]
    fn retransmit_uses_new_ephemeral() {
        let (sk, _) = x25519::generate_keypair();
        let (_, peer_pub) = x25519::generate_keypair();
        let mut hs = InitiatorHandshake::new(sk, peer_pub, [0u8; 32], 1);

        let first = HandshakeInitiation::from_bytes(&hs.create_initiation(None).unwrap()).unwrap();
        let second = HandshakeInitiation::from_bytes(&hs.create_initiation(None).unwrap()).unwrap();
        assert_ne!(first.ephemeral_public, second.ephemeral_public);
    }

    #[test]
    fn response_with_wrong_receiver_rejected() {
        let (sk, _) = x25519::generate_keypair();
        let (_, peer_pub) = x25519::generate_keypair();
        let mut hs = InitiatorHandshake::new(sk, peer_pub, [0u8; 32], 10);
        let _ = hs.create_initiation(None).unwrap();

        let resp = HandshakeResponse {
            sender_index: 5,
            receiver_index: 11, // not ours
            ephemeral_public: [1u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(hs.process_response(&resp).is_err());
    }

    #[test]
    fn sender_index_never_zero() {
        for _ in 0..64 {
            assert_ne!(random_sender_index(), 0);
        }
    }
}
