//! Cookie reply consumption
//!
//! A loaded responder answers an initiation with a type-3 cookie reply
//! instead of a response. We decrypt the cookie, keep it for the refresh
//! window, and key mac2 with it on the next initiation attempt.

use std::time::{Duration, Instant};

use crate::crypto::{aead, noise};
use crate::error::{CryptoError, WarpError};
use crate::wg::messages::CookieReply;

/// COOKIE_REFRESH from the whitepaper.
pub const COOKIE_REFRESH: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub struct CookieJar {
    cookie: Option<([u8; 16], Instant)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored cookie, if still within the refresh window.
    pub fn current(&self) -> Option<&[u8; 16]> {
        match &self.cookie {
            Some((cookie, at)) if at.elapsed() < COOKIE_REFRESH => Some(cookie),
            _ => None,
        }
    }

    /// Decrypt and store the cookie from a reply. `last_mac1` is the mac1
    /// of the initiation the reply answers; it is the AEAD's AAD.
    pub fn absorb(
        &mut self,
        reply: &CookieReply,
        last_mac1: &[u8; 16],
        peer_static: &[u8; 32],
    ) -> Result<(), WarpError> {
        let key = noise::cookie_key(peer_static);
        let plain = aead::xopen(&key, &reply.nonce, &reply.encrypted_cookie, last_mac1)?;
        let cookie: [u8; 16] = plain.try_into().map_err(|_| CryptoError::Decryption)?;
        self.cookie = Some((cookie, Instant::now()));
        tracing::debug!("stored responder cookie");
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cookie = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_jar_has_no_cookie() {
        assert!(CookieJar::new().current().is_none());
    }

    #[test]
    fn fresh_cookie_is_served_and_cleared() {
        let mut jar = CookieJar::new();
        jar.cookie = Some(([8u8; 16], Instant::now()));
        assert_eq!(jar.current(), Some(&[8u8; 16]));
        jar.clear();
        assert!(jar.current().is_none());
    }

    #[test]
    fn expired_cookie_not_served() {
        let mut jar = CookieJar::new();
        let stale = Instant::now() - COOKIE_REFRESH - Duration::from_secs(1);
        jar.cookie = Some(([8u8; 16], stale));
        assert!(jar.current().is_none());
    }

    #[test]
    fn garbage_reply_rejected() {
        let mut jar = CookieJar::new();
        let reply = CookieReply {
            receiver_index: 1,
            nonce: [0u8; 24],
            encrypted_cookie: [0u8; 32],
        };
        assert!(jar.absorb(&reply, &[0u8; 16], &[0u8; 32]).is_err());
        assert!(jar.current().is_none());
    }
}
