//! Transport sessions: counters, replay protection, packet sealing
//!
//! A session is the product of one completed handshake. Send state is a
//! monotone counter; receive state is a sliding replay window. Counter and
//! age limits follow the whitepaper exactly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::crypto::aead;
use crate::error::{ProtocolError, WarpError};
use crate::wg::handshake::HandshakeOutcome;
use crate::wg::messages::TransportHeader;

/// REKEY_AFTER_MESSAGES = 2^60 − 2^16
pub const REKEY_AFTER_MESSAGES: u64 = (1 << 60) - (1 << 16);
/// REJECT_AFTER_MESSAGES = 2^64 − 2^16 − 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Sliding-window replay filter over receive counters.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: u128,
    primed: bool,
}

const WINDOW: u64 = 128;

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept-and-mark. Returns false for replays and counters that fell
    /// out of the window.
    pub fn check(&mut self, counter: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.highest = counter;
            self.bitmap = 1;
            return true;
        }
        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= WINDOW {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = counter;
            return true;
        }
        let back = self.highest - counter;
        if back >= WINDOW {
            return false;
        }
        let bit = 1u128 << back;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// One established session. Shared between the encrypt and decrypt pools;
/// the send counter is atomic, the replay window sits behind a mutex.
pub struct Session {
    pub local_index: u32,
    pub remote_index: u32,
    sending_key: Zeroizing<[u8; 32]>,
    receiving_key: Zeroizing<[u8; 32]>,
    send_counter: AtomicU64,
    replay: std::sync::Mutex<ReplayWindow>,
    pub created_at: Instant,
}

impl Session {
    pub fn from_outcome(outcome: HandshakeOutcome) -> Self {
        Self {
            local_index: outcome.local_index,
            remote_index: outcome.remote_index,
            sending_key: outcome.sending_key,
            receiving_key: outcome.receiving_key,
            send_counter: AtomicU64::new(0),
            replay: std::sync::Mutex::new(ReplayWindow::new()),
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn sent(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Sending must stop at REJECT_AFTER_MESSAGES or REJECT_AFTER_TIME.
    pub fn expired_for_send(&self) -> bool {
        self.sent() >= REJECT_AFTER_MESSAGES || self.age() >= REJECT_AFTER_TIME
    }

    /// Rekey starts early, at REKEY_AFTER_* thresholds.
    pub fn wants_rekey(&self) -> bool {
        self.sent() >= REKEY_AFTER_MESSAGES || self.age() >= REKEY_AFTER_TIME
    }

    /// Seal one plaintext packet into a complete transport message,
    /// claiming the next counter.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, WarpError> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES || self.age() >= REJECT_AFTER_TIME {
            return Err(ProtocolError::SessionExpired.into());
        }
        let sealed = aead::seal(&self.sending_key, counter, plaintext, &[])?;
        Ok(TransportHeader::build_message(
            self.remote_index,
            counter,
            &sealed,
        ))
    }

    /// Open a complete transport message, enforcing replay protection.
    /// Returns (counter, plaintext); empty plaintext is a keepalive.
    pub fn open(&self, message: &[u8]) -> Result<(u64, Vec<u8>), WarpError> {
        let header = TransportHeader::from_bytes(message)?;
        if self.age() >= REJECT_AFTER_TIME {
            return Err(ProtocolError::SessionExpired.into());
        }
        let plain = aead::open(
            &self.receiving_key,
            header.counter,
            TransportHeader::payload(message),
            &[],
        )?;
        let fresh = self
            .replay
            .lock()
            .expect("replay lock poisoned")
            .check(header.counter);
        if !fresh {
            return Err(ProtocolError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        }
        Ok((header.counter, plain))
    }

    #[cfg(test)]
    pub fn for_tests(send: [u8; 32], recv: [u8; 32], start_counter: u64) -> Self {
        Self {
            local_index: 1,
            remote_index: 2,
            sending_key: Zeroizing::new(send),
            receiving_key: Zeroizing::new(recv),
            send_counter: AtomicU64::new(start_counter),
            replay: std::sync::Mutex::new(ReplayWindow::new()),
            created_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_between_paired_sessions() {
        let a = Session::for_tests([1u8; 32], [2u8; 32], 0);
        let b = Session::for_tests([2u8; 32], [1u8; 32], 0);

        let wire = a.seal(b"ip packet").unwrap();
        let (counter, plain) = b.open(&wire).unwrap();
        assert_eq!(counter, 0);
        assert_eq!(plain, b"ip packet");

        // replay of the same message is refused
        assert!(b.open(&wire).is_err());
    }

    #[test]
    fn counters_are_consumed_in_order() {
        let s = Session::for_tests([1u8; 32], [2u8; 32], 0);
        s.seal(b"a").unwrap();
        s.seal(b"b").unwrap();
        assert_eq!(s.sent(), 2);
    }

    #[test]
    fn send_rejected_at_counter_limit() {
        let s = Session::for_tests([1u8; 32], [2u8; 32], REJECT_AFTER_MESSAGES);
        assert!(s.seal(b"too late").is_err());
    }

    #[test]
    fn rekey_threshold_precedes_reject() {
        let s = Session::for_tests([1u8; 32], [2u8; 32], REKEY_AFTER_MESSAGES);
        assert!(s.wants_rekey());
        assert!(!s.expired_for_send());
        // one short of reject: still sendable, still wants rekey
        let s = Session::for_tests([1u8; 32], [2u8; 32], REJECT_AFTER_MESSAGES - 1);
        assert!(s.wants_rekey());
        assert!(s.seal(b"last one").is_ok());
        assert!(s.seal(b"over").is_err());
    }

    #[test]
    fn replay_window_accepts_out_of_order_once() {
        let mut w = ReplayWindow::new();
        assert!(w.check(5));
        assert!(w.check(3));
        assert!(w.check(7));
        assert!(!w.check(5));
        assert!(!w.check(3));
        assert!(w.check(6));
    }

    #[test]
    fn replay_window_drops_ancient_counters() {
        let mut w = ReplayWindow::new();
        assert!(w.check(500));
        assert!(!w.check(100));
        assert!(w.check(500 - WINDOW + 1));
    }

    #[test]
    fn replay_window_counter_zero_first() {
        let mut w = ReplayWindow::new();
        assert!(w.check(0));
        assert!(!w.check(0));
        assert!(w.check(1));
    }
}
