//! Per-peer runtime state
//!
//! A peer owns its session pair (current + previous, kept briefly across a
//! rekey), the in-flight handshake, the cookie jar, a bounded queue of
//! plaintext packets parked while no session exists, and its timer wheel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ipnet::IpNet;
use tokio::sync::Notify;

use crate::wg::cookie::CookieJar;
use crate::wg::handshake::InitiatorHandshake;
use crate::wg::timers::TimerWheel;
use crate::wg::transport::Session;

/// Packets parked while the handshake completes. Oldest are dropped on
/// overflow.
pub const PENDING_QUEUE_CAP: usize = 128;

/// Static peer configuration, as applied by `ipc_set`.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: [u8; 32],
    pub endpoint: SocketAddr,
    /// Persistent keepalive interval in seconds; 0 disables.
    pub keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
    /// Emit one junk datagram before the first real datagram on each fresh
    /// socket, to perturb DPI fingerprinting.
    pub trick: bool,
}

/// An in-flight handshake attempt and its bookkeeping.
pub struct PendingHandshake {
    pub handshake: InitiatorHandshake,
    /// When this cycle of attempts started (bounds REKEY_ATTEMPT_TIME).
    pub cycle_started: Instant,
}

#[derive(Default)]
pub struct SessionPair {
    pub current: Option<Arc<Session>>,
    pub previous: Option<Arc<Session>>,
}

pub struct Peer {
    pub config: PeerConfig,
    pub sessions: Mutex<SessionPair>,
    pub pending_handshake: Mutex<Option<PendingHandshake>>,
    pub cookies: Mutex<CookieJar>,
    pub timers: Mutex<TimerWheel>,
    /// Wakes the peer's timer task after a (re)arm.
    pub timer_changed: Notify,
    /// Plaintext waiting for a session.
    pub queued: Mutex<VecDeque<Vec<u8>>>,
    /// Junk datagram not yet emitted on the current socket.
    pub junk_pending: AtomicBool,
    pub last_send: Mutex<Instant>,
    pub last_recv: Mutex<Instant>,
    /// Packets that failed authentication; never surfaced as errors.
    pub auth_failures: AtomicU64,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let trick = config.trick;
        let now = Instant::now();
        Self {
            config,
            sessions: Mutex::new(SessionPair::default()),
            pending_handshake: Mutex::new(None),
            cookies: Mutex::new(CookieJar::new()),
            timers: Mutex::new(TimerWheel::new()),
            timer_changed: Notify::new(),
            queued: Mutex::new(VecDeque::new()),
            junk_pending: AtomicBool::new(trick),
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            auth_failures: AtomicU64::new(0),
        }
    }

    /// Sendable session, if one exists and is not past its limits.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        let pair = self.sessions.lock().expect("session lock");
        pair.current
            .as_ref()
            .filter(|s| !s.expired_for_send())
            .cloned()
    }

    /// Session matching a local receiver index (current or previous).
    pub fn session_by_index(&self, index: u32) -> Option<Arc<Session>> {
        let pair = self.sessions.lock().expect("session lock");
        let found = [&pair.current, &pair.previous]
            .into_iter()
            .flatten()
            .find(|s| s.local_index == index)
            .cloned();
        found
    }

    /// Install a freshly negotiated session; the old current survives as
    /// previous until the next rekey.
    pub fn install_session(&self, session: Session) {
        let mut pair = self.sessions.lock().expect("session lock");
        pair.previous = pair.current.take();
        pair.current = Some(Arc::new(session));
    }

    /// Drop all session state (device down or reject-after-time). Key
    /// material zeroizes on drop.
    pub fn clear_sessions(&self) {
        let mut pair = self.sessions.lock().expect("session lock");
        pair.current = None;
        pair.previous = None;
    }

    /// Park a plaintext packet while no session exists.
    pub fn queue_packet(&self, packet: Vec<u8>) {
        let mut queued = self.queued.lock().expect("queue lock");
        if queued.len() >= PENDING_QUEUE_CAP {
            queued.pop_front();
        }
        queued.push_back(packet);
    }

    pub fn drain_queue(&self) -> Vec<Vec<u8>> {
        self.queued.lock().expect("queue lock").drain(..).collect()
    }

    /// Consume the one-shot junk marker. True exactly once per fresh
    /// socket for trick peers.
    pub fn take_junk_pending(&self) -> bool {
        self.junk_pending.swap(false, Ordering::AcqRel)
    }

    /// Reset per-socket state; called when the device (re)opens its socket.
    pub fn reset_for_fresh_socket(&self) {
        self.junk_pending.store(self.config.trick, Ordering::Release);
    }

    pub fn mark_send(&self) {
        *self.last_send.lock().expect("send lock") = Instant::now();
    }

    pub fn mark_recv(&self) {
        *self.last_recv.lock().expect("recv lock") = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg::transport::Session;

    fn test_config(trick: bool) -> PeerConfig {
        PeerConfig {
            public_key: [7u8; 32],
            preshared_key: [0u8; 32],
            endpoint: "162.159.192.1:2408".parse().unwrap(),
            keepalive: 3,
            allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
            trick,
        }
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let peer = Peer::new(test_config(false));
        for i in 0..(PENDING_QUEUE_CAP + 10) {
            peer.queue_packet(vec![i as u8]);
        }
        let drained = peer.drain_queue();
        assert_eq!(drained.len(), PENDING_QUEUE_CAP);
        assert_eq!(drained[0], vec![10u8]);
    }

    #[test]
    fn junk_marker_consumed_once_per_socket() {
        let peer = Peer::new(test_config(true));
        assert!(peer.take_junk_pending());
        assert!(!peer.take_junk_pending());
        peer.reset_for_fresh_socket();
        assert!(peer.take_junk_pending());
    }

    #[test]
    fn junk_marker_absent_without_trick() {
        let peer = Peer::new(test_config(false));
        assert!(!peer.take_junk_pending());
        peer.reset_for_fresh_socket();
        assert!(!peer.take_junk_pending());
    }

    #[test]
    fn rekey_keeps_previous_session_reachable() {
        let peer = Peer::new(test_config(false));
        let first = Session::for_tests([1u8; 32], [2u8; 32], 0);
        let first_index = first.local_index;
        peer.install_session(first);

        let mut second = Session::for_tests([3u8; 32], [4u8; 32], 0);
        second.local_index = 99;
        peer.install_session(second);

        assert!(peer.session_by_index(first_index).is_some());
        assert!(peer.session_by_index(99).is_some());
        assert_eq!(peer.current_session().unwrap().local_index, 99);

        peer.clear_sessions();
        assert!(peer.current_session().is_none());
    }
}
