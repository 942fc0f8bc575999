//! The available set: a bounded, RTT-sorted collection of scan results
//!
//! Keyed by address, sorted ascending by RTT, capped at the configured
//! capacity. A result only displaces the current worst entry when it is
//! strictly faster. Entries older than the TTL are dropped by the expiry
//! sweep so the engine re-probes them.

use std::sync::Mutex;
use std::time::Duration;

use super::IpInfo;

pub struct IpQueue {
    entries: Mutex<Vec<IpInfo>>,
    capacity: usize,
    ttl: Duration,
    max_rtt: Duration,
}

impl IpQueue {
    pub fn new(capacity: usize, ttl: Duration, max_rtt: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            ttl,
            max_rtt,
        }
    }

    /// True while the set has room, i.e. the engine should keep probing.
    pub fn needs_work(&self) -> bool {
        self.entries.lock().expect("queue lock").len() < self.capacity
    }

    /// Insertion rules: reject slow results and duplicate addresses; fill
    /// to capacity; then only evict the current maximum for a strictly
    /// faster newcomer.
    pub fn enqueue(&self, info: IpInfo) -> bool {
        if info.rtt > self.max_rtt {
            return false;
        }
        let mut entries = self.entries.lock().expect("queue lock");
        if entries.iter().any(|e| e.addr_port.ip() == info.addr_port.ip()) {
            return false;
        }
        if entries.len() < self.capacity {
            entries.push(info);
        } else {
            let worst = entries
                .iter()
                .map(|e| e.rtt)
                .max()
                .expect("non-empty at capacity");
            if info.rtt >= worst {
                return false;
            }
            let pos = entries
                .iter()
                .position(|e| e.rtt == worst)
                .expect("worst exists");
            entries[pos] = info;
        }
        entries.sort_by_key(|e| e.rtt);
        true
    }

    /// Drop entries older than the TTL.
    pub fn expire(&self) {
        let mut entries = self.entries.lock().expect("queue lock");
        let before = entries.len();
        entries.retain(|e| e.created_at.elapsed() < self.ttl);
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired scan results");
        }
    }

    /// Snapshot, ascending RTT (or descending on request).
    pub fn available(&self, descending: bool) -> Vec<IpInfo> {
        let mut snapshot = self.entries.lock().expect("queue lock").clone();
        snapshot.sort_by_key(|e| e.rtt);
        if descending {
            snapshot.reverse();
        }
        snapshot
    }
}
