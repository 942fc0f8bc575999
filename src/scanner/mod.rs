//! Warp endpoint scanner
//!
//! Walks candidate addresses drawn from the configured CIDR prefixes,
//! probes each one (by default with a genuine WireGuard handshake), and
//! keeps a small RTT-sorted set of the best endpoints found.

pub mod engine;
pub mod generator;
pub mod ping;
pub mod result_queue;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tokio::sync::watch;

pub use ping::PingMode;
use result_queue::IpQueue;

/// One scan result.
#[derive(Debug, Clone)]
pub struct IpInfo {
    pub addr_port: SocketAddr,
    pub rtt: Duration,
    pub created_at: Instant,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub use_ipv4: bool,
    pub use_ipv6: bool,
    /// Results slower than this are discarded.
    pub max_rtt: Duration,
    /// Prefixes candidates are drawn from.
    pub cidr_list: Vec<IpNet>,
    pub ping_mode: PingMode,
    /// Key pair for WARP-mode probes.
    pub warp_private_key: [u8; 32],
    pub warp_peer_public_key: [u8; 32],
    /// Destination port for WARP-mode probes.
    pub warp_port: u16,
    /// Target for the diagnostic TCP/TLS/HTTP/QUIC modes.
    pub hostname: String,
    pub port: u16,
    pub http_path: String,
    /// Best-endpoint set size.
    pub capacity: usize,
    /// Results older than this are re-probed.
    pub ttl: Duration,
    /// Candidates pulled per generator batch.
    pub batch_size: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            use_ipv4: true,
            use_ipv6: false,
            max_rtt: Duration::from_secs(1),
            cidr_list: Vec::new(),
            ping_mode: PingMode::Warp,
            warp_private_key: [0u8; 32],
            warp_peer_public_key: [0u8; 32],
            warp_port: 2408,
            hostname: String::from("cloudflare.com"),
            port: 443,
            http_path: String::from("/"),
            capacity: 8,
            ttl: Duration::from_secs(30),
            batch_size: 16,
        }
    }
}

/// Handle to a running (or not yet started) scan.
pub struct Scanner {
    options: Arc<ScannerOptions>,
    queue: Arc<IpQueue>,
}

impl Scanner {
    pub fn new(options: ScannerOptions) -> Self {
        let queue = Arc::new(IpQueue::new(
            options.capacity,
            options.ttl,
            options.max_rtt,
        ));
        Self {
            options: Arc::new(options),
            queue,
        }
    }

    /// Spawn the engine; returns immediately. The engine stops when
    /// `shutdown` fires.
    pub fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::spawn(engine::run(
            self.options.clone(),
            self.queue.clone(),
            shutdown,
        ));
    }

    /// Snapshot of the current best endpoints, ascending RTT by default.
    pub fn available_ips(&self, descending: bool) -> Vec<IpInfo> {
        self.queue.available(descending)
    }
}
