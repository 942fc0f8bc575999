//! The WireGuard device
//!
//! Bridges the in-process network stack (plaintext IP packets over the link
//! endpoint) and an OS UDP socket (ciphertext datagrams). Configuration is
//! applied through [`Device::ipc_set`]; `up` spawns the worker tasks and
//! `down` tears everything back to the configured-but-idle state.
//!
//! Task layout while running: one UDP receive task, one UDP send task, a
//! pool of encrypt workers and a pool of decrypt workers (CPU count each)
//! feeding sequencers that restore submission order, and one timer task per
//! peer driving its wheel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ConfigError, NetworkError, ProtocolError, Result};
use crate::netstack::LinkEndpoint;
use crate::wg::handshake::{self, InitiatorHandshake};
use crate::wg::messages::{
    message_type, CookieReply, HandshakeResponse, MessageType, TransportHeader,
};
use crate::wg::peer::{PendingHandshake, Peer, PeerConfig};
use crate::wg::timers::{
    rekey_timeout_jittered, Timer, KEEPALIVE_TIMEOUT, REKEY_ATTEMPT_TIME,
};
use crate::wg::transport::{Session, REJECT_AFTER_TIME, REKEY_AFTER_TIME};
use crate::crypto::x25519;

/// Everything above the largest ciphertext datagram we expect.
const MAX_DATAGRAM: usize = 65536;
/// Capacity of the inter-task channels.
const CHANNEL_CAP: usize = 256;
/// Junk prefix sizing: at least one full initiation, plus some slack.
const JUNK_MIN: usize = 148;
const JUNK_EXTRA_MAX: usize = 200;
/// How long `down` waits for workers before abandoning them.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(2);

/// Optional knobs; everything protocol-relevant arrives via `ipc_set`.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Worker pool size override; defaults to the CPU count.
    pub workers: Option<usize>,
}

struct DeviceState {
    private_key: Option<[u8; 32]>,
    public_key: [u8; 32],
    peers: Vec<Arc<Peer>>,
    running: bool,
}

/// Shared context for the running data plane.
struct RunContext {
    private_key: [u8; 32],
    public_key: [u8; 32],
    peers: Vec<Arc<Peer>>,
    socket: Arc<UdpSocket>,
    link: LinkEndpoint,
    encrypt: Dispatch<CryptoJob>,
    decrypt: Dispatch<CryptoJob>,
    udp_out: mpsc::Sender<Outbound>,
}

/// Round-robin fan-out with a global submission sequence; the matching
/// sequencer task releases results in submission order, which preserves
/// per-peer packet order across the parallel workers.
struct Dispatch<T> {
    seq: AtomicU64,
    next: AtomicUsize,
    lanes: Vec<mpsc::Sender<T>>,
}

impl<T> Dispatch<T> {
    fn new(lanes: Vec<mpsc::Sender<T>>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            next: AtomicUsize::new(0),
            lanes,
        }
    }

    async fn submit(&self, mut make: impl FnMut(u64) -> T) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let lane = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        if self.lanes[lane].send(make(seq)).await.is_err() {
            trace!(seq, "crypto lane closed");
        }
    }
}

struct CryptoJob {
    seq: u64,
    peer: Arc<Peer>,
    session: Arc<Session>,
    data: Vec<u8>,
}

struct CryptoResult {
    seq: u64,
    peer: Arc<Peer>,
    /// None when the operation failed; the slot is still released.
    data: Option<Vec<u8>>,
}

struct Outbound {
    peer: Arc<Peer>,
    datagram: Vec<u8>,
}

pub struct Device {
    state: Mutex<DeviceState>,
    link: LinkEndpoint,
    config: DeviceConfig,
    run: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Device {
    pub fn new(link: LinkEndpoint, config: DeviceConfig) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                private_key: None,
                public_key: [0u8; 32],
                peers: Vec::new(),
                running: false,
            }),
            link,
            config,
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Apply a newline-delimited `key=value` configuration stream.
    ///
    /// Keys: `private_key`, and per peer `public_key` (opens the block),
    /// `preshared_key`, `endpoint`, `persistent_keepalive_interval`,
    /// `allowed_ip` (repeatable), `trick`. Key material is hex-encoded.
    pub fn ipc_set(&self, config: &str) -> Result<()> {
        let mut private_key: Option<[u8; 32]> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();

        for line in config.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::InvalidUapi {
                line: line.to_string(),
            })?;

            match key {
                "private_key" => private_key = Some(parse_hex_key(value)?),
                "public_key" => peers.push(PeerConfig {
                    public_key: parse_hex_key(value)?,
                    preshared_key: [0u8; 32],
                    endpoint: "0.0.0.0:0".parse().expect("literal"),
                    keepalive: 0,
                    allowed_ips: Vec::new(),
                    trick: false,
                }),
                _ => {
                    let peer = peers.last_mut().ok_or_else(|| ConfigError::InvalidUapi {
                        line: line.to_string(),
                    })?;
                    match key {
                        "preshared_key" => peer.preshared_key = parse_hex_key(value)?,
                        "endpoint" => {
                            peer.endpoint =
                                value.parse().map_err(|_| ConfigError::InvalidAddress {
                                    value: value.to_string(),
                                })?
                        }
                        "persistent_keepalive_interval" => {
                            peer.keepalive =
                                value.parse().map_err(|_| ConfigError::InvalidUapi {
                                    line: line.to_string(),
                                })?
                        }
                        "allowed_ip" => peer.allowed_ips.push(value.parse().map_err(|_| {
                            ConfigError::InvalidCidr {
                                value: value.to_string(),
                            }
                        })?),
                        "trick" => {
                            peer.trick = value.parse().map_err(|_| ConfigError::InvalidUapi {
                                line: line.to_string(),
                            })?
                        }
                        _ => {
                            return Err(ConfigError::InvalidUapi {
                                line: line.to_string(),
                            }
                            .into())
                        }
                    }
                }
            }
        }

        let private_key = private_key.ok_or(ConfigError::MissingField {
            field: "private_key".into(),
        })?;
        if peers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "public_key".into(),
            }
            .into());
        }

        let mut state = self.state.lock().expect("device state");
        state.public_key = x25519::public_key(&private_key);
        state.private_key = Some(private_key);
        state.peers = peers.into_iter().map(|p| Arc::new(Peer::new(p))).collect();
        Ok(())
    }

    /// Peer list snapshot (used by tests and the orchestrator).
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.lock().expect("device state").peers.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("device state").running
    }

    /// Bind the UDP socket and spawn the data-plane tasks. Idempotent.
    pub async fn up(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Ok(());
        }

        let (private_key, public_key, peers) = {
            let state = self.state.lock().expect("device state");
            let key = state.private_key.ok_or(ProtocolError::DeviceDown)?;
            (key, state.public_key, state.peers.clone())
        };

        let bind_addr: SocketAddr = if peers[0].endpoint_is_v6() {
            "[::]:0".parse().expect("literal")
        } else {
            "0.0.0.0:0".parse().expect("literal")
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            NetworkError::BindFailed {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        let socket = Arc::new(socket);

        for peer in &peers {
            peer.reset_for_fresh_socket();
        }

        let workers = self.config.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (udp_out_tx, udp_out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAP);
        let (enc_done_tx, enc_done_rx) = mpsc::channel::<CryptoResult>(CHANNEL_CAP);
        let (dec_done_tx, dec_done_rx) = mpsc::channel::<CryptoResult>(CHANNEL_CAP);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut enc_lanes = Vec::with_capacity(workers);
        let mut dec_lanes = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel::<CryptoJob>(CHANNEL_CAP);
            enc_lanes.push(tx);
            tasks.push(tokio::spawn(encrypt_worker(rx, enc_done_tx.clone())));
            let (tx, rx) = mpsc::channel::<CryptoJob>(CHANNEL_CAP);
            dec_lanes.push(tx);
            tasks.push(tokio::spawn(decrypt_worker(rx, dec_done_tx.clone())));
        }
        drop(enc_done_tx);
        drop(dec_done_tx);

        let ctx = Arc::new(RunContext {
            private_key,
            public_key,
            peers: peers.clone(),
            socket,
            link: self.link.clone(),
            encrypt: Dispatch::new(enc_lanes),
            decrypt: Dispatch::new(dec_lanes),
            udp_out: udp_out_tx,
        });

        tasks.push(tokio::spawn(udp_send_task(
            ctx.clone(),
            udp_out_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(tx_sequencer(
            ctx.clone(),
            enc_done_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(rx_sequencer(
            ctx.clone(),
            dec_done_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(udp_recv_task(ctx.clone(), shutdown_rx.clone())));
        tasks.push(tokio::spawn(link_read_task(ctx.clone(), shutdown_rx.clone())));
        for peer in &peers {
            tasks.push(tokio::spawn(peer_timer_task(
                ctx.clone(),
                peer.clone(),
                shutdown_rx.clone(),
            )));
        }

        // client role: open the tunnel straight away rather than waiting
        // for the first outbound packet
        for peer in &peers {
            start_handshake(&ctx, peer).await;
        }

        self.state.lock().expect("device state").running = true;
        *run = Some(Running {
            shutdown: shutdown_tx,
            tasks,
        });
        debug!(workers, "device up");
        Ok(())
    }

    /// Stop the data plane, zeroize session material, close the socket.
    /// Idempotent; bounded by the shutdown budget.
    pub async fn down(&self) {
        let mut run = self.run.lock().await;
        let Some(running) = run.take() else {
            return;
        };
        let _ = running.shutdown.send(true);

        let join_all = async {
            for task in running.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_BUDGET, join_all).await.is_err() {
            warn!("device workers did not stop within budget; abandoning");
        }

        let state = self.state.lock().expect("device state");
        for peer in &state.peers {
            peer.clear_sessions();
            *peer.pending_handshake.lock().expect("pending lock") = None;
            peer.timers.lock().expect("timer lock").disarm_all();
            peer.queued.lock().expect("queue lock").clear();
        }
        drop(state);
        self.state.lock().expect("device state").running = false;
        debug!("device down");
    }
}

impl Peer {
    fn endpoint_is_v6(&self) -> bool {
        self.config.endpoint.is_ipv6()
    }
}

fn parse_hex_key(value: &str) -> std::result::Result<[u8; 32], ConfigError> {
    let value = value.trim();
    if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidKey {
            field: "hex key".into(),
        });
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16).map_err(|_| {
            ConfigError::InvalidKey {
                field: "hex key".into(),
            }
        })?;
    }
    Ok(out)
}

/// Begin a handshake cycle unless one is already in flight.
async fn start_handshake(ctx: &Arc<RunContext>, peer: &Arc<Peer>) {
    let datagram = {
        let mut pending = peer.pending_handshake.lock().expect("pending lock");
        if pending.is_some() {
            return;
        }
        let mut hs = InitiatorHandshake::new(
            ctx.private_key,
            peer.config.public_key,
            peer.config.preshared_key,
            handshake::random_sender_index(),
        );
        let cookie = peer.cookies.lock().expect("cookie lock").current().copied();
        let msg = match hs.create_initiation(cookie.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to build initiation");
                return;
            }
        };
        *pending = Some(PendingHandshake {
            handshake: hs,
            cycle_started: Instant::now(),
        });
        msg.to_vec()
    };

    peer.timers
        .lock()
        .expect("timer lock")
        .arm_in(Timer::HandshakeRetry, rekey_timeout_jittered());
    peer.timer_changed.notify_one();

    let _ = ctx
        .udp_out
        .send(Outbound {
            peer: peer.clone(),
            datagram,
        })
        .await;
    debug!("handshake initiation sent");
}

/// Retransmit the in-flight initiation, or abandon the cycle after
/// REKEY_ATTEMPT_TIME.
async fn retransmit_handshake(ctx: &Arc<RunContext>, peer: &Arc<Peer>) {
    let datagram = {
        let mut pending = peer.pending_handshake.lock().expect("pending lock");
        let Some(p) = pending.as_mut() else {
            return;
        };
        if p.cycle_started.elapsed() >= REKEY_ATTEMPT_TIME {
            debug!("handshake cycle abandoned; dropping queued packets");
            *pending = None;
            peer.queued.lock().expect("queue lock").clear();
            return;
        }
        let cookie = peer.cookies.lock().expect("cookie lock").current().copied();
        match p.handshake.create_initiation(cookie.as_ref()) {
            Ok(msg) => msg.to_vec(),
            Err(e) => {
                warn!(error = %e, "failed to rebuild initiation");
                return;
            }
        }
    };

    peer.timers
        .lock()
        .expect("timer lock")
        .arm_in(Timer::HandshakeRetry, rekey_timeout_jittered());
    peer.timer_changed.notify_one();

    let _ = ctx
        .udp_out
        .send(Outbound {
            peer: peer.clone(),
            datagram,
        })
        .await;
    trace!("handshake initiation retransmitted");
}

/// Arm the session lifetime timers after a handshake completes.
fn arm_session_timers(peer: &Peer) {
    let mut timers = peer.timers.lock().expect("timer lock");
    timers.disarm(Timer::HandshakeRetry);
    timers.arm_in(Timer::Rekey, REKEY_AFTER_TIME);
    timers.arm_in(Timer::Reject, REJECT_AFTER_TIME);
    if peer.config.keepalive > 0 {
        timers.arm_in(
            Timer::Keepalive,
            Duration::from_secs(peer.config.keepalive as u64),
        );
    }
    drop(timers);
    peer.timer_changed.notify_one();
}

async fn udp_recv_task(ctx: Arc<RunContext>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.changed() => return,
            r = ctx.socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "udp recv error");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];
        let Ok(kind) = message_type(datagram) else {
            continue; // malformed: silently discarded
        };

        match kind {
            MessageType::HandshakeResponse => {
                handle_response(&ctx, datagram, from).await;
            }
            MessageType::CookieReply => {
                handle_cookie_reply(&ctx, datagram).await;
            }
            MessageType::TransportData => {
                handle_transport(&ctx, datagram).await;
            }
            MessageType::HandshakeInitiation => {
                // initiator only; unauthenticated noise to us
                trace!("ignoring inbound initiation");
            }
        }
    }
}

async fn handle_response(ctx: &Arc<RunContext>, datagram: &[u8], from: SocketAddr) {
    if handshake::verify_response_mac1(datagram, &ctx.public_key).is_err() {
        for peer in &ctx.peers {
            peer.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
        return;
    }
    let Ok(response) = HandshakeResponse::from_bytes(datagram) else {
        return;
    };

    for peer in &ctx.peers {
        let outcome = {
            let mut pending = peer.pending_handshake.lock().expect("pending lock");
            let Some(p) = pending.as_mut() else { continue };
            if p.handshake.sender_index() != response.receiver_index {
                continue;
            }
            let outcome = p.handshake.process_response(&response);
            if outcome.is_ok() {
                *pending = None;
            }
            outcome
        };

        match outcome {
            Ok(outcome) => {
                debug!(peer_endpoint = %from, "handshake complete");
                peer.install_session(Session::from_outcome(outcome));
                peer.cookies.lock().expect("cookie lock").clear();
                peer.mark_recv();
                arm_session_timers(peer);

                // flush packets parked during the handshake
                let queued = peer.drain_queue();
                if let Some(session) = peer.current_session() {
                    for packet in queued {
                        let peer = peer.clone();
                        let session = session.clone();
                        ctx.encrypt
                            .submit(move |seq| CryptoJob {
                                seq,
                                peer: peer.clone(),
                                session: session.clone(),
                                data: packet.clone(),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                peer.auth_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "handshake response rejected");
            }
        }
        return;
    }
}

async fn handle_cookie_reply(ctx: &Arc<RunContext>, datagram: &[u8]) {
    let Ok(reply) = CookieReply::from_bytes(datagram) else {
        return;
    };
    for peer in &ctx.peers {
        let absorbed = {
            let pending = peer.pending_handshake.lock().expect("pending lock");
            let Some(p) = pending.as_ref() else { continue };
            if p.handshake.sender_index() != reply.receiver_index {
                continue;
            }
            let last_mac1 = p.handshake.last_mac1;
            drop(pending);
            peer.cookies
                .lock()
                .expect("cookie lock")
                .absorb(&reply, &last_mac1, &peer.config.public_key)
                .is_ok()
        };
        if absorbed {
            debug!("cookie reply absorbed; retrying handshake under load");
            retransmit_handshake(ctx, peer).await;
        }
        return;
    }
}

async fn handle_transport(ctx: &Arc<RunContext>, datagram: &[u8]) {
    let Ok(header) = TransportHeader::from_bytes(datagram) else {
        return;
    };
    for peer in &ctx.peers {
        if let Some(session) = peer.session_by_index(header.receiver_index) {
            let peer = peer.clone();
            let data = datagram.to_vec();
            ctx.decrypt
                .submit(move |seq| CryptoJob {
                    seq,
                    peer: peer.clone(),
                    session: session.clone(),
                    data: data.clone(),
                })
                .await;
            return;
        }
    }
    trace!(index = header.receiver_index, "transport for unknown index");
}

/// Outbound plaintext: read from the stack, hand to the encrypt pool.
async fn link_read_task(ctx: Arc<RunContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => return,
            p = ctx.link.read() => match p {
                Some(p) => p,
                None => return, // stack shut down
            },
        };

        let Some(peer) = route_packet(&ctx.peers, &packet) else {
            continue;
        };

        match peer.current_session() {
            Some(session) => {
                if session.wants_rekey() {
                    start_handshake(&ctx, peer).await;
                }
                let peer = peer.clone();
                ctx.encrypt
                    .submit(move |seq| CryptoJob {
                        seq,
                        peer: peer.clone(),
                        session: session.clone(),
                        data: packet.clone(),
                    })
                    .await;
            }
            None => {
                peer.queue_packet(packet);
                start_handshake(&ctx, peer).await;
            }
        }
    }
}

/// Pick the peer whose allowed IPs cover the packet's destination.
fn route_packet<'a>(peers: &'a [Arc<Peer>], packet: &[u8]) -> Option<&'a Arc<Peer>> {
    let dst = destination_address(packet)?;
    peers
        .iter()
        .find(|p| p.config.allowed_ips.iter().any(|net| net.contains(&dst)))
        .or_else(|| peers.first())
}

/// Destination address of a raw IPv4/IPv6 packet.
fn destination_address(packet: &[u8]) -> Option<std::net::IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        _ => None,
    }
}

async fn encrypt_worker(mut jobs: mpsc::Receiver<CryptoJob>, done: mpsc::Sender<CryptoResult>) {
    while let Some(job) = jobs.recv().await {
        let data = match job.session.seal(&job.data) {
            Ok(d) => Some(d),
            Err(e) => {
                trace!(error = %e, "seal failed");
                None
            }
        };
        if done
            .send(CryptoResult {
                seq: job.seq,
                peer: job.peer,
                data,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn decrypt_worker(mut jobs: mpsc::Receiver<CryptoJob>, done: mpsc::Sender<CryptoResult>) {
    while let Some(job) = jobs.recv().await {
        let data = match job.session.open(&job.data) {
            Ok((_, plain)) => {
                job.peer.mark_recv();
                Some(plain)
            }
            Err(e) => {
                job.peer.auth_failures.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "open failed");
                None
            }
        };
        if done
            .send(CryptoResult {
                seq: job.seq,
                peer: job.peer,
                data,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Release encrypted datagrams to the UDP sender in submission order.
async fn tx_sequencer(
    ctx: Arc<RunContext>,
    mut done: mpsc::Receiver<CryptoResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next: u64 = 0;
    let mut held: std::collections::BTreeMap<u64, CryptoResult> = Default::default();
    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            r = done.recv() => match r {
                Some(r) => r,
                None => return,
            },
        };
        held.insert(result.seq, result);
        while let Some(result) = held.remove(&next) {
            next += 1;
            if let Some(datagram) = result.data {
                result.peer.mark_send();
                let _ = ctx
                    .udp_out
                    .send(Outbound {
                        peer: result.peer,
                        datagram,
                    })
                    .await;
            }
        }
    }
}

/// Deliver decrypted packets to the stack in submission order. Empty
/// payloads are keepalives and stop here.
async fn rx_sequencer(
    ctx: Arc<RunContext>,
    mut done: mpsc::Receiver<CryptoResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next: u64 = 0;
    let mut held: std::collections::BTreeMap<u64, CryptoResult> = Default::default();
    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            r = done.recv() => match r {
                Some(r) => r,
                None => return,
            },
        };
        held.insert(result.seq, result);
        while let Some(result) = held.remove(&next) {
            next += 1;
            match result.data {
                Some(plain) if !plain.is_empty() => {
                    if ctx.link.write(plain).await.is_err() {
                        return;
                    }
                }
                Some(_) => trace!("keepalive received"),
                None => {}
            }
        }
    }
}

/// The single writer to the UDP socket. Emits the junk prefix datagram the
/// first time a trick peer is written to on this socket.
async fn udp_send_task(
    ctx: Arc<RunContext>,
    mut out: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => return,
            m = out.recv() => match m {
                Some(m) => m,
                None => return,
            },
        };

        if msg.peer.take_junk_pending() {
            let len = JUNK_MIN + rand::thread_rng().gen_range(0..=JUNK_EXTRA_MAX);
            let mut junk = vec![0u8; len];
            rand::thread_rng().fill(junk.as_mut_slice());
            if let Err(e) = ctx.socket.send_to(&junk, msg.peer.config.endpoint).await {
                warn!(error = %e, "junk send failed");
            } else {
                debug!(len, "junk prefix sent");
            }
        }

        if let Err(e) = ctx
            .socket
            .send_to(&msg.datagram, msg.peer.config.endpoint)
            .await
        {
            warn!(error = %e, "udp send failed");
        }
    }
}

/// Drives one peer's timer wheel.
async fn peer_timer_task(
    ctx: Arc<RunContext>,
    peer: Arc<Peer>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = peer.timers.lock().expect("timer lock").next_deadline();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = peer.timer_changed.notified() => continue,
            _ = sleep_until_or_forever(next) => {}
        }

        let due = peer
            .timers
            .lock()
            .expect("timer lock")
            .take_due(Instant::now());
        for timer in due {
            match timer {
                Timer::HandshakeRetry => retransmit_handshake(&ctx, &peer).await,
                Timer::Keepalive => fire_keepalive(&ctx, &peer).await,
                Timer::Rekey => {
                    if peer
                        .current_session()
                        .map(|s| s.wants_rekey())
                        .unwrap_or(false)
                    {
                        start_handshake(&ctx, &peer).await;
                    }
                }
                Timer::Reject => {
                    debug!("session past reject-after-time; discarding");
                    peer.clear_sessions();
                    peer.timers.lock().expect("timer lock").disarm(Timer::Keepalive);
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Send an empty transport packet if the link has been quiet, then re-arm.
async fn fire_keepalive(ctx: &Arc<RunContext>, peer: &Arc<Peer>) {
    let interval = if peer.config.keepalive > 0 {
        Duration::from_secs(peer.config.keepalive as u64)
    } else {
        KEEPALIVE_TIMEOUT
    };

    if let Some(session) = peer.current_session() {
        let quiet = peer.last_send.lock().expect("send lock").elapsed() >= interval;
        if quiet {
            match session.seal(&[]) {
                Ok(datagram) => {
                    peer.mark_send();
                    let _ = ctx
                        .udp_out
                        .send(Outbound {
                            peer: peer.clone(),
                            datagram,
                        })
                        .await;
                    trace!("keepalive sent");
                }
                Err(e) => trace!(error = %e, "keepalive seal failed"),
            }
        }
    }

    let mut timers = peer.timers.lock().expect("timer lock");
    timers.arm_in(Timer::Keepalive, interval);
    drop(timers);
    peer.timer_changed.notify_one();
}
