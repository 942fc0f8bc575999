//! In-process IPv4/IPv6 network stack
//!
//! A smoltcp interface whose "wire" is the in-memory [`link`] shared with
//! the WireGuard device. One reactor task owns the interface and socket
//! set; sockets are opened by message and exposed as async handles backed
//! by bounded byte queues. No host networking is involved on this side:
//! every packet enters and leaves through the link endpoint.

pub mod dns;
pub mod link;
pub mod phy;
pub mod queue;

pub use link::{link_pair, LinkEndpoint};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;
use queue::BoundedQueue;

const TCP_BUFFER: usize = 262_144;
const UDP_PACKET_BUFFER: usize = 65_536;
const UDP_META_SLOTS: usize = 32;
const CONN_QUEUE_CAP: usize = 256;
const UDP_QUEUE_CAP: usize = 64;
const EPHEMERAL_START: u16 = 40_000;
const EPHEMERAL_END: u16 = 65_000;
const LINK_DRAIN_BURST: usize = 64;
const IDLE_TICK: Duration = Duration::from_millis(100);
/// TCP connect budget inside the tunnel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Address-family constraint carried by the `tcp4`/`udp6`-style network
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    pub fn from_network(network: &str) -> Result<(Self, bool), NetworkError> {
        match network {
            "tcp" => Ok((Self::Any, true)),
            "tcp4" => Ok((Self::V4, true)),
            "tcp6" => Ok((Self::V6, true)),
            "udp" => Ok((Self::Any, false)),
            "udp4" => Ok((Self::V4, false)),
            "udp6" => Ok((Self::V6, false)),
            other => Err(NetworkError::UnsupportedNetwork {
                network: other.to_string(),
            }),
        }
    }

    pub fn admits(&self, addr: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// A user-space TCP stream inside the stack.
pub struct TcpConn {
    rx: Arc<BoundedQueue<Bytes>>,
    tx: Arc<BoundedQueue<Bytes>>,
}

impl TcpConn {
    /// Next chunk from the remote; None at end of stream.
    pub async fn read(&self) -> Option<Bytes> {
        self.rx.pop().await
    }

    pub async fn write(&self, data: Bytes) -> Result<(), NetworkError> {
        self.tx.push(data).await.map_err(|_| NetworkError::StackClosed)
    }

    /// Half-close: no more writes; the peer sees FIN after the queue
    /// drains.
    pub fn shutdown_send(&self) {
        self.tx.close();
    }

    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// A user-space UDP socket bound to one remote endpoint.
#[derive(Debug)]
pub struct UdpConn {
    rx: Arc<BoundedQueue<Bytes>>,
    tx: Arc<BoundedQueue<Bytes>>,
}

impl UdpConn {
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.pop().await
    }

    pub async fn send(&self, datagram: Bytes) -> Result<(), NetworkError> {
        self.tx
            .push(datagram)
            .await
            .map_err(|_| NetworkError::StackClosed)
    }

    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

enum StackCmd {
    DialTcp {
        remote: IpEndpoint,
        reply: oneshot::Sender<Result<TcpConn, NetworkError>>,
    },
    OpenUdp {
        remote: IpEndpoint,
        reply: oneshot::Sender<Result<UdpConn, NetworkError>>,
    },
}

/// Handle to a running stack; cheap to clone.
#[derive(Clone)]
pub struct NetStack {
    cmds: mpsc::Sender<StackCmd>,
    addresses: Vec<IpAddr>,
    dns_servers: Vec<IpAddr>,
}

impl NetStack {
    /// Build the stack and return it together with the device-facing link
    /// endpoint. The reactor runs until `shutdown` fires.
    pub fn create(
        addresses: Vec<IpAddr>,
        dns_servers: Vec<IpAddr>,
        mtu: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (NetStack, LinkEndpoint) {
        let (device_side, stack_side) = link_pair(mtu);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let reactor = Reactor::new(addresses.clone(), mtu, stack_side);
        tokio::spawn(reactor.run(cmd_rx, shutdown));

        (
            NetStack {
                cmds: cmd_tx,
                addresses,
                dns_servers,
            },
            device_side,
        )
    }

    pub fn has_family(&self, family: Family) -> bool {
        self.addresses.iter().any(|a| family.admits(a))
    }

    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Dial `host:port` with the given family constraint, resolving
    /// hostnames through the stack's DNS servers.
    pub async fn dial_tcp(&self, addr: &str, family: Family) -> Result<TcpConn, NetworkError> {
        let target = self.resolve_target(addr, family).await?;
        self.dial_tcp_addr(target).await
    }

    pub async fn dial_tcp_addr(&self, target: SocketAddr) -> Result<TcpConn, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmds
            .send(StackCmd::DialTcp {
                remote: endpoint_of(target),
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetworkError::StackClosed)?;
        match tokio::time::timeout(CONNECT_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::StackClosed),
            Err(_) => Err(NetworkError::HostUnreachable {
                endpoint: target.to_string(),
            }),
        }
    }

    /// Open a UDP socket talking to one remote endpoint.
    pub async fn dial_udp(&self, addr: &str, family: Family) -> Result<UdpConn, NetworkError> {
        let target = self.resolve_target(addr, family).await?;
        self.dial_udp_addr(target).await
    }

    pub async fn dial_udp_addr(&self, target: SocketAddr) -> Result<UdpConn, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmds
            .send(StackCmd::OpenUdp {
                remote: endpoint_of(target),
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetworkError::StackClosed)?;
        reply_rx.await.map_err(|_| NetworkError::StackClosed)?
    }

    /// Resolve `host:port` into a socket address, honoring the family
    /// constraint and the stack's own address families.
    pub async fn resolve_target(
        &self,
        addr: &str,
        family: Family,
    ) -> Result<SocketAddr, NetworkError> {
        let (host, port) = split_host_port(addr)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let family = self.narrow_family(family);
        let ips = dns::resolve(self, &host, family).await?;
        let chosen = ips
            .into_iter()
            .find(|ip| family.admits(ip) && self.addresses.iter().any(|a| a.is_ipv4() == ip.is_ipv4()))
            .ok_or_else(|| NetworkError::DnsResolutionFailed {
                host: host.clone(),
            })?;
        Ok(SocketAddr::new(chosen, port))
    }

    /// Restrict `Any` to the families the stack actually has addresses
    /// for, preferring v4.
    fn narrow_family(&self, family: Family) -> Family {
        match family {
            Family::Any if !self.has_family(Family::V4) => Family::V6,
            Family::Any if !self.has_family(Family::V6) => Family::V4,
            f => f,
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), NetworkError> {
    // bracketed v6 first, then a plain rsplit on ':'
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            let port = port.parse().map_err(|_| bad_addr(addr))?;
            return Ok((host.to_string(), port));
        }
        return Err(bad_addr(addr));
    }
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad_addr(addr))?;
    let port = port.parse().map_err(|_| bad_addr(addr))?;
    Ok((host.to_string(), port))
}

fn bad_addr(addr: &str) -> NetworkError {
    NetworkError::DnsResolutionFailed {
        host: addr.to_string(),
    }
}

fn endpoint_of(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(ip_to_smoltcp(addr.ip()), addr.port())
}

fn ip_to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

fn smoltcp_now() -> smoltcp::time::Instant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    smoltcp::time::Instant::from_millis(millis)
}

struct TcpEntry {
    handle: SocketHandle,
    to_client: Arc<BoundedQueue<Bytes>>,
    from_client: Arc<BoundedQueue<Bytes>>,
    pending_reply: Option<(oneshot::Sender<Result<TcpConn, NetworkError>>, TcpConn)>,
}

struct UdpEntry {
    handle: SocketHandle,
    to_client: Arc<BoundedQueue<Bytes>>,
    from_client: Arc<BoundedQueue<Bytes>>,
    remote: IpEndpoint,
}

struct Reactor {
    addresses: Vec<IpAddr>,
    mtu: usize,
    link: LinkEndpoint,
    wake: Arc<Notify>,
    next_port: u16,
}

impl Reactor {
    fn new(addresses: Vec<IpAddr>, mtu: usize, link: LinkEndpoint) -> Self {
        Self {
            addresses,
            mtu,
            link,
            wake: Arc::new(Notify::new()),
            next_port: EPHEMERAL_START,
        }
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port >= EPHEMERAL_END {
            EPHEMERAL_START
        } else {
            self.next_port + 1
        };
        port
    }

    fn local_ip_for(&self, remote: &IpEndpoint) -> Option<IpAddress> {
        let want_v4 = matches!(remote.addr, IpAddress::Ipv4(_));
        self.addresses
            .iter()
            .find(|a| a.is_ipv4() == want_v4)
            .map(|a| ip_to_smoltcp(*a))
    }

    async fn run(
        mut self,
        mut cmds: mpsc::Receiver<StackCmd>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut device = phy::VirtualDevice::new(self.mtu);
        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            smoltcp_now(),
        );
        iface.update_ip_addrs(|addrs| {
            for addr in &self.addresses {
                let cidr = match addr {
                    IpAddr::V4(v4) => IpCidr::new(IpAddress::Ipv4(*v4), 32),
                    IpAddr::V6(v6) => IpCidr::new(IpAddress::Ipv6(*v6), 128),
                };
                if addrs.push(cidr).is_err() {
                    warn!(%addr, "address table full; ignoring");
                }
            }
        });
        // everything routes into the tunnel; the gateway is notional
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
        let _ = iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1));

        let mut sockets = SocketSet::new(vec![]);
        let mut tcp_entries: Vec<TcpEntry> = Vec::new();
        let mut udp_entries: Vec<UdpEntry> = Vec::new();
        // open sockets outlive their NetStack handles (the forwarder keeps
        // only socket handles), so a closed command channel must not stop
        // the reactor; only shutdown or a dead link does
        let mut cmds_open = true;

        debug!(addresses = ?self.addresses, mtu = self.mtu, "netstack up");

        loop {
            // socket requests
            while let Ok(cmd) = cmds.try_recv() {
                self.handle_cmd(cmd, &mut iface, &mut sockets, &mut tcp_entries, &mut udp_entries);
            }

            // wire → stack
            for _ in 0..LINK_DRAIN_BURST {
                match self.link.try_read() {
                    Some(packet) => device.inbound.push_back(packet),
                    None => break,
                }
            }

            let now = smoltcp_now();
            let _ = iface.poll(now, &mut device, &mut sockets);

            // stack → wire
            while let Some(packet) = device.outbound.pop_front() {
                if self.link.write(packet).await.is_err() {
                    debug!("link closed; netstack exiting");
                    self.teardown(&tcp_entries, &udp_entries);
                    return;
                }
            }

            let mut progress = false;
            service_tcp(&mut sockets, &mut tcp_entries, &mut progress);
            service_udp(&mut sockets, &mut udp_entries, &mut progress);

            if progress || !device.inbound.is_empty() || !device.outbound.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            let delay = iface
                .poll_delay(now, &sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(IDLE_TICK);

            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("netstack shutdown");
                    self.link.close();
                    self.teardown(&tcp_entries, &udp_entries);
                    return;
                }
                cmd = cmds.recv(), if cmds_open => match cmd {
                    Some(cmd) => self.handle_cmd(
                        cmd, &mut iface, &mut sockets, &mut tcp_entries, &mut udp_entries,
                    ),
                    None => cmds_open = false,
                },
                _ = self.link.readable() => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn teardown(&self, tcp_entries: &[TcpEntry], udp_entries: &[UdpEntry]) {
        for e in tcp_entries {
            e.to_client.close();
            e.from_client.close();
        }
        for e in udp_entries {
            e.to_client.close();
            e.from_client.close();
        }
    }

    fn handle_cmd(
        &mut self,
        cmd: StackCmd,
        iface: &mut Interface,
        sockets: &mut SocketSet<'_>,
        tcp_entries: &mut Vec<TcpEntry>,
        udp_entries: &mut Vec<UdpEntry>,
    ) {
        match cmd {
            StackCmd::DialTcp { remote, reply } => {
                let Some(local_ip) = self.local_ip_for(&remote) else {
                    let _ = reply.send(Err(NetworkError::HostUnreachable {
                        endpoint: remote.to_string(),
                    }));
                    return;
                };
                let mut sock = tcp::Socket::new(
                    tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
                    tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
                );
                let local = IpListenEndpoint {
                    addr: Some(local_ip),
                    port: self.alloc_port(),
                };
                if let Err(e) = sock.connect(iface.context(), remote, local) {
                    let _ = reply.send(Err(NetworkError::ConnectionRefused {
                        endpoint: format!("{remote}: {e}"),
                    }));
                    return;
                }
                let to_client = Arc::new(BoundedQueue::new(CONN_QUEUE_CAP, Some(self.wake.clone())));
                let from_client =
                    Arc::new(BoundedQueue::new(CONN_QUEUE_CAP, Some(self.wake.clone())));
                let conn = TcpConn {
                    rx: to_client.clone(),
                    tx: from_client.clone(),
                };
                tcp_entries.push(TcpEntry {
                    handle: sockets.add(sock),
                    to_client,
                    from_client,
                    pending_reply: Some((reply, conn)),
                });
                trace!(%remote, "tcp connect started");
            }
            StackCmd::OpenUdp { remote, reply } => {
                let Some(local_ip) = self.local_ip_for(&remote) else {
                    let _ = reply.send(Err(NetworkError::HostUnreachable {
                        endpoint: remote.to_string(),
                    }));
                    return;
                };
                let rx_buf = udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
                    vec![0u8; UDP_PACKET_BUFFER],
                );
                let tx_buf = udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
                    vec![0u8; UDP_PACKET_BUFFER],
                );
                let mut sock = udp::Socket::new(rx_buf, tx_buf);
                let local = IpListenEndpoint {
                    addr: Some(local_ip),
                    port: self.alloc_port(),
                };
                if let Err(e) = sock.bind(local) {
                    let _ = reply.send(Err(NetworkError::BindFailed {
                        addr: format!("{local_ip}"),
                        reason: e.to_string(),
                    }));
                    return;
                }
                let to_client = Arc::new(BoundedQueue::new(UDP_QUEUE_CAP, Some(self.wake.clone())));
                let from_client =
                    Arc::new(BoundedQueue::new(UDP_QUEUE_CAP, Some(self.wake.clone())));
                let conn = UdpConn {
                    rx: to_client.clone(),
                    tx: from_client.clone(),
                };
                udp_entries.push(UdpEntry {
                    handle: sockets.add(sock),
                    to_client,
                    from_client,
                    remote,
                });
                let _ = reply.send(Ok(conn));
                trace!(%remote, "udp socket opened");
            }
        }
    }
}

fn service_tcp(sockets: &mut SocketSet<'_>, entries: &mut Vec<TcpEntry>, progress: &mut bool) {
    let mut remove: Vec<usize> = Vec::new();

    for (i, entry) in entries.iter_mut().enumerate() {
        let sock = sockets.get_mut::<tcp::Socket>(entry.handle);

        if let Some((reply, conn)) = entry.pending_reply.take() {
            if sock.may_send() {
                let _ = reply.send(Ok(conn));
                *progress = true;
            } else if sock.state() == tcp::State::Closed {
                let _ = reply.send(Err(NetworkError::ConnectionRefused {
                    endpoint: "virtual connect".into(),
                }));
                remove.push(i);
                continue;
            } else {
                entry.pending_reply = Some((reply, conn));
            }
        }

        // remote → client
        while sock.can_recv() && entry.to_client.has_space() {
            let mut buf = [0u8; 4096];
            match sock.recv_slice(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = entry.to_client.try_push(Bytes::copy_from_slice(&buf[..n]));
                    *progress = true;
                }
                Err(_) => break,
            }
        }

        // remote sent FIN and we drained everything
        if entry.pending_reply.is_none()
            && !sock.may_recv()
            && !sock.can_recv()
            && !entry.to_client.is_closed()
        {
            entry.to_client.close();
            *progress = true;
        }

        // client → remote
        while sock.can_send() {
            let Some(chunk) = entry.from_client.try_pop() else {
                break;
            };
            match sock.send_slice(&chunk) {
                Ok(n) if n == chunk.len() => *progress = true,
                Ok(n) => {
                    entry.from_client.requeue_front(chunk.slice(n..));
                    *progress = true;
                    break;
                }
                Err(_) => break,
            }
        }

        // client half-closed and everything flushed: send FIN
        if entry.from_client.is_closed() && entry.from_client.is_empty() && sock.is_open() {
            sock.close();
        }

        if sock.state() == tcp::State::Closed && entry.pending_reply.is_none() {
            remove.push(i);
        }
    }

    for &i in remove.iter().rev() {
        let entry = entries.remove(i);
        entry.to_client.close();
        entry.from_client.close();
        sockets.remove(entry.handle);
    }
}

fn service_udp(sockets: &mut SocketSet<'_>, entries: &mut Vec<UdpEntry>, progress: &mut bool) {
    let mut remove: Vec<usize> = Vec::new();

    for (i, entry) in entries.iter_mut().enumerate() {
        let sock = sockets.get_mut::<udp::Socket>(entry.handle);

        while sock.can_recv() && entry.to_client.has_space() {
            let mut buf = [0u8; UDP_PACKET_BUFFER];
            match sock.recv_slice(&mut buf) {
                Ok((n, meta)) => {
                    // connected-socket semantics: only the dialed remote
                    if meta.endpoint.addr == entry.remote.addr
                        && meta.endpoint.port == entry.remote.port
                    {
                        let _ = entry.to_client.try_push(Bytes::copy_from_slice(&buf[..n]));
                    }
                    *progress = true;
                }
                Err(_) => break,
            }
        }

        while sock.can_send() {
            let Some(datagram) = entry.from_client.try_pop() else {
                break;
            };
            if sock.send_slice(&datagram, entry.remote).is_ok() {
                *progress = true;
            }
        }

        if entry.from_client.is_closed()
            && entry.from_client.is_empty()
            && entry.to_client.is_closed()
        {
            remove.push(i);
        }
    }

    for &i in remove.iter().rev() {
        let entry = entries.remove(i);
        entry.to_client.close();
        entry.from_client.close();
        sockets.remove(entry.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_parses_network_names() {
        assert_eq!(Family::from_network("tcp").unwrap(), (Family::Any, true));
        assert_eq!(Family::from_network("tcp4").unwrap(), (Family::V4, true));
        assert_eq!(Family::from_network("udp6").unwrap(), (Family::V6, false));
        assert!(Family::from_network("unix").is_err());
    }

    #[test]
    fn split_host_port_handles_v6_brackets() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".into(), 443)
        );
        assert_eq!(
            split_host_port("[2606:4700::1]:80").unwrap(),
            ("2606:4700::1".into(), 80)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("[::1]").is_err());
    }

    #[tokio::test]
    async fn stack_emits_syn_onto_the_link_for_a_dial() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stack, link) = NetStack::create(
            vec!["172.16.0.2".parse().unwrap()],
            vec![],
            1330,
            shutdown_rx,
        );

        let dial = tokio::spawn(async move {
            stack
                .dial_tcp("1.2.3.4:80", Family::V4)
                .await
        });

        // the first packet the device reads should be an IPv4 TCP SYN
        let packet = tokio::time::timeout(Duration::from_secs(5), link.read())
            .await
            .expect("link produced a packet")
            .expect("link open");
        assert_eq!(packet[0] >> 4, 4, "IPv4");
        assert_eq!(packet[9], 6, "TCP");
        dial.abort();
    }

    #[tokio::test]
    async fn dial_on_missing_family_fails_fast() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stack, _link) = NetStack::create(
            vec!["172.16.0.2".parse().unwrap()],
            vec![],
            1330,
            shutdown_rx,
        );
        // no v6 address on the stack
        let err = stack
            .dial_udp("[2606:4700::1]:53", Family::V6)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::HostUnreachable { .. }));
    }

    #[tokio::test]
    async fn shutdown_closes_the_link() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_stack, link) = NetStack::create(
            vec!["172.16.0.2".parse().unwrap()],
            vec![],
            1330,
            shutdown_rx,
        );
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while link.read().await.is_some() {}
        })
        .await
        .expect("link closed after shutdown");
    }
}
