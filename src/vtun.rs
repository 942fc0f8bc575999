//! Virtual tunnel assembly
//!
//! Glues one WireGuard device onto one virtual stack and serves the mixed
//! proxy out of it. This is the layer the orchestrator composes: plain mode
//! uses one of these; warp-in-warp stacks two with the UDP forwarder in
//! between.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::config::Configuration;
use crate::error::{NetworkError, Result};
use crate::netstack::{Family, NetStack, TcpConn, UdpConn};
use crate::proxy::{self, AssociateRequest, ProxyRequest, StreamRequest};
use crate::wg::{Device, DeviceConfig};

/// A WireGuard device up and terminated on an in-process stack.
pub struct VirtualTun {
    pub stack: NetStack,
    pub device: Arc<Device>,
}

/// Build the stack, configure the device from `conf`, and bring it up.
pub async fn start_wireguard(
    conf: &Configuration,
    shutdown: watch::Receiver<bool>,
) -> Result<VirtualTun> {
    let (stack, link) = NetStack::create(
        conf.interface.addresses.clone(),
        conf.interface.dns.clone(),
        conf.interface.mtu,
        shutdown.clone(),
    );

    let device = Arc::new(Device::new(link, DeviceConfig::default()));
    device.ipc_set(&conf.to_uapi()?)?;
    device.up().await?;

    // the device follows the orchestrator's cancellation
    {
        let device = device.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            device.down().await;
        });
    }

    Ok(VirtualTun { stack, device })
}

impl VirtualTun {
    /// Bind the mixed proxy and serve requests through this tunnel.
    /// Returns the actual bound address (useful with port 0).
    pub async fn start_proxy(
        &self,
        bind: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            NetworkError::BindFailed {
                addr: bind.to_string(),
                reason: e.to_string(),
            }
        })?;
        let bound = listener.local_addr().map_err(NetworkError::Io)?;

        let (req_tx, mut req_rx) = mpsc::channel::<ProxyRequest>(64);
        tokio::spawn(proxy::serve(listener, req_tx, shutdown.clone()));

        let stack = self.stack.clone();
        let mut consumer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = consumer_shutdown.changed() => return,
                    r = req_rx.recv() => match r {
                        Some(r) => r,
                        None => return,
                    },
                };
                let stack = stack.clone();
                let shutdown = consumer_shutdown.clone();
                tokio::spawn(async move {
                    match request {
                        ProxyRequest::Stream(req) => handle_stream(stack, req).await,
                        ProxyRequest::Associate(req) => {
                            handle_associate(stack, req, shutdown).await
                        }
                    }
                });
            }
        });

        info!(%bound, "proxy serving through tunnel");
        Ok(bound)
    }
}

/// Dial the destination through the stack and splice. Failures go back to
/// the client as a protocol reply, never as an error.
async fn handle_stream(stack: NetStack, mut req: StreamRequest) {
    info!(
        protocol = req.network.as_str(),
        destination = %req.destination,
        "handling connection"
    );
    let conn = match stack.dial_tcp(&req.destination, Family::Any).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(destination = %req.destination, error = %e, "dial failed");
            req.conn.reject(&e).await;
            return;
        }
    };

    if req.conn.confirm().await.is_err() {
        return;
    }
    if !req.initial_data.is_empty() && conn.write(req.initial_data.clone()).await.is_err() {
        return;
    }

    bridge(req.conn.stream, conn).await;
}

/// Full-duplex copy with graceful half-close in both directions.
async fn bridge(mut stream: TcpStream, conn: TcpConn) {
    let (mut reader, mut writer) = stream.split();
    let mut buf = BytesMut::with_capacity(65536);
    let mut client_eof = false;
    let mut remote_eof = false;

    while !(client_eof && remote_eof) {
        tokio::select! {
            res = reader.read_buf(&mut buf), if !client_eof => match res {
                Ok(0) => {
                    client_eof = true;
                    conn.shutdown_send();
                }
                Ok(_) => {
                    if conn.write(buf.split().freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    trace!(error = %e, "client read error");
                    break;
                }
            },
            chunk = conn.read(), if !remote_eof => match chunk {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => {
                    remote_eof = true;
                    let _ = writer.shutdown().await;
                }
            },
        }
    }
    conn.close();
}

/// RFC 1928 UDP relay. The association lives as long as its control
/// connection; per-destination stack sockets are opened on demand.
async fn handle_associate(
    stack: NetStack,
    req: AssociateRequest,
    mut shutdown: watch::Receiver<bool>,
) {
    let AssociateRequest { mut control, relay } = req;
    let relay = Arc::new(relay);
    let client: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let mut conns: HashMap<String, Arc<UdpConn>> = HashMap::new();

    let mut control_buf = [0u8; 64];
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            // any read (or EOF) on the control stream ends the association
            res = control.read(&mut control_buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            res = relay.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        trace!(error = %e, "relay recv error");
                        continue;
                    }
                };
                *client.lock().expect("client lock") = Some(from);
                let Some((dest, header, payload)) = parse_udp_request(&buf[..n]) else {
                    continue;
                };
                let conn = match conns.get(&dest) {
                    Some(conn) => conn.clone(),
                    None => {
                        let conn = match stack.dial_udp(&dest, Family::Any).await {
                            Ok(conn) => Arc::new(conn),
                            Err(e) => {
                                debug!(destination = %dest, error = %e, "udp dial failed");
                                continue;
                            }
                        };
                        conns.insert(dest.clone(), conn.clone());
                        spawn_reply_pump(conn.clone(), header, relay.clone(), client.clone());
                        conn
                    }
                };
                let _ = conn.send(Bytes::copy_from_slice(payload)).await;
            }
        }
    }

    for conn in conns.values() {
        conn.close();
    }
    trace!("udp association closed");
}

/// Pump replies from one stack socket back to the client, re-wrapped with
/// the request's address header.
fn spawn_reply_pump(
    conn: Arc<UdpConn>,
    header: Vec<u8>,
    relay: Arc<UdpSocket>,
    client: Arc<Mutex<Option<SocketAddr>>>,
) {
    tokio::spawn(async move {
        while let Some(datagram) = conn.recv().await {
            let target = *client.lock().expect("client lock");
            let Some(target) = target else { continue };
            let mut wrapped = Vec::with_capacity(header.len() + datagram.len());
            wrapped.extend_from_slice(&header);
            wrapped.extend_from_slice(&datagram);
            if relay.send_to(&wrapped, target).await.is_err() {
                break;
            }
        }
    });
}

/// Parse a SOCKS5 UDP request: RSV(2) FRAG(1) ATYP(1) ADDR PORT DATA.
/// Returns (destination, reusable reply header, payload). Fragmented
/// datagrams are dropped.
fn parse_udp_request(datagram: &[u8]) -> Option<(String, Vec<u8>, &[u8])> {
    if datagram.len() < 4 || datagram[2] != 0 {
        return None;
    }
    let (dest, data_off) = match datagram[3] {
        0x01 => {
            if datagram.len() < 10 {
                return None;
            }
            let ip = std::net::Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
            let port = u16::from_be_bytes([datagram[8], datagram[9]]);
            (format!("{ip}:{port}"), 10)
        }
        0x03 => {
            let len = *datagram.get(4)? as usize;
            let end = 5 + len + 2;
            if datagram.len() < end {
                return None;
            }
            let host = std::str::from_utf8(&datagram[5..5 + len]).ok()?;
            let port = u16::from_be_bytes([datagram[end - 2], datagram[end - 1]]);
            (format!("{host}:{port}"), end)
        }
        0x04 => {
            if datagram.len() < 22 {
                return None;
            }
            let octets: [u8; 16] = datagram[4..20].try_into().ok()?;
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([datagram[20], datagram[21]]);
            (format!("[{ip}]:{port}"), 22)
        }
        _ => return None,
    };
    Some((dest, datagram[..data_off].to_vec(), &datagram[data_off..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_request_parsing_v4_and_domain() {
        // 8.8.8.8:53, payload "abc"
        let mut datagram = vec![0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53];
        datagram.extend_from_slice(b"abc");
        let (dest, header, payload) = parse_udp_request(&datagram).unwrap();
        assert_eq!(dest, "8.8.8.8:53");
        assert_eq!(header.len(), 10);
        assert_eq!(payload, b"abc");

        let mut datagram = vec![0, 0, 0, 0x03, 7];
        datagram.extend_from_slice(b"dns.com");
        datagram.extend_from_slice(&53u16.to_be_bytes());
        datagram.extend_from_slice(b"xyz");
        let (dest, _, payload) = parse_udp_request(&datagram).unwrap();
        assert_eq!(dest, "dns.com:53");
        assert_eq!(payload, b"xyz");
    }

    #[test]
    fn fragmented_and_short_datagrams_dropped() {
        // frag byte set
        let datagram = vec![0, 0, 1, 0x01, 8, 8, 8, 8, 0, 53];
        assert!(parse_udp_request(&datagram).is_none());
        assert!(parse_udp_request(&[0, 0]).is_none());
        assert!(parse_udp_request(&[0, 0, 0, 0x01, 8, 8]).is_none());
    }

    #[tokio::test]
    async fn start_wireguard_brings_device_up() {
        let profile = "\
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 172.16.0.2/32
DNS = 1.1.1.1

[Peer]
PublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=
AllowedIPs = 0.0.0.0/0
Endpoint = x
";
        let mut conf = Configuration::parse(profile, "127.0.0.1:59999").unwrap();
        conf.interface.mtu = 1330;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let vtun = start_wireguard(&conf, shutdown_rx.clone()).await.unwrap();
        assert!(vtun.device.is_running());

        // the proxy binds and reports its address
        let bound = vtun
            .start_proxy("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();
        assert_ne!(bound.port(), 0);

        let _ = shutdown_tx.send(true);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!vtun.device.is_running());
    }
}
