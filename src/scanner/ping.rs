//! Candidate probes
//!
//! WARP mode is the hot path: a genuine Noise IK initiation on a fresh UDP
//! socket, timed until the handshake response lands. The TCP/TLS/HTTP/QUIC
//! modes are diagnostic latency probes against a configured host; they do
//! not complete their protocols, they time the first sign of life.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use super::{IpInfo, ScannerOptions};
use crate::error::{NetworkError, WarpError};
use crate::wg::handshake::{random_sender_index, InitiatorHandshake};
use crate::wg::messages::{HandshakeResponse, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    Warp,
    Tcp,
    Tls,
    Http,
    Quic,
}

/// Probe one candidate. The timeout is twice the acceptable RTT: anything
/// slower is useless even if it would eventually answer.
pub async fn probe(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let deadline = opts.max_rtt * 2;
    let work = async {
        match opts.ping_mode {
            PingMode::Warp => warp_ping(opts, addr).await,
            PingMode::Tcp => tcp_ping(opts, addr).await,
            PingMode::Tls => tls_ping(opts, addr).await,
            PingMode::Http => http_ping(opts, addr).await,
            PingMode::Quic => quic_ping(opts, addr).await,
        }
    };
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::HostUnreachable {
            endpoint: addr.to_string(),
        }
        .into()),
    }
}

/// Send a real handshake initiation and time the response.
async fn warp_ping(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let target = SocketAddr::new(addr, opts.warp_port);
    let socket = bind_udp_for(addr).await?;
    socket.connect(target).await.map_err(NetworkError::Io)?;

    let mut handshake = InitiatorHandshake::new(
        opts.warp_private_key,
        opts.warp_peer_public_key,
        [0u8; 32],
        random_sender_index(),
    );
    let initiation = handshake.create_initiation(None)?;

    let started = Instant::now();
    socket.send(&initiation).await.map_err(NetworkError::Io)?;

    let mut buf = [0u8; 256];
    loop {
        let n = socket.recv(&mut buf).await.map_err(NetworkError::Io)?;
        // any well-formed response counts; junk is ignored and we keep
        // listening until the outer deadline fires
        if n == HandshakeResponse::SIZE && buf[0] == MessageType::HandshakeResponse as u8 {
            let rtt = started.elapsed();
            trace!(%target, ?rtt, "warp ping ok");
            return Ok(IpInfo {
                addr_port: target,
                rtt,
                created_at: Instant::now(),
            });
        }
    }
}

async fn tcp_ping(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let target = SocketAddr::new(addr, opts.port);
    let started = Instant::now();
    let _stream = TcpStream::connect(target).await.map_err(NetworkError::Io)?;
    Ok(done(target, started))
}

async fn tls_ping(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let target = SocketAddr::new(addr, opts.port);
    let started = Instant::now();
    let mut stream = TcpStream::connect(target).await.map_err(NetworkError::Io)?;
    stream
        .write_all(&client_hello(&opts.hostname))
        .await
        .map_err(NetworkError::Io)?;
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await.map_err(NetworkError::Io)?;
    if n == 0 {
        return Err(NetworkError::ConnectionRefused {
            endpoint: target.to_string(),
        }
        .into());
    }
    Ok(done(target, started))
}

async fn http_ping(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let target = SocketAddr::new(addr, opts.port);
    let started = Instant::now();
    let mut stream = TcpStream::connect(target).await.map_err(NetworkError::Io)?;
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        opts.http_path, opts.hostname
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(NetworkError::Io)?;
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await.map_err(NetworkError::Io)?;
    if n == 0 {
        return Err(NetworkError::ConnectionRefused {
            endpoint: target.to_string(),
        }
        .into());
    }
    Ok(done(target, started))
}

/// A padded QUIC-v1-shaped Initial. The server can't decrypt a real
/// connection out of it, but a QUIC endpoint answers something (usually a
/// Version Negotiation or Initial), which is all the probe needs.
async fn quic_ping(opts: &ScannerOptions, addr: IpAddr) -> Result<IpInfo, WarpError> {
    let target = SocketAddr::new(addr, opts.port);
    let socket = bind_udp_for(addr).await?;
    socket.connect(target).await.map_err(NetworkError::Io)?;

    let mut datagram = vec![0u8; 1200];
    rand::Rng::fill(&mut rand::thread_rng(), datagram.as_mut_slice());
    datagram[0] = 0xc0; // long header, Initial
    datagram[1..5].copy_from_slice(&1u32.to_be_bytes()); // version 1
    datagram[5] = 8; // DCID len
    datagram[14] = 0; // SCID len

    let started = Instant::now();
    socket.send(&datagram).await.map_err(NetworkError::Io)?;
    let mut buf = [0u8; 2048];
    socket.recv(&mut buf).await.map_err(NetworkError::Io)?;
    Ok(done(target, started))
}

fn done(target: SocketAddr, started: Instant) -> IpInfo {
    IpInfo {
        addr_port: target,
        rtt: started.elapsed(),
        created_at: Instant::now(),
    }
}

async fn bind_udp_for(addr: IpAddr) -> Result<UdpSocket, WarpError> {
    let bind: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().expect("literal")
    } else {
        "0.0.0.0:0".parse().expect("literal")
    };
    Ok(UdpSocket::bind(bind).await.map_err(NetworkError::Io)?)
}

/// Minimal TLS 1.2 ClientHello with an SNI extension; enough to make a TLS
/// endpoint answer with a ServerHello or an alert.
fn client_hello(hostname: &str) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut random = [0u8; 32];
    rand::Rng::fill(&mut rng, &mut random);

    let sni_name = hostname.as_bytes();
    let mut sni = Vec::new();
    sni.extend_from_slice(&0u16.to_be_bytes()); // extension: server_name
    let list_len = (sni_name.len() + 3) as u16;
    sni.extend_from_slice(&(list_len + 2).to_be_bytes());
    sni.extend_from_slice(&list_len.to_be_bytes());
    sni.push(0); // host_name
    sni.extend_from_slice(&(sni_name.len() as u16).to_be_bytes());
    sni.extend_from_slice(sni_name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
    body.extend_from_slice(&random);
    body.push(0); // no session id
    // a few common suites
    body.extend_from_slice(&6u16.to_be_bytes());
    body.extend_from_slice(&[0xc0, 0x2f, 0xc0, 0x30, 0x00, 0x9c]);
    body.extend_from_slice(&[1, 0]); // null compression
    body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni);

    let mut handshake = Vec::new();
    handshake.push(1); // client_hello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(22); // handshake record
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn client_hello_is_a_handshake_record_with_sni() {
        let hello = client_hello("cloudflare.com");
        assert_eq!(hello[0], 22);
        assert_eq!(&hello[1..3], &[0x03, 0x01]);
        let len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(hello.len(), 5 + len);
        let hostname = b"cloudflare.com";
        assert!(hello
            .windows(hostname.len())
            .any(|w| w == hostname.as_slice()));
    }

    #[tokio::test]
    async fn warp_ping_times_a_canned_response() {
        // fake responder: reflect any 148-byte initiation with a 92-byte
        // type-2 message
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 148);
            let mut reply = [0u8; 92];
            reply[0] = 2;
            responder.send_to(&reply, from).await.unwrap();
        });

        let opts = ScannerOptions {
            warp_port: responder_addr.port(),
            max_rtt: Duration::from_secs(1),
            ..Default::default()
        };
        let info = probe(&opts, responder_addr.ip()).await.unwrap();
        assert_eq!(info.addr_port, responder_addr);
        assert!(info.rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn silent_candidate_times_out_within_twice_max_rtt() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let opts = ScannerOptions {
            warp_port: addr.port(),
            max_rtt: Duration::from_millis(100),
            ..Default::default()
        };
        let started = Instant::now();
        assert!(probe(&opts, addr.ip()).await.is_err());
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}
