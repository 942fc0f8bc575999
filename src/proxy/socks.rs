//! SOCKS5 and SOCKS4/4a front ends

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use super::{
    relay_bind_addr, AssociateRequest, ClientStream, Greeting, Network, ProxyRequest,
    StreamRequest,
};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5: no-auth method negotiation, then CONNECT or UDP-ASSOCIATE.
pub async fn serve_socks5(mut stream: TcpStream) -> std::io::Result<Option<ProxyRequest>> {
    // method selection
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Ok(None);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_UNACCEPTABLE])
            .await?;
        return Ok(None);
    }
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    // request
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS5_VERSION {
        return Ok(None);
    }
    let destination = match read_socks5_addr(&mut stream, req[3]).await? {
        Some(dest) => dest,
        None => {
            socks5_error(&mut stream, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };

    match req[1] {
        CMD_CONNECT => Ok(Some(ProxyRequest::Stream(StreamRequest {
            network: Network::Tcp,
            destination,
            conn: ClientStream {
                stream,
                greeting: Greeting::Socks5,
            },
            initial_data: Bytes::new(),
        }))),
        CMD_UDP_ASSOCIATE => {
            // the client's claimed address is routinely 0.0.0.0; the real
            // source is learned from the first relay datagram
            let relay = UdpSocket::bind(relay_bind_addr(&stream)).await?;
            let bound = relay.local_addr()?;
            let mut reply = vec![SOCKS5_VERSION, 0x00, 0x00];
            match bound.ip() {
                std::net::IpAddr::V4(ip) => {
                    reply.push(ATYP_IPV4);
                    reply.extend_from_slice(&ip.octets());
                }
                std::net::IpAddr::V6(ip) => {
                    reply.push(ATYP_IPV6);
                    reply.extend_from_slice(&ip.octets());
                }
            }
            reply.extend_from_slice(&bound.port().to_be_bytes());
            stream.write_all(&reply).await?;
            trace!(%bound, "udp associate relay bound");
            Ok(Some(ProxyRequest::Associate(AssociateRequest {
                control: stream,
                relay,
            })))
        }
        // BIND and anything else
        _ => {
            socks5_error(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            Ok(None)
        }
    }
}

async fn socks5_error(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Parse a SOCKS5 address into `host:port`. Domains are passed through
/// unresolved so the lookup happens inside the tunnel.
async fn read_socks5_addr(
    stream: &mut TcpStream,
    atyp: u8,
) -> std::io::Result<Option<String>> {
    match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(Some(format!("{ip}:{port}")))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            let port = u16::from_be_bytes(port);
            match std::str::from_utf8(&name) {
                Ok(host) => Ok(Some(format!("{host}:{port}"))),
                Err(_) => Ok(None),
            }
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv6Addr::from(<[u8; 16]>::try_from(&raw[..16]).expect("sized"));
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(Some(format!("[{ip}]:{port}")))
        }
        _ => Ok(None),
    }
}

/// SOCKS4 and 4a, CONNECT only.
pub async fn serve_socks4(mut stream: TcpStream) -> std::io::Result<Option<ProxyRequest>> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS4_VERSION {
        return Ok(None);
    }
    if head[1] != CMD_CONNECT {
        stream.write_all(&[0x00, 0x5b, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(None);
    }
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

    // user id, NUL-terminated; discarded
    read_until_nul(&mut stream).await?;

    // SOCKS4a marker: 0.0.0.x with x non-zero means a hostname follows
    let destination = if head[4] == 0 && head[5] == 0 && head[6] == 0 && head[7] != 0 {
        let host = read_until_nul(&mut stream).await?;
        match String::from_utf8(host) {
            Ok(host) => format!("{host}:{port}"),
            Err(_) => return Ok(None),
        }
    } else {
        format!("{ip}:{port}")
    };

    Ok(Some(ProxyRequest::Stream(StreamRequest {
        network: Network::Tcp,
        destination,
        conn: ClientStream {
            stream,
            greeting: Greeting::Socks4,
        },
        initial_data: Bytes::new(),
    })))
}

async fn read_until_nul(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        if out.len() > 512 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "socks4 field too long",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pipe() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn socks5_connect_with_domain() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_socks5(server));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = serve.await.unwrap().unwrap().unwrap();
        match request {
            ProxyRequest::Stream(s) => {
                assert_eq!(s.network, Network::Tcp);
                assert_eq!(s.destination, "example.com:443");
                assert_eq!(s.conn.greeting, Greeting::Socks5);
            }
            _ => panic!("expected stream request"),
        }
    }

    #[tokio::test]
    async fn socks5_bind_rejected() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_socks5(server));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = [0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
        assert!(serve.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn socks5_udp_associate_binds_a_relay() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_socks5(server));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);
        let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
        assert_ne!(relay_port, 0);

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Associate(a) => {
                assert_eq!(a.relay.local_addr().unwrap().port(), relay_port);
            }
            _ => panic!("expected associate request"),
        }
    }

    #[tokio::test]
    async fn socks4a_reads_trailing_hostname() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_socks4(server));

        let mut req = vec![0x04, 0x01];
        req.extend_from_slice(&80u16.to_be_bytes());
        req.extend_from_slice(&[0, 0, 0, 1]); // 4a marker
        req.extend_from_slice(b"user\0");
        req.extend_from_slice(b"example.org\0");
        client.write_all(&req).await.unwrap();

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Stream(s) => {
                assert_eq!(s.destination, "example.org:80");
                assert_eq!(s.conn.greeting, Greeting::Socks4);
            }
            _ => panic!("expected stream request"),
        }
    }

    #[tokio::test]
    async fn socks4_plain_connect() {
        let (server, mut client) = pipe().await;
        let serve = tokio::spawn(serve_socks4(server));

        let mut req = vec![0x04, 0x01];
        req.extend_from_slice(&8080u16.to_be_bytes());
        req.extend_from_slice(&[10, 0, 0, 9]);
        req.extend_from_slice(b"\0");
        client.write_all(&req).await.unwrap();

        match serve.await.unwrap().unwrap().unwrap() {
            ProxyRequest::Stream(s) => assert_eq!(s.destination, "10.0.0.9:8080"),
            _ => panic!("expected stream request"),
        }
    }
}
