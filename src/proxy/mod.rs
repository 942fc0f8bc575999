//! Mixed-protocol local proxy
//!
//! One TCP listener, four protocols, autodetected from the first bytes:
//! SOCKS5 (0x05), SOCKS4/4a (0x04), HTTP CONNECT, and plain HTTP. Each
//! accepted connection is reduced to a [`ProxyRequest`] and handed to the
//! consumer, which dials the destination through the virtual stack and
//! splices bytes. The consumer confirms or rejects through the
//! [`ClientStream`], which renders the protocol-appropriate reply; clients
//! never see errors beyond that reply and a reset.

pub mod http;
pub mod socks;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;

/// Destination network of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Which protocol greeted us; decides the shape of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Socks5,
    Socks4,
    HttpConnect,
    HttpPlain,
}

/// The client connection, after protocol negotiation, with reply duties
/// still attached.
pub struct ClientStream {
    pub(crate) stream: TcpStream,
    pub(crate) greeting: Greeting,
}

impl ClientStream {
    /// Tell the client its connection is up. Plain HTTP has no such
    /// notion; the upstream response is the confirmation.
    pub async fn confirm(&mut self) -> std::io::Result<()> {
        match self.greeting {
            Greeting::Socks5 => {
                self.stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
            }
            Greeting::Socks4 => self.stream.write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0]).await,
            Greeting::HttpConnect => {
                self.stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
            }
            Greeting::HttpPlain => Ok(()),
        }
    }

    /// Report a dial failure and end the exchange.
    pub async fn reject(&mut self, err: &NetworkError) {
        let reply: Vec<u8> = match self.greeting {
            Greeting::Socks5 => {
                let code = match err {
                    NetworkError::DnsResolutionFailed { .. }
                    | NetworkError::HostUnreachable { .. } => 0x04,
                    NetworkError::ConnectionRefused { .. } => 0x05,
                    _ => 0x01,
                };
                vec![0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
            }
            Greeting::Socks4 => vec![0x00, 0x5b, 0, 0, 0, 0, 0, 0],
            Greeting::HttpConnect | Greeting::HttpPlain => {
                b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec()
            }
        };
        let _ = self.stream.write_all(&reply).await;
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// A stream to splice through the tunnel.
pub struct StreamRequest {
    pub network: Network,
    /// `host:port`; hostnames are resolved inside the tunnel.
    pub destination: String,
    pub conn: ClientStream,
    /// Bytes to deliver upstream before splicing (the rewritten head of a
    /// plain HTTP request).
    pub initial_data: Bytes,
}

/// A SOCKS5 UDP association. The relay socket is already bound and
/// announced to the client; the control stream pins the association's
/// lifetime.
pub struct AssociateRequest {
    pub control: TcpStream,
    pub relay: UdpSocket,
}

pub enum ProxyRequest {
    Stream(StreamRequest),
    Associate(AssociateRequest),
}

/// Accept loop. Runs until shutdown; each connection is negotiated on its
/// own task and the resulting request is pushed to `requests`.
pub async fn serve(
    listener: TcpListener,
    requests: mpsc::Sender<ProxyRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();
    debug!(addr = ?local, "mixed proxy listening");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => {
                debug!("proxy stopped accepting");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        trace!(%peer, "accepted");
        let requests = requests.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiate(stream, requests).await {
                trace!(%peer, error = %e, "negotiation failed");
            }
        });
    }
}

/// Sniff the first byte and run the matching protocol front end.
async fn negotiate(
    stream: TcpStream,
    requests: mpsc::Sender<ProxyRequest>,
) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Ok(());
    }

    let request = match first[0] {
        0x05 => socks::serve_socks5(stream).await?,
        0x04 => socks::serve_socks4(stream).await?,
        b if b.is_ascii_alphabetic() => http::serve_http(stream).await?,
        b => {
            trace!(first_byte = b, "unrecognized protocol");
            return Ok(());
        }
    };

    if let Some(request) = request {
        let _ = requests.send(request).await;
    }
    Ok(())
}

/// The relay bind address for a UDP association: same host interface the
/// control connection arrived on, ephemeral port.
pub(crate) fn relay_bind_addr(control: &TcpStream) -> SocketAddr {
    let ip = control
        .local_addr()
        .map(|a| a.ip())
        .unwrap_or_else(|_| "127.0.0.1".parse().expect("literal"));
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn pipe() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn socks5_confirm_and_reject_shapes() {
        let (server, mut client) = pipe().await;
        let mut cs = ClientStream {
            stream: server,
            greeting: Greeting::Socks5,
        };
        cs.confirm().await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x05);
        assert_eq!(buf[1], 0x00);

        cs.reject(&NetworkError::DnsResolutionFailed {
            host: "nope".into(),
        })
        .await;
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[1], 0x04, "host unreachable for resolution failures");
    }

    #[tokio::test]
    async fn socks4_and_http_replies() {
        let (server, mut client) = pipe().await;
        let mut cs = ClientStream {
            stream: server,
            greeting: Greeting::Socks4,
        };
        cs.reject(&NetworkError::ConnectionRefused {
            endpoint: "x".into(),
        })
        .await;
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[..2], [0x00, 0x5b]);

        let (server, mut client) = pipe().await;
        let mut cs = ClientStream {
            stream: server,
            greeting: Greeting::HttpConnect,
        };
        cs.confirm().await.unwrap();
        let mut text = vec![0u8; 39];
        client.read_exact(&mut text).await.unwrap();
        assert!(text.starts_with(b"HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn unknown_first_byte_is_dropped_quietly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, req_tx, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0xff, 0x00]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(req_rx.try_recv().is_err());
        let _ = shutdown_tx.send(true);
    }
}
