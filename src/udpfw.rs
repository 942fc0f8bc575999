//! UDP forwarder: host loopback ⇄ virtual stack
//!
//! Splices a host UDP listener onto a UDP socket inside the virtual stack.
//! This is what lets the outer tunnel carry the inner tunnel's ciphertext
//! in warp-in-warp: the inner device sends to a loopback port, and the
//! datagrams re-enter the outer stack here.
//!
//! The reply target is learned from the most recent inbound host datagram;
//! replies arriving before any client has spoken are dropped.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{NetworkError, Result};
use crate::netstack::{Family, NetStack};

/// Start the forwarder. Binds `local` on the host, opens a stack socket to
/// `dest`, and returns the actual local address. Tasks exit when
/// `shutdown` fires.
pub async fn start_udp_forwarder(
    local: SocketAddr,
    dest: &str,
    stack: &NetStack,
    mtu: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = UdpSocket::bind(local).await.map_err(|e| {
        NetworkError::BindFailed {
            addr: local.to_string(),
            reason: e.to_string(),
        }
    })?;
    let bound = listener.local_addr().map_err(NetworkError::Io)?;
    let listener = Arc::new(listener);

    let conn = Arc::new(stack.dial_udp(dest, Family::Any).await?);
    let client: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    // host → stack
    {
        let listener = listener.clone();
        let conn = conn.clone();
        let client = client.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            loop {
                let (n, from) = tokio::select! {
                    _ = shutdown.changed() => break,
                    r = listener.recv_from(&mut buf) => match r {
                        Ok(v) => v,
                        Err(e) => {
                            trace!(error = %e, "forwarder recv error");
                            continue;
                        }
                    },
                };
                *client.lock().expect("client addr lock") = Some(from);
                if conn.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            conn.close();
        });
    }

    // stack → host
    {
        let conn = conn.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    _ = shutdown.changed() => break,
                    d = conn.recv() => match d {
                        Some(d) => d,
                        None => break,
                    },
                };
                let target = *client.lock().expect("client addr lock");
                let Some(target) = target else {
                    trace!("reply before any client datagram; dropped");
                    continue;
                };
                if let Err(e) = listener.send_to(&datagram, target).await {
                    trace!(error = %e, "forwarder send error");
                }
            }
            conn.close();
        });
    }

    debug!(%bound, dest, "udp forwarder up");
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// The stack side is a black hole here (nothing answers inside the
    /// tunnel), so this exercises bind, the learned-client bookkeeping and
    /// clean shutdown rather than end-to-end traffic.
    #[tokio::test]
    async fn binds_ephemeral_port_and_shuts_down() {
        let (_app_shutdown_tx, app_shutdown_rx) = watch::channel(false);
        let (stack, _link) = NetStack::create(
            vec!["172.16.0.2".parse().unwrap()],
            vec![],
            1330,
            app_shutdown_rx,
        );

        let (fw_shutdown_tx, fw_shutdown_rx) = watch::channel(false);
        let bound = start_udp_forwarder(
            "127.0.0.1:0".parse().unwrap(),
            "203.0.113.9:2408",
            &stack,
            1330,
            fw_shutdown_rx,
        )
        .await
        .unwrap();
        assert_ne!(bound.port(), 0);

        // a client datagram is accepted and forwarded into the stack
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", bound).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = fw_shutdown_tx.send(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
