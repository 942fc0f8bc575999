//! Psiphon chaining (cfon mode)
//!
//! The Psiphon tunnel core is an opaque external collaborator; we run it as
//! a child process and speak its JSON notice stream. Establishment is a
//! small state machine driven by typed notices with a single result
//! channel, retried on a one-second tick under an overall deadline.
//!
//! Data path: Psiphon owns the user-facing SOCKS port and dials its
//! upstream through our Warp proxy (`UpstreamProxyURL`), so its egress
//! traffic rides the tunnel.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{PsiphonError, Result};

/// Establishment budget for a single attempt.
const ESTABLISH_TIMEOUT_SECS: u64 = 60;
/// Overall budget across attempts.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(120);
/// Pause between attempts.
const RETRY_TICK: Duration = Duration::from_secs(1);

/// A notice emitted by the tunnel core, reduced to the events we act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeEvent {
    ListeningSocksProxyPort { port: u16 },
    ListeningHttpProxyPort { port: u16 },
    EstablishTunnelTimeout,
    Tunnels { count: u64 },
    Other { notice_type: String },
}

#[derive(Debug, Deserialize)]
struct RawNotice {
    #[serde(rename = "noticeType")]
    notice_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl NoticeEvent {
    /// Parse one line of the notice stream.
    pub fn parse(line: &str) -> std::result::Result<Self, PsiphonError> {
        let raw: RawNotice = serde_json::from_str(line)
            .map_err(|e| PsiphonError::MalformedNotice(e.to_string()))?;
        let event = match raw.notice_type.as_str() {
            "ListeningSocksProxyPort" => Self::ListeningSocksProxyPort {
                port: raw.data.get("port").and_then(|p| p.as_u64()).unwrap_or(0) as u16,
            },
            "ListeningHttpProxyPort" => Self::ListeningHttpProxyPort {
                port: raw.data.get("port").and_then(|p| p.as_u64()).unwrap_or(0) as u16,
            },
            "EstablishTunnelTimeout" => Self::EstablishTunnelTimeout,
            "Tunnels" => Self::Tunnels {
                count: raw.data.get("count").and_then(|c| c.as_u64()).unwrap_or(0),
            },
            _ => Self::Other {
                notice_type: raw.notice_type,
            },
        };
        Ok(event)
    }
}

/// Establishment progress, driven purely by notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    TunnelUp { socks_port: u16 },
    TimedOut,
    Failed { reason: String },
}

/// Folds notices into the state machine. Terminal states stick.
pub fn advance(state: &TunnelState, event: &NoticeEvent, socks_port: &mut u16) -> TunnelState {
    if !matches!(state, TunnelState::Dialing) {
        return state.clone();
    }
    match event {
        NoticeEvent::ListeningSocksProxyPort { port } => {
            *socks_port = *port;
            TunnelState::Dialing
        }
        NoticeEvent::Tunnels { count } if *count > 0 => TunnelState::TunnelUp {
            socks_port: *socks_port,
        },
        NoticeEvent::EstablishTunnelTimeout => TunnelState::TimedOut,
        _ => TunnelState::Dialing,
    }
}

/// The opaque tunnel core. The production implementation spawns the
/// `psiphon-tunnel-core` console client; tests inject canned notices.
pub trait TunnelController: Send + Sync + 'static {
    fn start(
        &self,
        config_json: String,
        notices: mpsc::UnboundedSender<NoticeEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>;
}

/// Runs the console client and parses its stdout notice stream.
pub struct ChildProcessController {
    pub binary: String,
}

impl Default for ChildProcessController {
    fn default() -> Self {
        Self {
            binary: "psiphon-tunnel-core".to_string(),
        }
    }
}

impl TunnelController for ChildProcessController {
    fn start(
        &self,
        config_json: String,
        notices: mpsc::UnboundedSender<NoticeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let binary = self.binary.clone();
        tokio::spawn(async move {
            let config_path = std::env::temp_dir().join(format!(
                "psiphon-config-{}.json",
                std::process::id()
            ));
            if let Err(e) = tokio::fs::write(&config_path, &config_json).await {
                warn!(error = %e, "failed to write psiphon config");
                return;
            }

            let child = Command::new(&binary)
                .arg("-config")
                .arg(&config_path)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            let mut child = match child {
                Ok(c) => c,
                Err(e) => {
                    warn!(binary, error = %e, "failed to spawn tunnel core");
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match NoticeEvent::parse(&line) {
                            Ok(event) => {
                                trace!(?event, "notice");
                                if notices.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => trace!(error = %e, "unparseable notice line"),
                        },
                        Ok(None) | Err(_) => break,
                    },
                }
            }
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(&config_path).await;
        })
    }
}

/// One up tunnel.
#[derive(Debug)]
pub struct Tunnel {
    pub socks_port: u16,
}

/// Render the tunnel-core configuration. `ListenInterface` collapses
/// loopback binds to the default interface, matching the console client's
/// expectations.
pub fn build_config(warp_bind: SocketAddr, local_bind: SocketAddr, country: &str) -> String {
    let listen_interface = if local_bind.ip().is_loopback() {
        ""
    } else {
        "any"
    };
    serde_json::json!({
        "EgressRegion": country,
        "ListenInterface": listen_interface,
        "LocalSocksProxyPort": local_bind.port(),
        "UpstreamProxyURL": format!("socks5://{warp_bind}"),
        "DisableLocalHTTPProxy": true,
        "EstablishTunnelTimeoutSeconds": ESTABLISH_TIMEOUT_SECS,
        "PropagationChannelId": "FFFFFFFFFFFFFFFF",
        "SponsorId": "FFFFFFFFFFFFFFFF",
        "RemoteServerListDownloadFilename": "remote_server_list",
        "RemoteServerListUrl": "https://s3.amazonaws.com//psiphon/web/mjr4-p23r-puwl/server_list_compressed",
        "UseIndistinguishableTLS": true,
        "AllowDefaultDNSResolverWithBindToDevice": true,
        "ClientPlatform": "Android_4.0.4_com.example.exampleClientLibraryApp",
        "NetworkID": "test",
        "DataRootDirectory": "."
    })
    .to_string()
}

/// Single establishment attempt: start the controller and fold notices
/// until a terminal state.
pub async fn start_tunnel(
    controller: &dyn TunnelController,
    config_json: String,
    shutdown: watch::Receiver<bool>,
) -> std::result::Result<Tunnel, PsiphonError> {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = controller.start(config_json, notice_tx, stop_rx);

    let mut state = TunnelState::Dialing;
    let mut socks_port = 0u16;
    let mut shutdown = shutdown;

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Err(PsiphonError::Canceled),
            event = notice_rx.recv() => {
                state = match event {
                    Some(event) => advance(&state, &event, &mut socks_port),
                    None => TunnelState::Failed {
                        reason: "notice stream ended".into(),
                    },
                };
                match &state {
                    TunnelState::TunnelUp { socks_port } => {
                        break Ok(Tunnel { socks_port: *socks_port });
                    }
                    TunnelState::TimedOut => break Err(PsiphonError::Timeout),
                    TunnelState::Failed { reason } => {
                        break Err(PsiphonError::Controller(reason.clone()));
                    }
                    TunnelState::Dialing => {}
                }
            }
        }
    };

    let _ = stop_tx.send(true);
    if result.is_err() {
        worker.abort();
    }
    result
}

/// The cfon entry point: retry establishment every second under the
/// two-minute deadline.
pub async fn run_psiphon(
    controller: &dyn TunnelController,
    warp_bind: SocketAddr,
    local_bind: SocketAddr,
    country: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(country, "psiphon handshake starting");
    let config = build_config(warp_bind, local_bind, country);
    let started = std::time::Instant::now();
    let mut ticker = tokio::time::interval(RETRY_TICK);
    let mut shutdown_outer = shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown_outer.changed() => return Err(PsiphonError::Canceled.into()),
            _ = ticker.tick() => {}
        }
        if started.elapsed() > HANDSHAKE_DEADLINE {
            return Err(PsiphonError::Timeout.into());
        }

        match start_tunnel(controller, config.clone(), shutdown.clone()).await {
            Ok(tunnel) => {
                info!(
                    socks_port = tunnel.socks_port,
                    elapsed = ?started.elapsed(),
                    "psiphon established"
                );
                return Ok(());
            }
            Err(PsiphonError::Canceled) => return Err(PsiphonError::Canceled.into()),
            Err(e) => {
                debug!(error = %e, "psiphon attempt failed; retrying");
                continue;
            }
        }
    }
}
