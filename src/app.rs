//! Scenario orchestration
//!
//! Decides between plain Warp, warp-in-warp (gool) and Warp+Psiphon
//! (cfon), selects endpoints (explicit, scanned, or random from the
//! published ranges), and wires devices, stacks, forwarder and proxy
//! together. Owns nothing long-lived itself: every component follows the
//! root shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{ConfigError, NetworkError, Result, ScanError};
use crate::psiphon::{self, TunnelController};
use crate::scanner::{IpInfo, PingMode, Scanner, ScannerOptions};
use crate::udpfw;
use crate::vtun::{start_wireguard, VirtualTun};
use crate::warp;

/// MTU for a single hop.
pub const SINGLE_MTU: usize = 1330;
/// MTU for the inner hop of warp-in-warp; headroom for the outer overhead.
pub const DOUBLE_MTU: usize = 1280;

const PRIMARY_DIR: &str = "stuff/primary";
const SECONDARY_DIR: &str = "stuff/secondary";

/// Overall scan budget.
const SCAN_DEADLINE: Duration = Duration::from_secs(120);

pub struct PsiphonOptions {
    pub country: String,
    pub controller: Arc<dyn TunnelController>,
}

pub struct ScanOptions {
    pub v4: bool,
    pub v6: bool,
    pub max_rtt: Duration,
}

pub struct WarpOptions {
    pub bind: SocketAddr,
    /// Explicit endpoint; a random Warp endpoint is drawn when absent.
    pub endpoint: Option<String>,
    /// Warp+ license, if any. Identities are written by the external
    /// registration client; we only cross-check.
    pub license: Option<String>,
    pub psiphon: Option<PsiphonOptions>,
    pub gool: bool,
    pub scan: Option<ScanOptions>,
}

/// Entry point: validate, pick endpoints, run the scenario. Components
/// keep running on their own tasks; this returns once the proxy (or
/// Psiphon) is serving.
pub async fn run_warp(opts: WarpOptions, shutdown: watch::Receiver<bool>) -> Result<()> {
    if opts.psiphon.is_some() && opts.gool {
        return Err(ConfigError::InvalidFlags {
            message: "can't use psiphon and gool at the same time".into(),
        }
        .into());
    }

    check_identities(&opts)?;

    // two endpoints: outer and (for gool) inner
    let mut endpoints: Vec<String> = match &opts.endpoint {
        Some(ep) => vec![ep.clone(), ep.clone()],
        None => {
            let (v4, v6) = scan_families(&opts);
            let ep = warp::random_warp_endpoint(v4, v6)?.to_string();
            let ep2 = warp::random_warp_endpoint(v4, v6)?.to_string();
            vec![ep, ep2]
        }
    };

    if let Some(scan) = &opts.scan {
        let results = run_scan(scan, shutdown.clone()).await?;
        info!(?results, "scan results");
        endpoints = results
            .iter()
            .map(|info| info.addr_port.to_string())
            .collect();
    }
    info!(?endpoints, "using warp endpoints");

    match (&opts.psiphon, opts.gool) {
        (Some(psiphon_opts), _) => {
            info!("running in Psiphon (cfon) mode");
            run_warp_with_psiphon(
                opts.bind,
                &resolve_endpoint(&endpoints[0]).await?,
                psiphon_opts,
                shutdown,
            )
            .await
        }
        (None, true) => {
            info!("running in warp-in-warp (gool) mode");
            run_warp_in_warp(opts.bind, &endpoints, shutdown).await
        }
        (None, false) => {
            info!("running in normal warp mode");
            run_warp_plain(opts.bind, &resolve_endpoint(&endpoints[0]).await?, shutdown).await
        }
    }
}

fn scan_families(opts: &WarpOptions) -> (bool, bool) {
    match &opts.scan {
        Some(scan) => (scan.v4, scan.v6),
        None => (true, true),
    }
}

/// Both identity directories must exist (the registration client writes
/// them); a license mismatch is only a warning since we can't regenerate.
fn check_identities(opts: &WarpOptions) -> Result<()> {
    for dir in [PRIMARY_DIR, SECONDARY_DIR] {
        let identity = warp::load_identity(dir)?;
        if let Some(license) = &opts.license {
            if !license.is_empty() && identity.account.license != *license {
                warn!(
                    dir,
                    "identity license differs from --key; re-register to apply the new license"
                );
            }
        }
    }
    Ok(())
}

/// Primary profile with the outer-hop peer policy applied.
fn outer_config(endpoint: &str) -> Result<Configuration> {
    let mut conf = Configuration::parse_file(
        std::path::Path::new(PRIMARY_DIR).join(warp::PROFILE_FILE),
        endpoint,
    )?;
    conf.interface.mtu = SINGLE_MTU;
    for peer in &mut conf.peers {
        peer.trick = true;
        peer.keepalive = 3;
    }
    Ok(conf)
}

async fn run_warp_plain(
    bind: SocketAddr,
    endpoint: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let conf = outer_config(endpoint)?;
    let vtun = start_wireguard(&conf, shutdown.clone()).await?;
    let bound = vtun.start_proxy(bind, shutdown).await?;
    info!(address = %bound, "serving proxy");
    Ok(())
}

async fn run_warp_with_psiphon(
    bind: SocketAddr,
    endpoint: &str,
    psiphon_opts: &PsiphonOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let conf = outer_config(endpoint)?;
    let vtun = start_wireguard(&conf, shutdown.clone()).await?;

    // Warp's proxy hides on an ephemeral loopback port; Psiphon owns the
    // user-facing bind
    let warp_bind = vtun
        .start_proxy("127.0.0.1:0".parse().expect("literal"), shutdown.clone())
        .await?;

    psiphon::run_psiphon(
        psiphon_opts.controller.as_ref(),
        warp_bind,
        bind,
        &psiphon_opts.country,
        shutdown,
    )
    .await?;

    info!(address = %bind, "serving proxy");
    Ok(())
}

async fn run_warp_in_warp(
    bind: SocketAddr,
    endpoints: &[String],
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if endpoints.len() < 2 {
        return Err(ScanError::NotEnoughResults {
            found: endpoints.len(),
            want: 2,
        }
        .into());
    }

    // outer hop
    let outer_endpoint = resolve_endpoint(&endpoints[0]).await?;
    let conf = outer_config(&outer_endpoint)?;
    let outer = start_wireguard(&conf, shutdown.clone()).await?;

    // loopback UDP port spliced onto the outer stack, carrying the inner
    // tunnel's ciphertext to the second endpoint
    let inner_remote = resolve_endpoint(&endpoints[1]).await?;
    let forward_addr = udpfw::start_udp_forwarder(
        "127.0.0.1:0".parse().expect("literal"),
        &inner_remote,
        &outer.stack,
        SINGLE_MTU,
        shutdown.clone(),
    )
    .await?;
    debug!(%forward_addr, "inner tunnel forwarder ready");

    // inner hop terminates at the forwarder; no trick, slower keepalive
    let mut conf = Configuration::parse_file(
        std::path::Path::new(SECONDARY_DIR).join(warp::PROFILE_FILE),
        &forward_addr.to_string(),
    )?;
    conf.interface.mtu = DOUBLE_MTU;
    for peer in &mut conf.peers {
        peer.trick = false;
        peer.keepalive = 10;
    }
    let inner: VirtualTun = start_wireguard(&conf, shutdown.clone()).await?;

    let bound = inner.start_proxy(bind, shutdown).await?;
    info!(address = %bound, "serving proxy");
    Ok(())
}

/// Resolve a possibly-hostname endpoint to a literal `ip:port` via the
/// host resolver (endpoint resolution happens outside the tunnel).
async fn resolve_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.parse::<SocketAddr>().is_ok() {
        return Ok(endpoint.to_string());
    }
    let mut addrs = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|_| NetworkError::DnsResolutionFailed {
            host: endpoint.to_string(),
        })?;
    addrs
        .next()
        .map(|a| a.to_string())
        .ok_or_else(|| {
            NetworkError::DnsResolutionFailed {
                host: endpoint.to_string(),
            }
            .into()
        })
}

/// Scan with the primary identity's keys and return the two best
/// endpoints.
async fn run_scan(
    opts: &ScanOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<IpInfo>> {
    let profile = Configuration::parse_file(
        std::path::Path::new(PRIMARY_DIR).join(warp::PROFILE_FILE),
        "0.0.0.0:0",
    )?;
    let peer = profile.peers.first().ok_or(ConfigError::MissingField {
        field: "[Peer] section".into(),
    })?;

    let scanner = Scanner::new(ScannerOptions {
        use_ipv4: opts.v4,
        use_ipv6: opts.v6,
        max_rtt: opts.max_rtt,
        cidr_list: warp::warp_prefixes(),
        ping_mode: PingMode::Warp,
        warp_private_key: profile.interface.private_key,
        warp_peer_public_key: peer.public_key,
        ..Default::default()
    });
    scanner.run(shutdown.clone());

    let mut shutdown = shutdown;
    let deadline = tokio::time::Instant::now() + SCAN_DEADLINE;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Err(ScanError::Canceled.into()),
            _ = tokio::time::sleep_until(deadline) => {
                let found = scanner.available_ips(false).len();
                return Err(ScanError::NotEnoughResults { found, want: 2 }.into());
            }
            _ = ticker.tick() => {
                let ips = scanner.available_ips(false);
                if ips.len() > 1 {
                    return Ok(ips.into_iter().take(2).collect());
                }
            }
        }
    }
}
