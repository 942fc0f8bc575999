//! warp-plus CLI

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::PossibleValuesParser;
use clap::Parser;
use serde::Deserialize;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use warp_plus::app::{self, PsiphonOptions, ScanOptions, WarpOptions};
use warp_plus::error::ConfigError;
use warp_plus::psiphon::ChildProcessController;

/// Countries Psiphon egress is restricted to. The tunnel core accepts
/// more; this list is policy.
const PSIPHON_COUNTRIES: &[&str] = &[
    "AT", "BE", "BG", "BR", "CA", "CH", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "HU",
    "IE", "IN", "IT", "JP", "LV", "NL", "NO", "PL", "RO", "RS", "SE", "SG", "SK", "UA", "US",
];

/// Shutdown grace before the process is abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "warp-plus")]
#[command(about = "Warp client exposing a local SOCKS5/HTTP proxy", version)]
struct Args {
    /// Only use IPv4 for random/scanned warp endpoints
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Only use IPv6 for random/scanned warp endpoints
    #[arg(short = '6')]
    ipv6: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Proxy bind address
    #[arg(short, long, default_value = "127.0.0.1:8086")]
    bind: SocketAddr,

    /// Warp endpoint (host:port); random when omitted
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Warp+ license key
    #[arg(short, long)]
    key: Option<String>,

    /// Warp-in-warp mode: stack two tunnels for egress control
    #[arg(long, conflicts_with = "cfon")]
    gool: bool,

    /// Psiphon mode: chain Psiphon over the Warp tunnel
    #[arg(long)]
    cfon: bool,

    /// Psiphon egress country code
    #[arg(long, default_value = "AT", value_parser = PossibleValuesParser::new(PSIPHON_COUNTRIES))]
    country: String,

    /// Scan the Warp ranges for low-RTT endpoints first
    #[arg(long)]
    scan: bool,

    /// Scanner RTT budget
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    rtt: Duration,

    /// JSON config file; flags win over file values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// JSON mirror of the long flags.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    bind: Option<SocketAddr>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    gool: Option<bool>,
    #[serde(default)]
    cfon: Option<bool>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    scan: Option<bool>,
}

fn merge_config(args: &mut Args, file: FileConfig) {
    if let Some(bind) = file.bind {
        if args.bind.to_string() == "127.0.0.1:8086" {
            args.bind = bind;
        }
    }
    if args.endpoint.is_none() {
        args.endpoint = file.endpoint;
    }
    if args.key.is_none() {
        args.key = file.key;
    }
    args.gool |= file.gool.unwrap_or(false);
    args.cfon |= file.cfon.unwrap_or(false);
    args.scan |= file.scan.unwrap_or(false);
    if args.country == "AT" {
        if let Some(country) = file.country {
            args.country = country;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Some(path) = &args.config {
        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|raw| {
            serde_json::from_str::<FileConfig>(&raw).map_err(|e| e.to_string())
        }) {
            Ok(file) => merge_config(&mut args, file),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "bad config file");
                return ExitCode::from(1);
            }
        }
    }

    if let Err(e) = validate(&args) {
        tracing::error!(error = %e, "invalid flags");
        return ExitCode::from(1);
    }

    if args.cfon {
        tracing::info!(country = %args.country, "psiphon mode enabled");
    }
    if args.scan {
        tracing::info!(max_rtt = ?args.rtt, "scanner mode enabled");
    }

    let (v4, v6) = if !args.ipv4 && !args.ipv6 {
        (true, true)
    } else {
        (args.ipv4, args.ipv6)
    };

    let opts = WarpOptions {
        bind: args.bind,
        endpoint: args.endpoint.clone(),
        license: args.key.clone(),
        psiphon: args.cfon.then(|| PsiphonOptions {
            country: args.country.clone(),
            controller: Arc::new(ChildProcessController::default()),
        }),
        gool: args.gool,
        scan: args.scan.then_some(ScanOptions {
            v4,
            v6,
            max_rtt: args.rtt,
        }),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Err(e) = app::run_warp(opts, shutdown_rx).await {
        tracing::error!(error = %e, "startup failed");
        return ExitCode::from(1);
    }

    wait_for_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    // bounded: components either stop inside the grace period or are
    // abandoned with the process
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    ExitCode::SUCCESS
}

fn validate(args: &Args) -> Result<(), ConfigError> {
    // clap enforces -4/-6 and --cfon/--gool conflicts; config files can
    // reintroduce the latter
    if args.cfon && args.gool {
        return Err(ConfigError::InvalidFlags {
            message: "can't use cfon and gool at the same time".into(),
        });
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["warp-plus"]);
        assert_eq!(args.bind.to_string(), "127.0.0.1:8086");
        assert_eq!(args.country, "AT");
        assert_eq!(args.rtt, Duration::from_secs(1));
        assert!(!args.gool && !args.cfon && !args.scan);
    }

    #[test]
    fn v4_v6_conflict_rejected_by_clap() {
        assert!(Args::try_parse_from(["warp-plus", "-4", "-6"]).is_err());
        assert!(Args::try_parse_from(["warp-plus", "--gool", "--cfon"]).is_err());
    }

    #[test]
    fn country_must_be_in_the_list() {
        assert!(Args::try_parse_from(["warp-plus", "--country", "ZZ"]).is_err());
        let args = Args::parse_from(["warp-plus", "--country", "JP"]);
        assert_eq!(args.country, "JP");
    }

    #[test]
    fn rtt_parses_human_durations() {
        let args = Args::parse_from(["warp-plus", "--rtt", "200ms"]);
        assert_eq!(args.rtt, Duration::from_millis(200));
    }

    #[test]
    fn config_file_fills_gaps_but_flags_win() {
        let mut args = Args::parse_from(["warp-plus", "-e", "1.2.3.4:2408"]);
        merge_config(
            &mut args,
            FileConfig {
                bind: Some("0.0.0.0:9999".parse().unwrap()),
                endpoint: Some("5.6.7.8:500".into()),
                key: Some("license".into()),
                gool: Some(true),
                ..Default::default()
            },
        );
        // explicit endpoint survives; unset values are filled
        assert_eq!(args.endpoint.as_deref(), Some("1.2.3.4:2408"));
        assert_eq!(args.key.as_deref(), Some("license"));
        assert_eq!(args.bind.to_string(), "0.0.0.0:9999");
        assert!(args.gool);
    }
}
