//! warp-plus - user-space Warp client
//!
//! Establishes an encrypted WireGuard tunnel to Cloudflare's Warp service
//! entirely in user space (no TUN device, no privileges) and exposes it
//! locally as a mixed SOCKS5/HTTP proxy. Supports stacking a second Warp
//! hop for egress-location control (gool) and chaining Psiphon over Warp
//! (cfon).
//!
//! # Usage
//!
//! ```no_run
//! use warp_plus::app::{self, WarpOptions};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> warp_plus::error::Result<()> {
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let opts = WarpOptions {
//!         bind: "127.0.0.1:8086".parse().unwrap(),
//!         endpoint: Some("162.159.192.1:2408".into()),
//!         license: None,
//!         psiphon: None,
//!         gool: false,
//!         scan: None,
//!     };
//!     app::run_warp(opts, shutdown_rx).await?;
//!     tokio::signal::ctrl_c().await?;
//!     let _ = shutdown_tx.send(true);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod netstack;
pub mod proxy;
pub mod psiphon;
pub mod scanner;
pub mod udpfw;
pub mod vtun;
pub mod warp;
pub mod wg;

pub use config::Configuration;
pub use error::{Result, WarpError};
pub use vtun::VirtualTun;
