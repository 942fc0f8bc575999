//! Warp service facts and identity loading
//!
//! The published Warp prefixes and ports, random-endpoint selection, and
//! the on-disk identity written by the registration client (an external
//! collaborator; this crate never talks to the registration API itself).

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use ipnet::IpNet;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const IDENTITY_FILE: &str = "wgcf-identity.json";
pub const PROFILE_FILE: &str = "wgcf-profile.ini";

/// Cloudflare's published Warp ranges.
pub fn warp_prefixes() -> Vec<IpNet> {
    [
        "162.159.192.0/24",
        "162.159.193.0/24",
        "162.159.195.0/24",
        "188.114.96.0/24",
        "188.114.97.0/24",
        "188.114.98.0/24",
        "188.114.99.0/24",
        "2606:4700:d0::/48",
        "2606:4700:d1::/48",
    ]
    .iter()
    .map(|p| p.parse().expect("static prefix"))
    .collect()
}

/// UDP ports Warp peers answer on.
pub const WARP_PORTS: &[u16] = &[
    500, 854, 859, 864, 878, 880, 890, 891, 894, 903, 908, 928, 934, 939, 942, 943, 945, 946,
    955, 968, 987, 988, 1002, 1010, 1014, 1018, 1070, 1074, 1180, 1387, 1701, 1843, 2371, 2408,
    2506, 3138, 3476, 3581, 3854, 4177, 4198, 4233, 4500, 5279, 5956, 7103, 7152, 7156, 7281,
    7559, 8319, 8742, 8854, 8886,
];

/// A random (address, port) drawn from the published ranges, restricted to
/// the enabled families.
pub fn random_warp_endpoint(v4: bool, v6: bool) -> Result<SocketAddr, ConfigError> {
    let prefixes: Vec<IpNet> = warp_prefixes()
        .into_iter()
        .filter(|net| match net {
            IpNet::V4(_) => v4,
            IpNet::V6(_) => v6,
        })
        .collect();
    let mut rng = rand::thread_rng();
    let prefix = prefixes.choose(&mut rng).ok_or(ConfigError::InvalidFlags {
        message: "no address family enabled".into(),
    })?;
    let addr = random_in(prefix, &mut rng);
    let port = *WARP_PORTS.choose(&mut rng).expect("static port list");
    Ok(SocketAddr::new(addr, port))
}

fn random_in(net: &IpNet, rng: &mut impl Rng) -> IpAddr {
    match net {
        IpNet::V4(v4) => {
            let host_bits = 32 - v4.prefix_len() as u32;
            let mask = (1u32 << host_bits) - 1;
            IpAddr::from(std::net::Ipv4Addr::from(
                u32::from(v4.network()) | (rng.gen::<u32>() & mask),
            ))
        }
        IpNet::V6(v6) => {
            let host_bits = 128 - v6.prefix_len() as u32;
            let mask = (1u128 << host_bits) - 1;
            IpAddr::from(std::net::Ipv6Addr::from(
                u128::from(v6.network()) | (rng.gen::<u128>() & mask),
            ))
        }
    }
}

/// The slice of `wgcf-identity.json` this client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub private_key: String,
    #[serde(default)]
    pub account: IdentityAccount,
    pub config: IdentityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityAccount {
    #[serde(default)]
    pub license: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub peers: Vec<IdentityPeer>,
    pub interface: IdentityInterface,
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPeer {
    pub public_key: String,
    pub endpoint: IdentityEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEndpoint {
    #[serde(default)]
    pub v4: String,
    #[serde(default)]
    pub v6: String,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInterface {
    pub addresses: IdentityAddresses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityAddresses {
    #[serde(default)]
    pub v4: String,
    #[serde(default)]
    pub v6: String,
}

/// Load and validate an identity directory's `wgcf-identity.json`.
pub fn load_identity<P: AsRef<Path>>(dir: P) -> Result<Identity, ConfigError> {
    let path = dir.as_ref().join(IDENTITY_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::ProfileMissing {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io(e)
        }
    })?;
    let identity: Identity = serde_json::from_str(&raw)?;
    if identity.config.peers.is_empty() {
        return Err(ConfigError::MissingField {
            field: "config.peers".into(),
        });
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_cover_both_families() {
        let prefixes = warp_prefixes();
        assert!(prefixes.iter().any(|p| matches!(p, IpNet::V4(_))));
        assert!(prefixes.iter().any(|p| matches!(p, IpNet::V6(_))));
    }

    #[test]
    fn random_endpoint_respects_family_flags() {
        for _ in 0..16 {
            let ep = random_warp_endpoint(true, false).unwrap();
            assert!(ep.is_ipv4());
            assert!(warp_prefixes().iter().any(|p| p.contains(&ep.ip())));
            assert!(WARP_PORTS.contains(&ep.port()));

            let ep = random_warp_endpoint(false, true).unwrap();
            assert!(ep.is_ipv6());
        }
        assert!(random_warp_endpoint(false, false).is_err());
    }

    #[test]
    fn identity_json_loads() {
        let dir = std::env::temp_dir().join(format!("warp-id-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let json = r#"{
            "private_key": "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=",
            "account": {"license": "abc-123"},
            "config": {
                "client_id": "dGVz",
                "interface": {"addresses": {"v4": "172.16.0.2", "v6": "2606:4700::1"}},
                "peers": [{
                    "public_key": "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=",
                    "endpoint": {"host": "engage.cloudflareclient.com:2408", "v4": "", "v6": ""}
                }]
            }
        }"#;
        std::fs::write(dir.join(IDENTITY_FILE), json).unwrap();

        let identity = load_identity(&dir).unwrap();
        assert_eq!(identity.account.license, "abc-123");
        assert_eq!(identity.config.peers.len(), 1);
        assert_eq!(
            identity.config.peers[0].endpoint.host,
            "engage.cloudflareclient.com:2408"
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_identity_is_a_profile_error() {
        let err = load_identity("/definitely/not/here").unwrap_err();
        assert!(matches!(err, ConfigError::ProfileMissing { .. }));
    }
}
