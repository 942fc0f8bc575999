//! wgcf profile parsing
//!
//! Reads the standard WireGuard INI profile the registration client writes
//! (`[Interface]` with PrivateKey/Address/DNS, `[Peer]` with
//! PublicKey/AllowedIPs/Endpoint) and renders the device's `ipc_set`
//! stream. The `Address` prefix length is deliberately discarded: nothing
//! downstream routes by mask, the stack binds plain addresses.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: [u8; 32],
    pub addresses: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: usize,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    /// All zeros when the profile has no PreSharedKey.
    pub preshared_key: [u8; 32],
    /// `host:port`; must be a literal socket address by the time the
    /// device sees it (the orchestrator resolves names).
    pub endpoint: String,
    pub keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
    pub trick: bool,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

impl Configuration {
    /// Parse a profile file, pointing every peer at `endpoint`.
    pub fn parse_file<P: AsRef<Path>>(path: P, endpoint: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::ProfileMissing {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content, endpoint)
    }

    pub fn parse(content: &str, endpoint: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut section = Section::None;

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                section = Section::Interface;
                interface.get_or_insert_with(|| InterfaceConfig {
                    private_key: [0u8; 32],
                    addresses: Vec::new(),
                    dns: Vec::new(),
                    mtu: 0,
                });
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                section = Section::Peer;
                peers.push(PeerConfig {
                    public_key: [0u8; 32],
                    preshared_key: [0u8; 32],
                    endpoint: String::new(),
                    keepalive: 0,
                    allowed_ips: Vec::new(),
                    trick: false,
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {line}"),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match section {
                Section::Interface => {
                    let iface = interface.as_mut().expect("set when section entered");
                    match key.as_str() {
                        "privatekey" => iface.private_key = parse_key(value, "PrivateKey")?,
                        "address" => {
                            for part in split_list(value) {
                                // profiles write prefixes; only the
                                // address is kept
                                let prefix: IpNet =
                                    part.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: part.to_string(),
                                    })?;
                                iface.addresses.push(prefix.addr());
                            }
                        }
                        "dns" => {
                            for part in split_list(value) {
                                let ip: IpAddr =
                                    part.parse().map_err(|_| ConfigError::InvalidAddress {
                                        value: part.to_string(),
                                    })?;
                                iface.dns.push(ip);
                            }
                        }
                        "mtu" => {
                            iface.mtu = value.parse().map_err(|_| ConfigError::ParseError {
                                line: line_num,
                                message: format!("invalid MTU: {value}"),
                            })?;
                        }
                        _ => tracing::debug!(key, "ignoring unknown interface key"),
                    }
                }
                Section::Peer => {
                    let peer = peers.last_mut().expect("set when section entered");
                    match key.as_str() {
                        "publickey" => peer.public_key = parse_key(value, "PublicKey")?,
                        "presharedkey" => {
                            peer.preshared_key = parse_key(value, "PreSharedKey")?
                        }
                        "endpoint" => peer.endpoint = value.to_string(),
                        "persistentkeepalive" => {
                            peer.keepalive =
                                value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("invalid PersistentKeepalive: {value}"),
                                })?;
                        }
                        "allowedips" => {
                            for part in split_list(value) {
                                let net: IpNet =
                                    part.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: part.to_string(),
                                    })?;
                                peer.allowed_ips.push(net);
                            }
                        }
                        _ => tracing::debug!(key, "ignoring unknown peer key"),
                    }
                }
                Section::None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "value outside of any section".to_string(),
                    });
                }
            }
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".into(),
        })?;
        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".into(),
            });
        }
        if peers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "[Peer] section".into(),
            });
        }
        for peer in &mut peers {
            if peer.public_key == [0u8; 32] {
                return Err(ConfigError::MissingField {
                    field: "PublicKey".into(),
                });
            }
            peer.endpoint = endpoint.to_string();
        }

        Ok(Self {
            interface,
            peers,
        })
    }

    /// Render the `ipc_set` stream. Endpoints must already be literal
    /// socket addresses.
    pub fn to_uapi(&self) -> Result<String, ConfigError> {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", hex(&self.interface.private_key));
        for peer in &self.peers {
            let endpoint: SocketAddr =
                peer.endpoint
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress {
                        value: peer.endpoint.clone(),
                    })?;
            let _ = writeln!(out, "public_key={}", hex(&peer.public_key));
            let _ = writeln!(out, "preshared_key={}", hex(&peer.preshared_key));
            let _ = writeln!(out, "endpoint={endpoint}");
            let _ = writeln!(out, "persistent_keepalive_interval={}", peer.keepalive);
            let _ = writeln!(out, "trick={}", peer.trick);
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Copy)]
enum Section {
    None,
    Interface,
    Peer,
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

fn hex(key: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for b in key {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
DNS = 1.1.1.1, 1.0.0.1
Address = 172.16.0.2/32
Address = 2606:4700:110:8d8c:40ab:b8ba:b296:c7cc/128

[Peer]
PublicKey = bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=
AllowedIPs = 0.0.0.0/0
AllowedIPs = ::/0
Endpoint = engage.cloudflareclient.com:2408
"#;

    #[test]
    fn parses_profile_and_overrides_endpoint() {
        let conf = Configuration::parse(PROFILE, "162.159.192.1:2408").unwrap();
        assert_eq!(conf.interface.addresses.len(), 2);
        assert!(conf.interface.addresses[0].is_ipv4());
        assert!(conf.interface.addresses[1].is_ipv6());
        assert_eq!(conf.interface.dns.len(), 2);
        assert_eq!(conf.peers.len(), 1);
        assert_eq!(conf.peers[0].endpoint, "162.159.192.1:2408");
        assert_eq!(conf.peers[0].allowed_ips.len(), 2);
        assert_eq!(conf.peers[0].preshared_key, [0u8; 32]);
    }

    #[test]
    fn address_mask_is_discarded() {
        let conf = Configuration::parse(PROFILE, "1.2.3.4:1").unwrap();
        assert_eq!(
            conf.interface.addresses[0],
            "172.16.0.2".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn uapi_roundtrips_through_the_device_parser() {
        let mut conf = Configuration::parse(PROFILE, "162.159.192.1:2408").unwrap();
        conf.peers[0].trick = true;
        conf.peers[0].keepalive = 3;
        let uapi = conf.to_uapi().unwrap();

        assert!(uapi.starts_with("private_key="));
        assert!(uapi.contains("endpoint=162.159.192.1:2408"));
        assert!(uapi.contains("persistent_keepalive_interval=3"));
        assert!(uapi.contains("trick=true"));
        assert!(uapi.contains("allowed_ip=0.0.0.0/0"));

        // the device accepts what we render
        let (link, _other) = crate::netstack::link_pair(1330);
        let dev = crate::wg::Device::new(link, crate::wg::DeviceConfig::default());
        dev.ipc_set(&uapi).unwrap();
        let peers = dev.peers();
        assert_eq!(peers[0].config.public_key, conf.peers[0].public_key);
        assert!(peers[0].config.trick);
    }

    #[test]
    fn uapi_requires_literal_endpoint() {
        let conf = Configuration::parse(PROFILE, "engage.cloudflareclient.com:2408").unwrap();
        assert!(conf.to_uapi().is_err());
    }

    #[test]
    fn missing_sections_fail() {
        assert!(Configuration::parse("", "1.2.3.4:1").is_err());
        assert!(Configuration::parse("[Interface]\nAddress = 10.0.0.1/24\n", "1.2.3.4:1").is_err());
        let no_peer = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n";
        assert!(Configuration::parse(no_peer, "1.2.3.4:1").is_err());
    }

    #[test]
    fn bad_keys_fail() {
        let profile = "[Interface]\nPrivateKey = not-base64!\n";
        assert!(matches!(
            Configuration::parse(profile, "1.2.3.4:1"),
            Err(ConfigError::InvalidKey { .. })
        ));
    }
}
