//! Static node configuration
//!
//! Loaded once at startup from a YAML file. The raw document is parsed
//! with serde, then validated into a typed `Config`; any malformed entry
//! aborts startup.

use crate::transport::quic::QuicConfig;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listen address for inbound peer sessions.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:2345";

/// Default port of peers whose address has none.
pub const DEFAULT_PEER_PORT: u16 = 2345;

/// Default capacity of each outbound route channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Default wait between handshake-timeout retries.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 3000;

/// Default time a peer gets to answer the session handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default frame buffer size for interface reads.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Netmask of interfaces generated from a prefix.
const GENERATED_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid virtual address {0:?}")]
    InvalidVirtualAddress(String),

    #[error("invalid peer address {0:?}")]
    InvalidPeerAddress(String),

    #[error("invalid listen address {0:?}")]
    InvalidListenAddress(String),

    #[error("IPv6 address {0} is not supported")]
    Ipv6NotSupported(String),

    #[error("duplicate virtual address {0}")]
    Duplicate(Ipv4Addr),

    #[error("virtual address {0} is both a local interface and a peer")]
    LocalAndPeer(Ipv4Addr),

    #[error("invalid netmask {0}")]
    InvalidNetmask(String),

    #[error("invalid interface name {0:?}")]
    InvalidInterfaceName(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// TLS material for the peer transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default = "default_cert")]
    pub cert: PathBuf,
    #[serde(default = "default_key")]
    pub key: PathBuf,
    /// Certificates trusted when dialling (defaults to `cert`)
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca: None,
            server_name: default_server_name(),
            insecure_skip_verify: false,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

fn default_cert() -> PathBuf {
    PathBuf::from("cert.pem")
}

fn default_key() -> PathBuf {
    PathBuf::from("key.pem")
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_server_name() -> String {
    crate::transport::quic::DEFAULT_ALPN.to_string()
}

/// A locally owned virtual address and the interface carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInterface {
    name: String,
    address: String,
    #[serde(default = "default_netmask")]
    netmask: String,
}

fn default_netmask() -> String {
    GENERATED_NETMASK.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_peer_port")]
    peer_port: u16,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    interfaces: Vec<RawInterface>,
    #[serde(default, deserialize_with = "entries_in_order")]
    peers: Vec<(String, String)>,
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
    #[serde(default = "default_retry_interval_ms")]
    retry_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Deserialize a mapping as ordered pairs, keeping duplicate keys so
/// validation can reject them.
fn entries_in_order<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairsVisitor;

    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of virtual address to peer address")
        }

        fn visit_unit<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(pair) = map.next_entry::<String, String>()? {
                pairs.push(pair);
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(PairsVisitor)
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub tls: TlsConfig,
    pub interfaces: Vec<InterfaceConfig>,
    /// Address Table entries, virtual address -> real peer address
    pub peers: Vec<(Ipv4Addr, SocketAddr)>,
    pub channel_capacity: usize,
    pub retry_interval: Duration,
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PEER_PORT)),
            tls: TlsConfig::default(),
            interfaces: Vec::new(),
            peers: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(contents)?;

        let listen = parse_socket_addr(&raw.listen, DEFAULT_PEER_PORT)
            .ok_or_else(|| ConfigError::InvalidListenAddress(raw.listen.clone()))??;

        let interfaces = raw
            .interfaces
            .into_iter()
            .map(|iface| -> Result<InterfaceConfig> {
                let address = parse_virtual(&iface.address)?;
                let netmask = parse_ipv4(&iface.netmask)
                    .ok_or_else(|| ConfigError::InvalidNetmask(iface.netmask.clone()))??;
                ipnet::ipv4_mask_to_prefix(netmask)
                    .map_err(|_| ConfigError::InvalidNetmask(iface.netmask.clone()))?;
                Ok(InterfaceConfig {
                    name: iface.name,
                    address,
                    netmask,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let peers = raw
            .peers
            .iter()
            .map(|(vaddr, raddr)| -> Result<(Ipv4Addr, SocketAddr)> {
                let vaddr = parse_virtual(vaddr)?;
                let raddr = parse_socket_addr(raddr, raw.peer_port)
                    .ok_or_else(|| ConfigError::InvalidPeerAddress(raddr.clone()))??;
                Ok((vaddr, raddr))
            })
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            listen,
            tls: raw.tls,
            interfaces,
            peers,
            channel_capacity: raw.channel_capacity,
            retry_interval: Duration::from_millis(raw.retry_interval_ms),
            buffer_size: raw.buffer_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-entry invariants.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel_capacity"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Zero("buffer_size"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Zero("retry_interval_ms"));
        }
        if self.tls.handshake_timeout_ms == 0 {
            return Err(ConfigError::Zero("tls.handshake_timeout_ms"));
        }

        let mut names = HashSet::new();
        let mut local = HashSet::new();
        for iface in &self.interfaces {
            if crate::tun::validate_name(&iface.name).is_err() || !names.insert(&iface.name) {
                return Err(ConfigError::InvalidInterfaceName(iface.name.clone()));
            }
            if !local.insert(iface.address) {
                return Err(ConfigError::Duplicate(iface.address));
            }
        }

        let mut remote = HashSet::new();
        for (vaddr, _) in &self.peers {
            if local.contains(vaddr) {
                return Err(ConfigError::LocalAndPeer(*vaddr));
            }
            if !remote.insert(*vaddr) {
                return Err(ConfigError::Duplicate(*vaddr));
            }
        }
        Ok(())
    }

    /// Replace the interfaces with `count` generated ones: `<prefix><i>`
    /// on `mptest-<i>`, starting at 1, with a /24 netmask.
    pub fn generate_interfaces(&mut self, prefix: &str, count: usize) -> Result<()> {
        self.interfaces = (1..=count)
            .map(|i| -> Result<InterfaceConfig> {
                Ok(InterfaceConfig {
                    name: format!("mptest-{i}"),
                    address: parse_virtual(&format!("{prefix}{i}"))?,
                    netmask: GENERATED_NETMASK,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.validate()
    }

    /// Transport settings derived from the `tls` section.
    pub fn quic_config(&self) -> QuicConfig {
        let mut quic = QuicConfig::new(&self.tls.cert, &self.tls.key)
            .with_server_name(&self.tls.server_name)
            .insecure_skip_verify(self.tls.insecure_skip_verify)
            .with_handshake_timeout(Duration::from_millis(self.tls.handshake_timeout_ms));
        if let Some(ca) = &self.tls.ca {
            quic = quic.with_ca(ca);
        }
        quic
    }
}

/// Parse an address that must be IPv4. IPv6 gets its own error.
fn parse_ipv4(s: &str) -> Option<Result<Ipv4Addr>> {
    match s.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(addr) => Some(Ok(addr)),
        IpAddr::V6(_) => Some(Err(ConfigError::Ipv6NotSupported(s.to_string()))),
    }
}

fn parse_virtual(s: &str) -> Result<Ipv4Addr> {
    parse_ipv4(s).ok_or_else(|| ConfigError::InvalidVirtualAddress(s.to_string()))?
}

/// Parse `ip` or `ip:port`, filling in `default_port`.
fn parse_socket_addr(s: &str, default_port: u16) -> Option<Result<SocketAddr>> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(match addr {
            SocketAddr::V4(_) => Ok(addr),
            SocketAddr::V6(_) => Err(ConfigError::Ipv6NotSupported(s.to_string())),
        });
    }
    parse_ipv4(s).map(|ip| ip.map(|ip| SocketAddr::from((ip, default_port))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
listen: "0.0.0.0:2345"
tls:
  cert: /etc/mvirt/overlay/cert.pem
  key: /etc/mvirt/overlay/key.pem
  insecure_skip_verify: true
  handshake_timeout_ms: 2000
interfaces:
  - name: mptest-1
    address: 10.0.0.1
    netmask: 255.255.255.0
peers:
  10.0.1.1: 203.0.113.5
  10.0.1.2: "203.0.113.6:4000"
channel_capacity: 16
retry_interval_ms: 1500
"#;

    #[test]
    fn test_parse_example() {
        let config = Config::from_yaml(EXAMPLE).unwrap();

        assert_eq!(config.listen, "0.0.0.0:2345".parse().unwrap());
        assert_eq!(
            config.interfaces,
            vec![InterfaceConfig {
                name: "mptest-1".to_string(),
                address: Ipv4Addr::new(10, 0, 0, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            }]
        );
        assert_eq!(
            config.peers,
            vec![
                (Ipv4Addr::new(10, 0, 1, 1), "203.0.113.5:2345".parse().unwrap()),
                (Ipv4Addr::new(10, 0, 1, 2), "203.0.113.6:4000".parse().unwrap()),
            ]
        );
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.retry_interval, Duration::from_millis(1500));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.tls.insecure_skip_verify);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("peers: {}").unwrap();
        assert_eq!(config.listen, SocketAddr::from(([0, 0, 0, 0], 2345)));
        assert_eq!(config.channel_capacity, 10);
        assert_eq!(config.retry_interval, Duration::from_secs(3));
        assert!(config.peers.is_empty());
        assert!(config.interfaces.is_empty());
        assert_eq!(config.tls.server_name, "mvirt-overlay");
        assert_eq!(
            config.quic_config().handshake_timeout,
            Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_peer_port_applies_to_bare_addresses() {
        let config = Config::from_yaml("peer_port: 7000\npeers:\n  10.0.1.1: 203.0.113.5\n").unwrap();
        assert_eq!(config.peers[0].1, "203.0.113.5:7000".parse().unwrap());
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(matches!(
            Config::from_yaml("peers:\n  not-an-ip: 203.0.113.5\n"),
            Err(ConfigError::InvalidVirtualAddress(_))
        ));
        assert!(matches!(
            Config::from_yaml("peers:\n  10.0.1.1: somewhere\n"),
            Err(ConfigError::InvalidPeerAddress(_))
        ));
        assert!(matches!(
            Config::from_yaml("peers:\n  10.0.1.1: 203.0.113.5:99999\n"),
            Err(ConfigError::InvalidPeerAddress(_))
        ));
        assert!(matches!(
            Config::from_yaml("peers: [1, 2]"),
            Err(ConfigError::Yaml(_))
        ));
        assert!(matches!(
            Config::from_yaml("unknown_field: 1"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_ipv6_rejected() {
        assert!(matches!(
            Config::from_yaml("peers:\n  \"fd00::1\": 203.0.113.5\n"),
            Err(ConfigError::Ipv6NotSupported(_))
        ));
        assert!(matches!(
            Config::from_yaml("peers:\n  10.0.1.1: \"[2001:db8::1]:2345\"\n"),
            Err(ConfigError::Ipv6NotSupported(_))
        ));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let yaml = "peers:\n  10.0.1.1: 203.0.113.5\n  10.0.1.1: 203.0.113.6\n";
        // Some YAML parsers reject duplicate keys themselves
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Duplicate(_)) | Err(ConfigError::Yaml(_))
        ));

        let yaml = "peers:\n  10.0.1.1: 203.0.113.5\n  \"10.0.1.1 \": 203.0.113.6\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Duplicate(addr)) if addr == Ipv4Addr::new(10, 0, 1, 1)
        ));
    }

    #[test]
    fn test_local_and_peer_rejected() {
        let yaml = r#"
interfaces:
  - name: mptest-1
    address: 10.0.0.1
peers:
  10.0.0.1: 203.0.113.5
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::LocalAndPeer(_))
        ));
    }

    #[test]
    fn test_bad_netmask_and_capacity() {
        let yaml = r#"
interfaces:
  - name: mptest-1
    address: 10.0.0.1
    netmask: 255.0.255.0
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::InvalidNetmask(_))
        ));
        assert!(matches!(
            Config::from_yaml("channel_capacity: 0"),
            Err(ConfigError::Zero("channel_capacity"))
        ));
    }

    #[test]
    fn test_generate_interfaces() {
        let mut config = Config::default();
        config.generate_interfaces("10.0.0.", 2).unwrap();

        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[0].name, "mptest-1");
        assert_eq!(config.interfaces[0].address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.interfaces[1].name, "mptest-2");
        assert_eq!(config.interfaces[1].address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.interfaces[1].netmask, Ipv4Addr::new(255, 255, 255, 0));

        assert!(config.generate_interfaces("bogus.", 1).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.peers.len(), 2);

        let quic = config.quic_config();
        assert_eq!(quic.cert_path, PathBuf::from("/etc/mvirt/overlay/cert.pem"));
        assert!(quic.insecure_skip_verify);
        assert_eq!(quic.handshake_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_handshake_timeout_rejected() {
        let yaml = "tls:\n  handshake_timeout_ms: 0\npeers: {}\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Zero("tls.handshake_timeout_ms"))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
