//! Configuration handling for shieldlink

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/shieldlink";
pub const LOCAL_CONFIG_FILE: &str = "shieldlink.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub links: LinksConfig,
    pub health: HealthConfig,
    pub dns: DnsConfig,
    pub bypass: BypassConfig,
}

/// What a chain does when none of its links are available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyPolicy {
    /// Fail closed: reject traffic
    Reject,
    /// Fail open: leave the chain empty so the default route applies
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksConfig {
    pub vpn: Vec<LinkConfig>,
    pub wan: Vec<LinkConfig>,
    /// Interfaces whose inbound traffic is steered
    pub lan: Vec<String>,
    pub vpn_when_empty: EmptyPolicy,
    pub wan_when_empty: EmptyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ping_targets: Vec<String>,
    pub ping_timeout_secs: u64,
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub listen: Ipv4Addr,
    pub port: u16,
    pub upstreams: Vec<String>,
    pub upstream_timeout_ms: u64,
    pub cache_file: PathBuf,
    pub cache_ttl_hours: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Domain patterns (regular expressions) whose answers bypass the VPN
    pub domains: Vec<String>,
    /// IPv4 addresses or CIDRs that always bypass the VPN
    pub addresses: Vec<String>,
}

fn default_weight() -> i64 {
    1
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            vpn: vec![LinkConfig {
                name: "vpn1".to_string(),
                weight: 1,
            }],
            wan: vec![LinkConfig {
                name: "wan1".to_string(),
                weight: 1,
            }],
            lan: vec!["lan0".to_string()],
            vpn_when_empty: EmptyPolicy::Reject,
            wan_when_empty: EmptyPolicy::Pass,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_targets: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            ping_timeout_secs: 5,
            probe_interval_secs: 1,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: Ipv4Addr::UNSPECIFIED,
            port: 5353,
            upstreams: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "8.8.4.4:53".to_string(),
            ],
            upstream_timeout_ms: 2000,
            cache_file: PathBuf::from(DEFAULT_CONFIG_DIR).join("bypass-cache.json"),
            cache_ttl_hours: 48,
            shutdown_grace_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl DnsConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.listen, self.port))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Upstream resolvers in declared order; port 53 is implied when omitted
    pub fn upstream_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.upstreams.iter().map(|s| parse_upstream(s)).collect()
    }
}

impl BypassConfig {
    /// Validated static bypass entries, normalized for the firewall set
    pub fn static_entries(&self) -> Result<Vec<String>, ConfigError> {
        self.addresses
            .iter()
            .map(|raw| {
                let raw = raw.trim();
                if let Ok(net) = raw.parse::<Ipv4Net>() {
                    Ok(net.trunc().to_string())
                } else if let Ok(ip) = raw.parse::<Ipv4Addr>() {
                    Ok(ip.to_string())
                } else {
                    Err(ConfigError::Invalid(format!(
                        "bypass address is not an IPv4 address or CIDR: {}",
                        raw
                    )))
                }
            })
            .collect()
    }
}

fn parse_upstream(raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.parse::<Ipv4Addr>()
        .map(|ip| SocketAddr::from((ip, 53)))
        .map_err(|_| ConfigError::Invalid(format!("invalid upstream resolver: {}", raw)))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from an explicit path, else `./shieldlink.toml`, else
    /// `/etc/shieldlink/config.toml`, else defaults
    pub fn find(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }

        let system = PathBuf::from(DEFAULT_CONFIG_DIR).join("config.toml");
        if system.exists() {
            return Self::load(&system);
        }

        info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Reject configurations that cannot start
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for link in self.links.vpn.iter().chain(&self.links.wan) {
            if link.name.trim().is_empty() {
                return Err(ConfigError::Invalid("link name is empty".to_string()));
            }
            if !seen.insert(link.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "link {} is declared more than once",
                    link.name
                )));
            }
        }

        if !seen.is_empty() && self.health.ping_targets.is_empty() {
            return Err(ConfigError::Invalid(
                "health.ping_targets must not be empty".to_string(),
            ));
        }
        if self.health.ping_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "health.ping_timeout_secs must be positive".to_string(),
            ));
        }
        if self.dns.upstream_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dns.upstream_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dns.cache_ttl_hours == 0 {
            return Err(ConfigError::Invalid(
                "dns.cache_ttl_hours must be positive".to_string(),
            ));
        }

        self.dns.upstream_addrs()?;
        self.bypass.static_entries()?;
        Ok(())
    }
}
