//! # config
//!
//! Parses and validates the ember YAML configuration.
//!
//! The raw file shape lives in [`wire`]; [`Config::parse`] turns it into
//! runtime types with all cross-field checks applied: networks are valid
//! CIDRs, gateways / DNS servers / pool ranges / reservation addresses lie
//! inside their network, MACs are well formed, and the database section is
//! usable. A configuration that parses here is safe to hand to the server,
//! the allocator, and the GitOps sync service.
use std::{collections::HashMap, net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;
use tracing::warn;

pub mod wire;

/// Validated server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server: Server,
    pub database: Database,
    pub observability: Observability,
    pub git: Git,
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub interfaces: Vec<Interface>,
    /// opaque identity written into `allocated_by`; empty for single-node
    /// deployments
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ipv4: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub connection: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observability {
    pub log_level: String,
    pub log_format: String,
    pub web_enabled: bool,
    pub web_port: u16,
    pub web_auth: wire::WebAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Git {
    pub enabled: bool,
    pub repository: String,
    pub branch: String,
    pub auth: GitAuth,
    pub poll_interval: Duration,
    pub sync_timeout: Duration,
    pub validate_before_sync: bool,
    pub config_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAuth {
    Token(String),
    Ssh { key_path: String },
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub network: Ipv4Network,
    pub description: String,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration: Duration,
    pub max_lease_duration: Duration,
    pub options: HashMap<String, String>,
    pub boot: Option<Boot>,
    pub pools: Vec<Pool>,
    pub reservations: Vec<StaticHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Boot {
    pub tftp_server: Option<String>,
    pub filename: Option<String>,
}

/// Inclusive dynamic address range inside a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

impl Pool {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.range_start) <= u32::from(ip) && u32::from(ip) <= u32::from(self.range_end)
    }

    /// number of allocatable addresses; a pool with `range_start == range_end`
    /// holds exactly one
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.range_end)) - u64::from(u32::from(self.range_start)) + 1
    }
}

/// A static MAC→IP binding from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticHost {
    pub hostname: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub description: String,
    pub boot: Option<Boot>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse_str(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse_str(contents: &str) -> Result<Self> {
        let raw: wire::Config =
            serde_yaml::from_str(contents).context("failed to parse config YAML")?;
        Self::validate(raw)
    }

    fn validate(raw: wire::Config) -> Result<Self> {
        if raw.server.interfaces.is_empty() {
            bail!("at least one interface must be configured");
        }
        let mut interfaces = Vec::with_capacity(raw.server.interfaces.len());
        for iface in &raw.server.interfaces {
            if iface.name.is_empty() {
                bail!("interface name is required");
            }
            if !iface.ipv4 && !iface.ipv6 {
                bail!(
                    "interface {}: at least one of ipv4 or ipv6 must be enabled",
                    iface.name
                );
            }
            if iface.ipv6 {
                bail!("interface {}: IPv6 is not supported", iface.name);
            }
            interfaces.push(Interface {
                name: iface.name.clone(),
                ipv4: iface.ipv4,
            });
        }

        if raw.database.connection.is_empty() {
            bail!("database connection string is required");
        }
        if raw.database.max_connections < raw.database.min_connections {
            bail!("database max_connections must be >= min_connections");
        }

        match raw.observability.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("log_level must be one of debug, info, warn, error (got {other:?})"),
        }
        match raw.observability.log_format.as_str() {
            "json" | "pretty" | "standard" => {}
            other => bail!("log_format must be one of json, pretty, standard (got {other:?})"),
        }

        let git = Self::validate_git(&raw.git)?;

        if raw.subnets.is_empty() {
            bail!("at least one subnet must be configured");
        }
        let subnets = raw
            .subnets
            .iter()
            .map(Self::validate_subnet)
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            server: Server {
                interfaces,
                server_id: raw.server.server_id.unwrap_or_default(),
            },
            database: Database {
                connection: raw.database.connection,
                max_connections: raw.database.max_connections,
                min_connections: raw.database.min_connections,
            },
            observability: Observability {
                log_level: raw.observability.log_level,
                log_format: raw.observability.log_format,
                web_enabled: raw.observability.web_enabled,
                web_port: raw.observability.web_port,
                web_auth: raw.observability.web_auth,
            },
            git,
            subnets,
        })
    }

    fn validate_git(raw: &wire::Git) -> Result<Git> {
        let auth = match raw.auth.kind.as_str() {
            "token" => GitAuth::Token(raw.auth.token.clone()),
            "ssh" => GitAuth::Ssh {
                key_path: raw.auth.ssh_key_path.clone(),
            },
            "" | "none" => GitAuth::None,
            other => bail!("git.auth.type must be one of token, ssh, none (got {other:?})"),
        };
        if raw.enabled && raw.repository.is_empty() {
            bail!("git.repository is required when git is enabled");
        }
        Ok(Git {
            enabled: raw.enabled,
            repository: raw.repository.clone(),
            branch: raw.branch.clone(),
            auth,
            poll_interval: Duration::from_secs(raw.poll_interval),
            sync_timeout: Duration::from_secs(raw.sync_timeout),
            validate_before_sync: raw.validate_before_sync,
            config_path: raw.config_path.clone(),
        })
    }

    fn validate_subnet(raw: &wire::Subnet) -> Result<Subnet> {
        let network: Ipv4Network = raw
            .network
            .parse()
            .with_context(|| format!("invalid network CIDR {:?}", raw.network))?;

        let gateway: Ipv4Addr = raw
            .gateway
            .parse()
            .with_context(|| format!("subnet {network}: invalid gateway {:?}", raw.gateway))?;
        if !network.contains(gateway) {
            bail!("subnet {network}: gateway {gateway} is not in network");
        }

        let dns_servers = raw
            .dns_servers
            .iter()
            .map(|s| {
                s.parse::<Ipv4Addr>()
                    .with_context(|| format!("subnet {network}: invalid DNS server {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        if raw.pools.is_empty() && raw.reservations.is_empty() {
            warn!(%network, "subnet has no pools or reservations");
        }

        let pools = raw
            .pools
            .iter()
            .map(|pool| {
                let range_start: Ipv4Addr = pool.range_start.parse().with_context(|| {
                    format!(
                        "subnet {network}: invalid range_start {:?}",
                        pool.range_start
                    )
                })?;
                let range_end: Ipv4Addr = pool.range_end.parse().with_context(|| {
                    format!("subnet {network}: invalid range_end {:?}", pool.range_end)
                })?;
                if !network.contains(range_start) {
                    bail!("subnet {network}: range_start {range_start} is not in network");
                }
                if !network.contains(range_end) {
                    bail!("subnet {network}: range_end {range_end} is not in network");
                }
                if u32::from(range_start) > u32::from(range_end) {
                    bail!("subnet {network}: range_start must be <= range_end");
                }
                Ok(Pool {
                    range_start,
                    range_end,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let reservations = raw
            .reservations
            .iter()
            .map(|res| {
                if res.hostname.is_empty() {
                    bail!("subnet {network}: reservation hostname is required");
                }
                let mac: MacAddr = res.mac.parse().map_err(|err| {
                    anyhow::anyhow!("subnet {network}: invalid MAC {:?}: {err}", res.mac)
                })?;
                let ip: Ipv4Addr = res.ip.parse().with_context(|| {
                    format!("subnet {network}: invalid reservation IP {:?}", res.ip)
                })?;
                if !network.contains(ip) {
                    bail!("subnet {network}: reservation IP {ip} is not in network");
                }
                Ok(StaticHost {
                    hostname: res.hostname.clone(),
                    mac,
                    ip,
                    description: res.description.clone(),
                    boot: res.boot.as_ref().map(convert_boot),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Subnet {
            network,
            description: raw.description.clone(),
            gateway,
            dns_servers,
            lease_duration: Duration::from_secs(raw.lease_duration),
            max_lease_duration: Duration::from_secs(raw.max_lease_duration),
            options: raw.options.clone(),
            boot: raw.boot.as_ref().map(convert_boot),
            pools,
            reservations,
        })
    }
}

fn convert_boot(raw: &wire::Boot) -> Boot {
    Boot {
        tftp_server: raw.tftp_server.clone(),
        filename: raw.filename.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE_YAML: &str = include_str!("../sample/config.yaml");

    #[test]
    fn parses_sample_config() {
        let cfg = Config::parse_str(SAMPLE_YAML).unwrap();
        assert_eq!(cfg.subnets.len(), 1);
        let subnet = &cfg.subnets[0];
        assert_eq!(subnet.network.to_string(), "192.168.1.0/24");
        assert_eq!(subnet.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(subnet.lease_duration, Duration::from_secs(3600));
        assert_eq!(subnet.pools.len(), 1);
        assert!(subnet.pools[0].contains(Ipv4Addr::new(192, 168, 1, 105)));
        assert!(!subnet.pools[0].contains(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(subnet.reservations.len(), 1);
        assert_eq!(subnet.reservations[0].mac.to_string(), "aa:bb:cc:dd:ee:02");
        assert_eq!(cfg.git.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.server.server_id, "dhcp-a");
    }

    #[test]
    fn rejects_empty_subnets() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
subnets: []
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one subnet"));
    }

    #[test]
    fn rejects_ipv6_interfaces() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0, ipv4: false, ipv6: true }]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("IPv6 is not supported"));
    }

    #[test]
    fn rejects_gateway_outside_network() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.1.1
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("not in network"));
    }

    #[test]
    fn rejects_inverted_pool_range() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
    pools:
      - range_start: 10.0.0.200
        range_end: 10.0.0.100
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("range_start must be <="));
    }

    #[test]
    fn rejects_bad_reservation_mac() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
    reservations:
      - hostname: printer
        mac: not-a-mac
        ip: 10.0.0.9
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid MAC"));
    }

    #[test]
    fn git_disabled_needs_no_repository() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
git:
  enabled: false
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
"#;
        let cfg = Config::parse_str(yaml).unwrap();
        assert!(!cfg.git.enabled);
        assert_eq!(cfg.git.auth, GitAuth::None);
    }

    #[test]
    fn git_enabled_requires_repository() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
git:
  enabled: true
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
"#;
        let err = Config::parse_str(yaml).unwrap_err();
        assert!(err.to_string().contains("git.repository is required"));
    }

    #[test]
    fn single_address_pool_is_valid() {
        let yaml = r#"
server:
  interfaces: [{ name: eth0 }]
database:
  connection: postgres://localhost/ember
subnets:
  - network: 10.0.0.0/24
    gateway: 10.0.0.1
    pools:
      - range_start: 10.0.0.50
        range_end: 10.0.0.50
"#;
        let cfg = Config::parse_str(yaml).unwrap();
        assert_eq!(cfg.subnets[0].pools[0].size(), 1);
    }
}
