//! Serde representation of the YAML configuration file.
//!
//! These types mirror the file exactly; no cross-field checks happen here.
//! [`crate::Config::parse_str`] converts them into validated runtime types.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub(crate) fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

fn default_web_port() -> u16 {
    8080
}

fn default_branch() -> String {
    "main".into()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_sync_timeout() -> u64 {
    30
}

fn default_config_path() -> String {
    "dhcp.yaml".into()
}

/// one day
fn default_lease_duration() -> u64 {
    86_400
}

/// seven days
fn default_max_lease_duration() -> u64 {
    604_800
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub server: Server,
    pub database: Database,
    #[serde(default)]
    pub observability: Observability,
    #[serde(default)]
    pub git: Git,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Server {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Interface {
    pub name: String,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Database {
    pub connection: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Observability {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub web_enabled: bool,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub web_auth: WebAuth,
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            web_enabled: false,
            web_port: default_web_port(),
            web_auth: WebAuth::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Git {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub auth: GitAuth,
    /// seconds between repository polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// seconds before a sync attempt is abandoned
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: u64,
    #[serde(default = "default_true")]
    pub validate_before_sync: bool,
    /// path of the DHCP config file inside the repository
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            enabled: false,
            repository: String::new(),
            branch: default_branch(),
            auth: GitAuth::default(),
            poll_interval: default_poll_interval(),
            sync_timeout: default_sync_timeout(),
            validate_before_sync: true,
            config_path: default_config_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GitAuth {
    /// one of `token`, `ssh`, `none`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ssh_key_path: String,
}

impl Default for GitAuth {
    fn default() -> Self {
        Self {
            kind: "none".into(),
            token: String::new(),
            ssh_key_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subnet {
    pub network: String,
    #[serde(default)]
    pub description: String,
    pub gateway: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// seconds
    #[serde(default = "default_lease_duration")]
    pub lease_duration: u64,
    /// hard ceiling, seconds
    #[serde(default = "default_max_lease_duration")]
    pub max_lease_duration: u64,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub boot: Option<Boot>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Boot {
    /// DHCP option 66
    #[serde(default)]
    pub tftp_server: Option<String>,
    /// DHCP option 67
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pool {
    pub range_start: String,
    pub range_end: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reservation {
    pub hostname: String,
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub boot: Option<Boot>,
}
