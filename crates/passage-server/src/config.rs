//! Server configuration: TOML file deserialization with flag-friendly
//! defaults.

use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid port range: {0}")]
    InvalidPortRange(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the control listener binds to.
    pub bind_addr: String,
    /// Control port clients dial out to.
    pub bind_port: u16,
    /// Secondary transport port. Zero disables. Reserved; no transport is
    /// wired to it yet.
    pub kcp_bind_port: u16,
    /// UDP port for NAT-hole rendezvous. Zero disables. Reserved.
    pub bind_udp_port: u16,

    /// Address proxy and vhost listeners bind to.
    pub proxy_bind_addr: String,
    /// HTTP vhost port. Zero disables. Shares the control port via the
    /// port muxer when addresses and ports coincide.
    pub vhost_http_port: u16,
    /// HTTPS vhost port. Zero disables.
    pub vhost_https_port: u16,
    /// Seconds allowed for one inbound HTTP request head.
    pub vhost_http_timeout: u64,

    /// Shared secret clients authenticate with.
    pub token: String,
    /// Allowed clock skew for login/visitor timestamps, seconds. Zero
    /// disables the window check.
    pub auth_timeout: i64,

    /// Seconds of ping silence before a client session is torn down.
    pub heartbeat_timeout: u64,
    /// Seconds an external user waits for a work connection.
    pub user_conn_timeout: u64,

    /// Ports clients may claim, e.g. "2000-3000,3001,4000-50000".
    /// Empty allows any non-privileged port.
    pub allow_ports: String,
    /// Per-client cap on allocated ports. Zero means unlimited.
    pub max_ports_per_client: usize,
    /// Upper bound on any client's work-connection pool.
    pub max_pool_count: usize,

    /// Multiplex many logical streams over each client connection.
    pub tcp_mux: bool,

    /// Suffix for subdomain-style HTTP vhost names.
    pub subdomain_host: String,

    // Dashboard settings are accepted for config compatibility; the
    // dashboard itself is not part of this server.
    pub dashboard_addr: String,
    pub dashboard_port: u16,
    pub dashboard_user: String,
    pub dashboard_pwd: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            kcp_bind_port: 0,
            bind_udp_port: 0,
            proxy_bind_addr: "0.0.0.0".to_string(),
            vhost_http_port: 0,
            vhost_https_port: 0,
            vhost_http_timeout: 60,
            token: String::new(),
            auth_timeout: 900,
            heartbeat_timeout: 90,
            user_conn_timeout: 10,
            allow_ports: String::new(),
            max_ports_per_client: 0,
            max_pool_count: 5,
            tcp_mux: true,
            subdomain_host: String::new(),
            dashboard_addr: "0.0.0.0".to_string(),
            dashboard_port: 0,
            dashboard_user: String::new(),
            dashboard_pwd: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn vhost_http_address(&self) -> String {
        format!("{}:{}", self.proxy_bind_addr, self.vhost_http_port)
    }

    pub fn vhost_https_address(&self) -> String {
        format!("{}:{}", self.proxy_bind_addr, self.vhost_https_port)
    }

    pub fn allow_port_ranges(&self) -> Result<Vec<RangeInclusive<u16>>, ConfigError> {
        parse_port_ranges(&self.allow_ports)
    }
}

/// Parse an allow-list like "2000-3000,3001,4000-50000".
pub fn parse_port_ranges(list: &str) -> Result<Vec<RangeInclusive<u16>>, ConfigError> {
    let mut ranges = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let range = match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidPortRange(part.to_string()))?;
                let hi: u16 = hi
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidPortRange(part.to_string()))?;
                if lo > hi {
                    return Err(ConfigError::InvalidPortRange(part.to_string()));
                }
                lo..=hi
            }
            None => {
                let port: u16 = part
                    .parse()
                    .map_err(|_| ConfigError::InvalidPortRange(part.to_string()))?;
                port..=port
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}
