//! Forward service configuration.
//!
//! Process settings come from the environment (`Config::from_env`). The
//! routing setup (hop nodes, hosts table, rate limits, handler metadata)
//! comes from an optional TOML file named by `HOPLINE_CONFIG`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hopline_chain::{
    FailFilter, HttpNodeSettings, Node, NodeFilter, NodeHop, StaticHosts, Strategy,
    DEFAULT_CONNECT_TIMEOUT,
};
use serde::Deserialize;
use thiserror::Error;

use crate::listener::DEFAULT_MAX_CONNECTIONS;
use crate::metadata::Metadata;
use crate::rate_limit::{KeyedRateLimiter, RateLimit};

/// Name the configured hop and hosts table are registered under.
pub const DEFAULT_REGISTRY_NAME: &str = "default";

/// Forward service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Optional TOML file with the routing setup.
    pub config_file: Option<PathBuf>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Registered handler to serve connections with.
    pub handler: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("HOPLINE_LISTEN")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("HOPLINE_LISTEN must be a socket address (example: 0.0.0.0:8080).")?;

        let config_file = std::env::var("HOPLINE_CONFIG").ok().map(PathBuf::from);

        let max_connections: usize = std::env::var("HOPLINE_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("HOPLINE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level =
            std::env::var("HOPLINE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let handler = std::env::var("HOPLINE_HANDLER").unwrap_or_else(|_| "forward".to_string());

        Ok(Self {
            listen_addr,
            config_file,
            max_connections,
            log_level,
            handler,
        })
    }

    /// Routing setup from `config_file`, or an empty one.
    pub fn load_file(&self) -> Result<FileConfig> {
        match &self.config_file {
            Some(path) => FileConfig::load(path)
                .with_context(|| format!("Failed to load config file {}", path.display())),
            None => Ok(FileConfig::default()),
        }
    }
}

/// Errors loading or interpreting the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid {field}: {detail}")]
    Invalid { field: String, detail: String },
}

/// Contents of the TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub handler: HandlerSection,
    pub limiter: Option<LimiterSection>,
    pub hop: Option<HopSection>,
    /// Static host name to address mapping.
    pub hosts: BTreeMap<String, Vec<IpAddr>>,
    /// Outbound connect timeout.
    pub dial_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerSection {
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSection {
    /// Tokens per second for every client; unset limits only `keys`.
    pub rate: Option<f64>,
    pub burst: u32,
    /// Per client IP overrides.
    pub keys: BTreeMap<String, RateLimit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HopSection {
    #[serde(default = "default_hop_name")]
    pub name: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub max_fails: Option<u32>,
    #[serde(default)]
    pub fail_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_fail_timeout_ms: Option<u64>,
    #[serde(default)]
    pub nodes: Vec<NodeSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub name: String,
    pub addr: String,
    /// Host filter: exact name or `*.suffix`.
    #[serde(default)]
    pub host: Option<String>,
    /// Protocol filter, e.g. `http`.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub http: Option<HttpSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    pub host: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A positive rate must yield a usable quota; zero and below disable limiting.
fn check_rate(field: &str, limit: &RateLimit) -> Result<(), ConfigError> {
    if limit.rate > 0.0 && limit.quota().is_none() {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            detail: format!("rate {} is out of range", limit.rate),
        });
    }
    Ok(())
}

fn default_hop_name() -> String {
    DEFAULT_REGISTRY_NAME.to_string()
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Static hosts table, if any host is configured.
    pub fn build_hosts(&self) -> Option<StaticHosts> {
        if self.hosts.is_empty() {
            return None;
        }
        Some(
            self.hosts
                .iter()
                .map(|(host, ips)| (host.clone(), ips.clone()))
                .collect(),
        )
    }

    /// Rate limiter, if a `[limiter]` section is present.
    pub fn build_rate_limiter(&self) -> Result<Option<KeyedRateLimiter>, ConfigError> {
        let Some(section) = self.limiter.as_ref() else {
            return Ok(None);
        };
        let mut limiter = match section.rate {
            Some(rate) => {
                let limit = RateLimit::new(rate, section.burst);
                check_rate("limiter.rate", &limit)?;
                KeyedRateLimiter::new(limit)
            }
            None => KeyedRateLimiter::unlimited(),
        };
        for (key, limit) in &section.keys {
            check_rate(&format!("limiter.keys.{}.rate", key), limit)?;
            limiter = limiter.with_override(key.clone(), *limit);
        }
        Ok(Some(limiter))
    }

    /// Hop over the configured nodes, if a `[hop]` section is present.
    pub fn build_hop(&self) -> Result<Option<NodeHop>, ConfigError> {
        let Some(section) = &self.hop else {
            return Ok(None);
        };

        let strategy = match &section.strategy {
            Some(s) => s.parse::<Strategy>().map_err(|detail| ConfigError::Invalid {
                field: "hop.strategy".to_string(),
                detail,
            })?,
            None => Strategy::default(),
        };

        let defaults = FailFilter::default();
        let filter = FailFilter {
            max_fails: section.max_fails.unwrap_or(defaults.max_fails),
            fail_timeout: section
                .fail_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.fail_timeout),
            max_fail_timeout: section
                .max_fail_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_fail_timeout),
        };

        let mut nodes = Vec::with_capacity(section.nodes.len());
        for (i, node) in section.nodes.iter().enumerate() {
            if node.addr.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: format!("hop.nodes[{}].addr", i),
                    detail: "address cannot be empty".to_string(),
                });
            }
            if nodes.iter().any(|n: &Node| n.name() == node.name) {
                return Err(ConfigError::Invalid {
                    field: format!("hop.nodes[{}].name", i),
                    detail: format!("duplicate node name {}", node.name),
                });
            }
            nodes.push(node.build());
        }

        Ok(Some(
            NodeHop::new(section.name.clone(), nodes)
                .with_strategy(strategy)
                .with_exclusion(filter),
        ))
    }
}

impl NodeSection {
    fn build(&self) -> Node {
        let mut node = Node::new(self.name.clone(), self.addr.trim());
        if self.host.is_some() || self.protocol.is_some() {
            node = node.with_filter(NodeFilter {
                host: self.host.clone(),
                protocol: self.protocol.clone(),
            });
        }
        if let Some(http) = &self.http {
            node = node.with_http(HttpNodeSettings {
                host: http.host.clone(),
                headers: http.headers.clone(),
            });
        }
        node
    }
}
