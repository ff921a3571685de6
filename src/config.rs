//! WolfRepl Configuration
//!
//! This module provides configuration structures for the replication
//! transport: the local site, the initial remote site list, and the
//! acknowledgment and queueing parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::perm::{AckPolicy, PermPolicy};
use crate::site::parse_address;

/// Main WolfRepl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepConfig {
    /// Local site configuration
    pub node: NodeConfig,

    /// Initial remote sites
    #[serde(default)]
    pub sites: SitesConfig,

    /// Acknowledgment and transport tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host name advertised to other sites
    pub host: String,

    /// Listen port advertised to other sites (0 = pick an ephemeral port)
    pub port: u16,

    /// Election priority (0 = client-only, never counts toward quorum)
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Address to bind the listener on (defaults to host:port)
    #[serde(default)]
    pub bind_address: Option<String>,
}

/// Initial remote site list
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SitesConfig {
    /// Remote site addresses (host:port)
    #[serde(default)]
    pub remotes: Vec<String>,
}

/// Acknowledgment and transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Acknowledgment policy for permanent messages
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// How long to wait for acks of a permanent message
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Per-connection outbound queue limit (messages)
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Require a true majority for quorum in a two-site group
    #[serde(default)]
    pub two_site_strict: bool,

    /// Outbound connect timeout per address
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before reconnecting to a lost site
    #[serde(default = "default_connection_retry_ms")]
    pub connection_retry_ms: u64,

    /// Heartbeat broadcast interval (0 = disabled)
    #[serde(default)]
    pub heartbeat_interval_ms: u64,

    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_priority() -> u32 {
    100
}

fn default_ack_timeout_ms() -> u64 {
    1000
}

fn default_queue_limit() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_connection_retry_ms() -> u64 {
    30_000
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            ack_timeout_ms: default_ack_timeout_ms(),
            queue_limit: default_queue_limit(),
            two_site_strict: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            connection_retry_ms: default_connection_retry_ms(),
            heartbeat_interval_ms: 0,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RepConfig {
    /// Configuration for a local site with defaults everywhere else
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            node: NodeConfig {
                host: host.into(),
                port,
                priority: default_priority(),
                bind_address: None,
            },
            sites: SitesConfig::default(),
            replication: ReplicationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.host.is_empty() {
            return Err(crate::Error::Config("node.host cannot be empty".into()));
        }

        if self.replication.queue_limit == 0 {
            return Err(crate::Error::Config("replication.queue_limit must be at least 1".into()));
        }

        if self.replication.ack_timeout_ms == 0 {
            return Err(crate::Error::Config("replication.ack_timeout_ms must be positive".into()));
        }

        for remote in &self.sites.remotes {
            parse_address(remote)?;
        }

        Ok(())
    }

    /// Address the listener binds to
    pub fn listen_address(&self) -> String {
        self.node
            .bind_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.node.host, self.node.port))
    }

    /// Permanence policy in effect
    pub fn perm_policy(&self) -> PermPolicy {
        PermPolicy::new(self.replication.ack_policy, self.replication.two_site_strict)
    }

    /// Get ack timeout as Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.ack_timeout_ms)
    }

    /// Longest a blockable send waits for a saturated queue to drain
    pub fn queue_wait(&self) -> Duration {
        self.ack_timeout() * self.replication.queue_limit as u32
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }

    /// Get reconnect delay as Duration
    pub fn connection_retry(&self) -> Duration {
        Duration::from_millis(self.replication.connection_retry_ms)
    }

    /// Heartbeat interval, if heartbeats are enabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.replication.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
