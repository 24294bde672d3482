//! Unified configuration for the orchestrator.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (sum.toml)
//! ```toml
//! listen = "0.0.0.0:50051"
//! nodes_file = "/var/lib/sum/nodes.json"
//! timeout_secs = 30
//! interpreter_pool_size = 16
//!
//! [[nodes]]
//! address = "node-1:5000"
//! credentials = "/etc/sum/node-1"
//!
//! [tls]
//! cert = "/etc/sum/orchestrator.crt"
//! key = "/etc/sum/orchestrator.key"
//! ```
//!
//! Environment variables use the `SUM_` prefix, with `__` separating nested
//! keys (`SUM_TIMEOUT_SECS=30`, `SUM_TLS__CERT=/etc/sum/o.crt`).

mod defaults;
mod topology;

pub use defaults::*;
pub use topology::{NodeEntry, Topology};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Topology snapshot, read at bootstrap and rewritten on membership changes
    pub nodes_file: Option<PathBuf>,
    /// Inline node list, used when no snapshot is configured
    pub nodes: Vec<NodeEntry>,
    /// Per-RPC timeout towards nodes
    pub timeout_secs: u64,
    /// Maximum gRPC message size, both directions
    pub max_message_size: usize,
    /// Status poll period
    pub poll_interval_secs: u64,
    /// Interpreters reserved for merge functions
    pub interpreter_pool_size: usize,
    /// Certificates used by the orchestrator itself
    pub tls: TlsConfig,
    /// Reported by Info
    pub credentials_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            nodes_file: None,
            nodes: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            interpreter_pool_size: DEFAULT_INTERPRETER_POOL_SIZE,
            tls: TlsConfig::default(),
            credentials_path: None,
        }
    }
}

/// Orchestrator certificates. The same identity is served to clients and
/// presented to nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: Option<PathBuf>,
    /// PEM private key
    pub key: Option<PathBuf>,
    /// When set, clients of the orchestrator must present a certificate
    /// signed by this CA
    pub client_ca: Option<PathBuf>,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

impl OrchestratorConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(OrchestratorConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SUM_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter_pool_size == 0 {
            return Err(ConfigError::new("interpreter_pool_size must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::new("poll_interval_secs must be at least 1"));
        }
        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(ConfigError::new("tls.cert and tls.key must be set together"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// The nodes to bootstrap with: the snapshot when one exists, the inline
    /// list otherwise.
    pub fn initial_nodes(&self) -> Result<Vec<NodeEntry>, ConfigError> {
        match &self.nodes_file {
            Some(path) if path.exists() => Ok(Topology::load(path)?.nodes),
            _ => Ok(self.nodes.clone()),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// Normalize a node address into a gRPC endpoint URI (add a scheme if
/// missing, `https://` when the node has credentials).
pub fn node_endpoint(address: &str, secure: bool) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if secure {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    }
}

/// Parse a comma separated `host:port` list as given on the command line.
pub fn parse_node_list(raw: &str) -> Vec<NodeEntry> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(NodeEntry::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_LISTEN_PORT);
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(config.max_message_size, 50 * 1024 * 1024);
        assert_eq!(config.interpreter_pool_size, DEFAULT_INTERPRETER_POOL_SIZE);
        assert!(!config.tls.enabled());
    }

    #[test]
    fn test_node_endpoint() {
        assert_eq!(node_endpoint("localhost:5000", false), "http://localhost:5000");
        assert_eq!(node_endpoint("localhost:5000", true), "https://localhost:5000");
        assert_eq!(node_endpoint("http://n1:5000", true), "http://n1:5000");
    }

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list("a:1, b:2,,");
        assert_eq!(nodes, vec![NodeEntry::new("a:1"), NodeEntry::new("b:2")]);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "timeout_secs = 30\ninterpreter_pool_size = 2\n[[nodes]]\naddress = \"n1:5000\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = OrchestratorConfig::load(
            Some(&path),
            ConfigOverrides {
                timeout_secs: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.interpreter_pool_size, 2);
        assert_eq!(config.nodes, vec![NodeEntry::new("n1:5000")]);
    }

    #[test]
    fn test_half_configured_tls_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[tls]\ncert = \"/tmp/o.crt\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = OrchestratorConfig::from_env(Some(&path)).unwrap_err();
        assert!(err.message.contains("tls.cert and tls.key"));
    }

    #[test]
    fn test_snapshot_wins_over_inline_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        Topology {
            nodes: vec![NodeEntry::new("snap:1")],
        }
        .save(&path)
        .unwrap();

        let config = OrchestratorConfig {
            nodes_file: Some(path),
            nodes: vec![NodeEntry::new("inline:1")],
            ..Default::default()
        };
        assert_eq!(config.initial_nodes().unwrap(), vec![NodeEntry::new("snap:1")]);
    }
}
