//! Cluster topology snapshot.
//!
//! A JSON file listing the nodes the orchestrator manages:
//!
//! ```json
//! {"nodes": [{"address": "10.0.0.1:5000", "credentials": "/etc/sum/node1"}]}
//! ```
//!
//! It is read once at bootstrap and rewritten after every membership change.
//! Writes are best effort; the live node list is authoritative.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One node endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    /// PEM trust anchor for the node; plaintext when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PathBuf>,
}

impl NodeEntry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::new(format!("parsing {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::new(format!("encoding topology: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| ConfigError::new(format!("writing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_optional() {
        let topology: Topology =
            serde_json::from_str(r#"{"nodes":[{"address":"a:1"},{"address":"b:2","credentials":"/tmp/b"}]}"#)
                .unwrap();
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.nodes[0].credentials, None);
        assert_eq!(topology.nodes[1].credentials, Some(PathBuf::from("/tmp/b")));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let topology = Topology {
            nodes: vec![NodeEntry::new("127.0.0.1:5001"), NodeEntry::new("127.0.0.1:5002")],
        };
        topology.save(&path).unwrap();
        assert_eq!(Topology::load(&path).unwrap(), topology);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Topology::load(Path::new("/nonexistent/sum/nodes.json")).unwrap_err();
        assert!(err.to_string().starts_with("configuration error: reading"));
    }
}
