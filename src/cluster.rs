//! Cluster state and membership.
//!
//! `Cluster` owns the node list, the shard map and the oracle catalog, each
//! behind its own reader/writer lock. Operations that need several of them
//! acquire in the order nodes, records, oracles, then per-node mutexes.
//! Record routing lives in [`crate::router`], balancing in
//! [`crate::balancer`], distributed execution in [`crate::runner`].

use crate::balancer;
use crate::config::{NodeEntry, OrchestratorConfig, Topology};
use crate::counters::Counters;
use crate::error::{OrchestratorError, Result};
use crate::node::{Node, NodeId, TransportSettings};
use crate::oracles::{absorb_oracles, OracleCatalog};
use crate::proto;
use crate::router::ShardMap;
use crate::scatter::{run_on_all, Gather};
use crate::script::InterpreterPool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Everything a cluster needs besides its nodes.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub transport: TransportSettings,
    pub interpreter_pool_size: usize,
    /// Rewritten after membership changes when set.
    pub topology_path: Option<PathBuf>,
    /// Reported by Info.
    pub address: String,
    pub credentials_path: String,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            interpreter_pool_size: crate::config::DEFAULT_INTERPRETER_POOL_SIZE,
            topology_path: None,
            address: String::new(),
            credentials_path: String::new(),
        }
    }
}

impl ClusterOptions {
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            transport: TransportSettings::from_config(config)?,
            interpreter_pool_size: config.interpreter_pool_size,
            topology_path: config.nodes_file.clone(),
            address: config.listen.to_string(),
            credentials_path: config
                .credentials_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        })
    }
}

pub struct Cluster {
    pub(crate) nodes: RwLock<Vec<Arc<Node>>>,
    pub(crate) records: RwLock<ShardMap>,
    pub(crate) oracles: RwLock<OracleCatalog>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) pool: InterpreterPool,
    options: ClusterOptions,
    started: Instant,
}

impl Cluster {
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let entries = config
            .initial_nodes()
            .map_err(|e| OrchestratorError::InvalidArgument(e.to_string()))?;
        Self::bootstrap(entries, ClusterOptions::from_config(config)?).await
    }

    /// Connect to every node (ids 1..=n in order), reconcile their contents
    /// and take over the oracles they store.
    pub async fn bootstrap(entries: Vec<NodeEntry>, options: ClusterOptions) -> Result<Self> {
        let mut nodes = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let node = Node::connect(index as NodeId + 1, entry, &options.transport).await?;
            nodes.push(Arc::new(node));
        }

        let counters = Arc::new(Counters::new(nodes.len() as NodeId + 1));
        for node in &nodes {
            raise_record_floor(&counters, node);
        }

        let cluster = Self {
            nodes: RwLock::new(nodes),
            records: RwLock::new(ShardMap::default()),
            oracles: RwLock::new(OracleCatalog::new(counters.clone())),
            pool: InterpreterPool::new(options.interpreter_pool_size)?,
            counters,
            options,
            started: Instant::now(),
        };

        {
            let nodes = cluster.nodes.read().await;
            let mut map = cluster.records.write().await;
            if let Err(err) = cluster.resolve_conflicts(&nodes).await {
                error!(error = %err, "cannot solve conflicts between nodes");
            }
            *map = ShardMap::rebuild(&nodes);
            cluster.balance_locked(&nodes, &mut map).await;

            let mut oracles = cluster.oracles.write().await;
            for node in nodes.iter() {
                absorb_oracles(node, &mut oracles).await;
            }
            info!(
                nodes = nodes.len(),
                records = map.len(),
                oracles = oracles.len(),
                "cluster ready"
            );
        }

        Ok(cluster)
    }

    /// Start managing the node at `address`. Its records are reconciled
    /// with the rest of the cluster and its oracles absorbed.
    pub async fn add_node(&self, address: &str, cert_file: &str) -> Result<NodeId> {
        let entry = NodeEntry {
            address: address.to_string(),
            credentials: (!cert_file.is_empty()).then(|| PathBuf::from(cert_file)),
        };
        // Held across the connect so concurrent joins cannot admit one
        // address twice or push ids out of order.
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.address == entry.address) {
            return Err(OrchestratorError::Rejected(format!(
                "node {} is already part of the cluster.",
                entry.address
            )));
        }

        let id = self.counters.nodes.peek();
        let node = Node::connect(id, &entry, &self.options.transport)
            .await
            .map_err(|e| OrchestratorError::Transport(format!("Cannot create node: {e}")))?;
        self.counters.nodes.allocate();
        let node = Arc::new(node);
        raise_record_floor(&self.counters, &node);

        let mut map = self.records.write().await;
        nodes.push(node.clone());

        if let Err(err) = self.resolve_conflicts(&nodes).await {
            error!(node = id, error = %err, "cannot solve conflicts after adding node");
        }
        *map = ShardMap::rebuild(&nodes);
        self.balance_locked(&nodes, &mut map).await;

        {
            let mut oracles = self.oracles.write().await;
            absorb_oracles(&node, &mut oracles).await;
        }
        self.save_topology(&nodes);
        info!(node = id, address = %node.address, "node added");
        Ok(id)
    }

    /// Stop managing a node after moving its records elsewhere.
    pub async fn delete_node(&self, id: NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let mut map = self.records.write().await;

        let index = nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(OrchestratorError::NodeNotFound(id))?;
        let node = nodes.remove(index);

        let held = node.record_ids().len() as u64;
        if held > 0 {
            let Some(target) = least_loaded(&nodes).cloned() else {
                nodes.insert(index, node);
                return Err(OrchestratorError::Rejected(format!(
                    "node {id} is the last node and still holds {held} records."
                )));
            };
            if let Err(err) = balancer::transfer(&node, &target, held, &mut map).await {
                nodes.insert(index, node);
                return Err(err);
            }
        }
        map.purge_node(id);

        self.balance_locked(&nodes, &mut map).await;
        self.save_topology(&nodes);
        info!(node = id, "node removed");
        Ok(())
    }

    pub async fn list_nodes(&self) -> Vec<proto::Node> {
        self.nodes.read().await.iter().map(|n| n.as_proto()).collect()
    }

    /// Refresh every node's cached status, then balance.
    pub async fn poll_nodes(&self) {
        {
            let nodes = self.nodes.read().await;
            let (_, errors) = run_on_all(&nodes, |node, gather: Gather<()>| async move {
                if let Err(err) = node.update_status().await {
                    gather.fail(format!("Unable to update node '{}' status: {err}", node.address));
                }
            })
            .await;
            for err in errors {
                warn!(error = %err, "status poll failed");
            }
        }
        self.balance().await;
    }

    /// Cluster-wide counters plus process metadata.
    pub async fn info(&self) -> proto::ServerInfo {
        let records = self.nodes.read().await.iter().map(|n| n.record_count()).sum();
        let oracles = self.oracles.read().await.len() as u64;
        proto::ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|p| p.get() as u64)
                .unwrap_or(1),
            uptime: self.started.elapsed().as_secs(),
            pid: u64::from(std::process::id()),
            argv: std::env::args().collect(),
            address: self.options.address.clone(),
            credspath: self.options.credentials_path.clone(),
            records,
            oracles,
            next_record_id: self.counters.records.peek(),
            next_oracle_id: self.counters.oracles.peek(),
        }
    }

    /// Snapshot of the shard map, for inspection.
    pub async fn owners(&self) -> BTreeMap<u64, NodeId> {
        self.records.read().await.snapshot()
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.iter().map(|n| n.id).collect()
    }

    fn save_topology(&self, nodes: &[Arc<Node>]) {
        let Some(path) = &self.options.topology_path else {
            return;
        };
        let topology = Topology {
            nodes: nodes.iter().map(|n| n.entry()).collect(),
        };
        if let Err(err) = topology.save(path) {
            warn!(path = %path.display(), error = %err, "unable to update topology snapshot");
        }
    }
}

/// The node with the fewest cached records; ties go to the earliest node.
pub(crate) fn least_loaded(nodes: &[Arc<Node>]) -> Option<&Arc<Node>> {
    nodes
        .iter()
        .enumerate()
        .min_by_key(|(index, node)| (node.record_count(), *index))
        .map(|(_, node)| node)
}

pub(crate) fn find_node(nodes: &[Arc<Node>], id: NodeId) -> Option<&Arc<Node>> {
    nodes.iter().find(|n| n.id == id)
}

fn raise_record_floor(counters: &Counters, node: &Node) {
    if let Some(max) = node.max_record_id() {
        counters.records.bump_floor(max);
    }
    if let Some(used) = node.next_record_id().checked_sub(1) {
        counters.records.bump_floor(used);
    }
}
