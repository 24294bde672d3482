//! # sum-rs
//!
//! Orchestrator for a cluster of sum nodes. It shards vector records across
//! nodes, keeps them balanced, resolves identifier clashes when populated
//! nodes join, and runs JavaScript oracles on every node at once, merging
//! the per-node answers into one.
//!
//! The orchestrator speaks the same `SumService` protocol as a single node,
//! plus `SumMasterService` for membership management.

pub mod balancer;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod conflicts;
pub mod counters;
pub mod error;
pub mod node;
pub mod oracles;
pub mod router;
pub mod runner;
pub mod scatter;
pub mod script;
pub mod service;
pub mod test_support;

pub mod proto {
    tonic::include_proto!("sum");
}

pub use cluster::Cluster;
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use service::OrchestratorService;
