//! Default constants for the orchestrator configuration.
//!
//! All magic numbers are centralized here with documentation.

use std::net::{Ipv4Addr, SocketAddr};

// =============================================================================
// Network Defaults
// =============================================================================

/// Default orchestrator listen port
pub const DEFAULT_LISTEN_PORT: u16 = 50051;

/// Default orchestrator listen address (loopback only)
pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT))
}

/// Per-RPC timeout towards nodes (seconds).
/// Deliberately large: a distributed Run waits for the slowest node.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Maximum gRPC message size in bytes (50MB), for both directions.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

// =============================================================================
// Cluster Maintenance Defaults
// =============================================================================

/// Interval between node status polls (seconds).
/// Every poll is followed by one balancing pass.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Page size used when enumerating the record ids held by a node.
pub const NODE_ID_PAGE_SIZE: u64 = 1024;

/// Balancer hysteresis, as a divisor of the fair share (1/20 = 5%).
pub const BALANCE_TOLERANCE_DIVISOR: u64 = 20;

// =============================================================================
// Script Defaults
// =============================================================================

/// Number of interpreters available to merge functions.
pub const DEFAULT_INTERPRETER_POOL_SIZE: usize = 8;

/// Oracle results larger than this many bytes are gzip-compressed.
pub const PAYLOAD_COMPRESSION_THRESHOLD: usize = 2048;
