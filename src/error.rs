//! # Errors
//!
//! Error taxonomy shared by every orchestrator component. Internal APIs
//! return these; the gRPC layer flattens them into in-band
//! `success = false` responses.

use serde_json::Value;
use thiserror::Error;

/// Failures surfaced by cluster operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No nodes available, try later")]
    NoNodes,
    #[error("record {0} not found.")]
    RecordNotFound(u64),
    #[error("record {0} already exists.")]
    RecordExists(u64),
    #[error("oracle {0} not found.")]
    OracleNotFound(u64),
    #[error("oracle '{0}' not found.")]
    OracleNameNotFound(String),
    #[error("node {0} not found.")]
    NodeNotFound(u64),
    /// Unreachable node, TLS failure or timeout.
    #[error("{0}")]
    Transport(String),
    /// A node answered but refused the request.
    #[error("{0}")]
    Rejected(String),
    /// Broadcast where no node produced a positive answer.
    #[error("No node was able to satisfy your request: [{}]", .0.join(", "))]
    Unsatisfied(Vec<String>),
    /// Fan-out where at least one node failed.
    #[error("Errors from nodes: [{}]", .0.join(", "))]
    NodeErrors(Vec<String>),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("Unable to merge results from nodes: {0}")]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures while parsing or evaluating oracle code.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Error parsing the code: {0}")]
    Parse(String),
    #[error("Error parsing the code: no function provided")]
    NoFunction,
    #[error("script raised an exception: {0}")]
    Runtime(String),
    /// The script called `ctx.Error(...)`.
    #[error("script signalled a failure: {0}")]
    Signalled(String),
    #[error("couldn't serialize returned object of type {0}")]
    NotSerializable(String),
    #[error("malformed interpreter output: {0}")]
    Envelope(String),
    #[error("unable to start interpreter: {0}")]
    Spawn(String),
    #[error("interpreter pool is closed")]
    PoolClosed,
}

/// Failures of the default (script-less) merge policy or of a custom merge
/// function.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("heterogeneous results: prior results had type {prior}, this one has type {current}")]
    Heterogeneous {
        prior: &'static str,
        current: &'static str,
    },
    #[error("merge conflict: multiple results define key {key}: oldValue='{old}', newValue='{new}'")]
    KeyConflict { key: String, old: Value, new: Value },
    #[error("type {0} is not supported for auto-merge, please provide a custom merge function")]
    Unsupported(&'static str),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Failures of the record and payload interchange encodings.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid base64 text: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid record encoding: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_errors_render_as_bracketed_list() {
        let err = OrchestratorError::NodeErrors(vec!["node 1: down".into(), "node 2: slow".into()]);
        assert_eq!(err.to_string(), "Errors from nodes: [node 1: down, node 2: slow]");

        let err = OrchestratorError::Unsatisfied(vec!["node 3: timeout".into()]);
        assert_eq!(
            err.to_string(),
            "No node was able to satisfy your request: [node 3: timeout]"
        );
    }

    #[test]
    fn merge_errors_keep_their_prefix() {
        let err: OrchestratorError = MergeError::Unsupported("number").into();
        assert!(err.to_string().starts_with("Unable to merge results from nodes: "));
        assert!(err.to_string().contains("not supported for auto-merge"));
    }
}
