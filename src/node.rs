//! A managed node: transport handles, cached status and the set of record
//! ids the node is known to hold.

use crate::config::{node_endpoint, NodeEntry, OrchestratorConfig, NODE_ID_PAGE_SIZE};
use crate::error::{OrchestratorError, Result};
use crate::proto;
use crate::proto::sum_internal_service_client::SumInternalServiceClient;
use crate::proto::sum_service_client::SumServiceClient;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Request, Response, Status};
use tracing::debug;

pub type NodeId = u64;

/// How the orchestrator talks to nodes.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub max_message_size: usize,
    /// Client certificate presented to nodes that require mutual TLS.
    pub identity: Option<Identity>,
}

impl TransportSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let identity = match (&config.tls.cert, &config.tls.key) {
            (Some(cert), Some(key)) => {
                let cert = std::fs::read(cert).map_err(|e| {
                    OrchestratorError::Transport(format!("cannot load certificate file '{}': {e}", cert.display()))
                })?;
                let key = std::fs::read(key).map_err(|e| {
                    OrchestratorError::Transport(format!("cannot load key file '{}': {e}", key.display()))
                })?;
                Some(Identity::from_pem(cert, key))
            }
            _ => None,
        };
        Ok(Self {
            timeout: config.timeout(),
            max_message_size: config.max_message_size,
            identity,
        })
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            identity: None,
        }
    }
}

pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub credentials: Option<PathBuf>,
    data: SumServiceClient<Channel>,
    internal: SumInternalServiceClient<Channel>,
    status: RwLock<proto::ServerInfo>,
    record_ids: Mutex<BTreeSet<u64>>,
    duplicated: Mutex<BTreeSet<u64>>,
    busy: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

impl Node {
    /// Dial the node, fetch its status and enumerate the records it holds.
    pub async fn connect(id: NodeId, entry: &NodeEntry, settings: &TransportSettings) -> Result<Self> {
        let uri = node_endpoint(&entry.address, entry.credentials.is_some());
        let mut endpoint = Endpoint::from_shared(uri).map_err(|e| {
            OrchestratorError::Transport(format!("unable to dial service at '{}': {e}", entry.address))
        })?;
        endpoint = endpoint.timeout(settings.timeout).connect_timeout(settings.timeout);

        if let Some(path) = &entry.credentials {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                OrchestratorError::Transport(format!("cannot load certificate file '{}': {e}", path.display()))
            })?;
            let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            if let Some(identity) = &settings.identity {
                tls = tls.identity(identity.clone());
            }
            endpoint = endpoint.tls_config(tls).map_err(|e| {
                OrchestratorError::Transport(format!("invalid tls setup for '{}': {e}", entry.address))
            })?;
        }

        let channel = endpoint.connect().await.map_err(|e| {
            OrchestratorError::Transport(format!("unable to dial service at '{}': {e}", entry.address))
        })?;
        let limit = settings.max_message_size;
        let data = SumServiceClient::new(channel.clone())
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        let internal = SumInternalServiceClient::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);

        let node = Self {
            id,
            address: entry.address.clone(),
            credentials: entry.credentials.clone(),
            data,
            internal,
            status: RwLock::new(proto::ServerInfo::default()),
            record_ids: Mutex::new(BTreeSet::new()),
            duplicated: Mutex::new(BTreeSet::new()),
            busy: tokio::sync::Mutex::new(()),
        };
        node.update_status().await.map_err(|e| {
            OrchestratorError::Transport(format!(
                "unable to get service info from node '{}': {e}",
                entry.address
            ))
        })?;
        node.load_record_ids().await?;
        debug!(node = id, address = %node.address, records = node.record_count(), "node connected");
        Ok(node)
    }

    pub fn data(&self) -> SumServiceClient<Channel> {
        self.data.clone()
    }

    pub fn internal(&self) -> SumInternalServiceClient<Channel> {
        self.internal.clone()
    }

    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            address: self.address.clone(),
            credentials: self.credentials.clone(),
        }
    }

    /// Exclusive access for mutations that must not interleave on this node.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.busy.lock().await
    }

    pub async fn update_status(&self) -> Result<()> {
        let info = self
            .data()
            .info(Request::new(proto::Empty {}))
            .await
            .map_err(|status| transport_error(self.id, &status))?
            .into_inner();
        *self.status.write() = info;
        Ok(())
    }

    pub fn status(&self) -> proto::ServerInfo {
        self.status.read().clone()
    }

    pub fn record_count(&self) -> u64 {
        self.status.read().records
    }

    pub fn next_record_id(&self) -> u64 {
        self.status.read().next_record_id
    }

    /// Re-read every record id held by the node.
    pub async fn load_record_ids(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let mut page = 1;
        loop {
            let resp = self
                .data()
                .list_records(Request::new(proto::ListRequest {
                    page,
                    per_page: NODE_ID_PAGE_SIZE,
                }))
                .await
                .map_err(|status| transport_error(self.id, &status))?
                .into_inner();
            ids.extend(resp.records.iter().map(|r| r.id));
            if page >= resp.pages {
                break;
            }
            page += 1;
        }
        let count = ids.len() as u64;
        self.duplicated.lock().retain(|id| ids.contains(id));
        *self.record_ids.lock() = ids;
        self.status.write().records = count;
        Ok(())
    }

    pub fn record_ids(&self) -> Vec<u64> {
        self.record_ids.lock().iter().copied().collect()
    }

    pub fn holds(&self, id: u64) -> bool {
        self.record_ids.lock().contains(&id)
    }

    pub fn max_record_id(&self) -> Option<u64> {
        self.record_ids.lock().last().copied()
    }

    /// Account for records the node just stored.
    pub fn note_created(&self, ids: &[u64]) {
        let mut held = self.record_ids.lock();
        let mut status = self.status.write();
        for &id in ids {
            if held.insert(id) {
                status.records += 1;
            }
            if status.next_record_id <= id {
                status.next_record_id = id + 1;
            }
        }
    }

    /// Account for records the node just dropped.
    pub fn note_deleted(&self, ids: &[u64]) {
        let mut held = self.record_ids.lock();
        let mut status = self.status.write();
        for id in ids {
            if held.remove(id) {
                status.records = status.records.saturating_sub(1);
            }
        }
        let mut duplicated = self.duplicated.lock();
        for id in ids {
            duplicated.remove(id);
        }
    }

    /// Records copied elsewhere whose removal from this node failed. The
    /// shard map points at the copy; these stay here until someone
    /// deletes them.
    pub fn note_duplicated(&self, ids: &[u64]) {
        self.duplicated.lock().extend(ids.iter().copied());
    }

    pub fn is_duplicated(&self, id: u64) -> bool {
        self.duplicated.lock().contains(&id)
    }

    pub fn duplicated_count(&self) -> u64 {
        self.duplicated.lock().len() as u64
    }

    /// Records this node owns, leaving out known duplicates.
    pub fn owned_count(&self) -> u64 {
        self.record_count().saturating_sub(self.duplicated_count())
    }

    pub fn as_proto(&self) -> proto::Node {
        proto::Node {
            id: self.id,
            name: self.address.clone(),
            info: Some(self.status()),
        }
    }
}

pub(crate) fn transport_error(node: NodeId, status: &Status) -> OrchestratorError {
    OrchestratorError::Transport(format!("node {node}: {}", status.message()))
}

/// In-band outcome carried by node responses.
pub(crate) trait Outcome {
    fn success(&self) -> bool;
    fn message(&self) -> &str;
}

macro_rules! impl_outcome {
    ($($ty:ty),* $(,)?) => {
        $(impl Outcome for $ty {
            fn success(&self) -> bool {
                self.success
            }
            fn message(&self) -> &str {
                &self.msg
            }
        })*
    };
}

impl_outcome!(
    proto::RecordResponse,
    proto::FindResponse,
    proto::OracleResponse,
    proto::CallResponse,
    proto::NodeResponse,
);

/// Collapse a node RPC result: transport failures and in-band refusals both
/// become errors.
pub(crate) fn settle<R: Outcome>(
    node: NodeId,
    result: std::result::Result<Response<R>, Status>,
) -> Result<R> {
    let resp = result.map_err(|status| transport_error(node, &status))?.into_inner();
    if resp.success() {
        Ok(resp)
    } else {
        Err(OrchestratorError::Rejected(resp.message().to_string()))
    }
}

/// The node-side "missing record" answers for `id`.
pub(crate) fn is_not_found(message: &str, id: u64) -> bool {
    message == format!("record {id} not found.") || message == "record not found"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_splits_transport_and_refusal() {
        let ok = settle(1, Ok(Response::new(proto::RecordResponse {
            success: true,
            ..Default::default()
        })));
        assert!(ok.is_ok());

        let refused = settle(1, Ok(Response::new(proto::RecordResponse {
            success: false,
            msg: "record 3 not found.".into(),
            record: None,
        })));
        assert!(matches!(refused, Err(OrchestratorError::Rejected(msg)) if msg == "record 3 not found."));

        let down = settle::<proto::RecordResponse>(2, Err(Status::unavailable("connection refused")));
        assert_eq!(down.unwrap_err().to_string(), "node 2: connection refused");
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("record 7 not found.", 7));
        assert!(is_not_found("record not found", 7));
        assert!(!is_not_found("record 8 not found.", 7));
        assert!(!is_not_found("identifier is not unique", 7));
    }
}
