use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use sum_rs::cluster::ClusterOptions;
use sum_rs::config::NodeEntry;
use sum_rs::proto::{self, sum_service_client::SumServiceClient};
use sum_rs::service::OrchestratorService;
use sum_rs::test_support::MemoryNode;
use sum_rs::Cluster;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};

#[allow(dead_code)]
pub fn record(id: u64, data: Vec<f32>) -> proto::Record {
    proto::Record {
        id,
        data,
        meta: BTreeMap::new(),
    }
}

#[allow(dead_code)]
pub fn tagged(id: u64, data: Vec<f32>, meta: &[(&str, &str)]) -> proto::Record {
    proto::Record {
        id,
        data,
        meta: meta
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Records with ids `first..first + count`, data `[id]`.
#[allow(dead_code)]
pub fn numbered(first: u64, count: u64) -> Vec<proto::Record> {
    (first..first + count)
        .map(|id| record(id, vec![id as f32]))
        .collect()
}

/// Memory nodes serving on loopback, in the order given.
pub struct TestNodes {
    pub nodes: Vec<MemoryNode>,
    pub addrs: Vec<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
}

impl TestNodes {
    pub async fn spawn(nodes: Vec<MemoryNode>) -> anyhow::Result<Self> {
        let mut addrs = Vec::with_capacity(nodes.len());
        let mut handles = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let (addr, handle) = node.spawn().await?;
            addrs.push(addr);
            handles.push(handle);
        }
        Ok(Self {
            nodes,
            addrs,
            handles,
        })
    }

    pub fn entries(&self) -> Vec<NodeEntry> {
        self.addrs
            .iter()
            .map(|addr| NodeEntry::new(addr.to_string()))
            .collect()
    }
}

impl Drop for TestNodes {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[allow(dead_code)]
pub async fn bootstrap(nodes: &TestNodes) -> anyhow::Result<Arc<Cluster>> {
    bootstrap_with(nodes, ClusterOptions::default()).await
}

#[allow(dead_code)]
pub async fn bootstrap_with(nodes: &TestNodes, options: ClusterOptions) -> anyhow::Result<Arc<Cluster>> {
    let options = ClusterOptions {
        interpreter_pool_size: 2,
        ..options
    };
    Ok(Arc::new(Cluster::bootstrap(nodes.entries(), options).await?))
}

/// Serve `cluster` on loopback.
#[allow(dead_code)]
pub async fn spawn_orchestrator(cluster: Arc<Cluster>) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let service = OrchestratorService::new(cluster, 4 * 1024 * 1024);
    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(service.data_server())
            .add_service(service.internal_server())
            .add_service(service.master_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("orchestrator server");
    });
    Ok((addr, handle))
}

#[allow(dead_code)]
pub async fn data_client(addr: SocketAddr) -> anyhow::Result<SumServiceClient<Channel>> {
    Ok(SumServiceClient::connect(format!("http://{}", addr)).await?)
}
