//! # gRPC front end
//!
//! `OrchestratorService` serves the data plane, the privileged plane and
//! cluster management on top of a shared [`Cluster`]. Cluster errors are
//! returned in-band (`success = false`, `msg`); gRPC status codes are left
//! to the transport.

use crate::cluster::Cluster;
use crate::error::OrchestratorError;
use crate::proto;
use crate::proto::sum_internal_service_server::{SumInternalService, SumInternalServiceServer};
use crate::proto::sum_master_service_server::{SumMasterService, SumMasterServiceServer};
use crate::proto::sum_service_server::{SumService, SumServiceServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct OrchestratorService {
    cluster: Arc<Cluster>,
    max_message_size: usize,
}

impl OrchestratorService {
    pub fn new(cluster: Arc<Cluster>, max_message_size: usize) -> Self {
        Self {
            cluster,
            max_message_size,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn data_server(&self) -> SumServiceServer<Self> {
        SumServiceServer::new(self.clone())
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size)
    }

    pub fn internal_server(&self) -> SumInternalServiceServer<Self> {
        SumInternalServiceServer::new(self.clone())
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size)
    }

    pub fn master_server(&self) -> SumMasterServiceServer<Self> {
        SumMasterServiceServer::new(self.clone())
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size)
    }
}

/// Poll every node's status once per `period`, balancing after each round.
pub fn spawn_status_poller(cluster: Arc<Cluster>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; bootstrap has just polled.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("polling node status");
            cluster.poll_nodes().await;
        }
    })
}

fn record_response(outcome: Result<String, OrchestratorError>) -> Response<proto::RecordResponse> {
    Response::new(match outcome {
        Ok(msg) => proto::RecordResponse {
            success: true,
            msg,
            record: None,
        },
        Err(err) => proto::RecordResponse {
            success: false,
            msg: err.to_string(),
            record: None,
        },
    })
}

fn oracle_response(outcome: Result<(String, Vec<proto::Oracle>), OrchestratorError>) -> Response<proto::OracleResponse> {
    Response::new(match outcome {
        Ok((msg, oracles)) => proto::OracleResponse {
            success: true,
            msg,
            oracles,
        },
        Err(err) => proto::OracleResponse {
            success: false,
            msg: err.to_string(),
            oracles: Vec::new(),
        },
    })
}

fn node_response(outcome: Result<(String, Vec<proto::Node>), OrchestratorError>) -> Response<proto::NodeResponse> {
    Response::new(match outcome {
        Ok((msg, nodes)) => proto::NodeResponse {
            success: true,
            msg,
            nodes,
        },
        Err(err) => proto::NodeResponse {
            success: false,
            msg: err.to_string(),
            nodes: Vec::new(),
        },
    })
}

#[tonic::async_trait]
impl SumService for OrchestratorService {
    async fn create_record(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.create_record(request.into_inner()).await;
        Ok(record_response(outcome.map(|id| id.to_string())))
    }

    async fn create_records(&self, request: Request<proto::Records>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.create_records(request.into_inner().records).await;
        Ok(record_response(outcome.map(|ids| {
            ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
        })))
    }

    async fn update_record(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.update_record(request.into_inner()).await;
        Ok(record_response(outcome.map(|_| String::new())))
    }

    async fn read_record(&self, request: Request<proto::ById>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.read_record(request.into_inner().id).await;
        Ok(Response::new(match outcome {
            Ok(record) => proto::RecordResponse {
                success: true,
                msg: String::new(),
                record: Some(record),
            },
            Err(err) => proto::RecordResponse {
                success: false,
                msg: err.to_string(),
                record: None,
            },
        }))
    }

    async fn list_records(&self, request: Request<proto::ListRequest>) -> Result<Response<proto::RecordListResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.cluster.list_records(request.page, request.per_page).await))
    }

    async fn delete_record(&self, request: Request<proto::ById>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.delete_record(request.into_inner().id).await;
        Ok(record_response(outcome.map(|_| String::new())))
    }

    async fn find_records(&self, request: Request<proto::ByMeta>) -> Result<Response<proto::FindResponse>, Status> {
        let query = request.into_inner();
        let outcome = self.cluster.find_records(&query.meta, &query.value).await;
        Ok(Response::new(match outcome {
            Ok(records) => proto::FindResponse {
                success: true,
                msg: String::new(),
                records,
            },
            Err(err) => proto::FindResponse {
                success: false,
                msg: err.to_string(),
                records: Vec::new(),
            },
        }))
    }

    async fn create_oracle(&self, request: Request<proto::Oracle>) -> Result<Response<proto::OracleResponse>, Status> {
        let oracle = request.into_inner();
        let outcome = self.cluster.create_oracle(&oracle.name, &oracle.code).await;
        Ok(oracle_response(outcome.map(|id| (id.to_string(), Vec::new()))))
    }

    async fn update_oracle(&self, request: Request<proto::Oracle>) -> Result<Response<proto::OracleResponse>, Status> {
        let outcome = self.cluster.update_oracle(&request.into_inner()).await;
        Ok(oracle_response(outcome.map(|_| (String::new(), Vec::new()))))
    }

    async fn read_oracle(&self, request: Request<proto::ById>) -> Result<Response<proto::OracleResponse>, Status> {
        let outcome = self.cluster.read_oracle(request.into_inner().id).await;
        Ok(oracle_response(outcome.map(|oracle| (String::new(), vec![oracle]))))
    }

    async fn find_oracle(&self, request: Request<proto::ByName>) -> Result<Response<proto::OracleResponse>, Status> {
        let outcome = self.cluster.find_oracle(&request.into_inner().name).await;
        Ok(oracle_response(outcome.map(|oracle| (String::new(), vec![oracle]))))
    }

    async fn list_oracles(&self, request: Request<proto::ListRequest>) -> Result<Response<proto::OracleListResponse>, Status> {
        let request = request.into_inner();
        Ok(Response::new(self.cluster.list_oracles(request.page, request.per_page).await))
    }

    async fn delete_oracle(&self, request: Request<proto::ById>) -> Result<Response<proto::OracleResponse>, Status> {
        let outcome = self.cluster.delete_oracle(request.into_inner().id).await;
        Ok(oracle_response(outcome.map(|_| (String::new(), Vec::new()))))
    }

    async fn run(&self, request: Request<proto::Call>) -> Result<Response<proto::CallResponse>, Status> {
        let call = request.into_inner();
        let outcome = self.cluster.run(call.oracle_id, call.args).await;
        Ok(Response::new(match outcome {
            Ok(data) => proto::CallResponse {
                success: true,
                msg: String::new(),
                data: Some(data),
            },
            Err(err) => {
                warn!(oracle = call.oracle_id, error = %err, "run failed");
                proto::CallResponse {
                    success: false,
                    msg: err.to_string(),
                    data: None,
                }
            }
        }))
    }

    async fn info(&self, _request: Request<proto::Empty>) -> Result<Response<proto::ServerInfo>, Status> {
        Ok(Response::new(self.cluster.info().await))
    }
}

#[tonic::async_trait]
impl SumInternalService for OrchestratorService {
    async fn create_record_with_id(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let record = request.into_inner();
        let id = record.id;
        let outcome = self.cluster.create_record_with_id(record).await;
        Ok(record_response(outcome.map(|_| id.to_string())))
    }

    async fn create_records_with_id(&self, request: Request<proto::Records>) -> Result<Response<proto::RecordResponse>, Status> {
        let outcome = self.cluster.create_records_with_id(request.into_inner().records).await;
        Ok(record_response(outcome.map(|_| String::new())))
    }

    async fn delete_records(&self, request: Request<proto::RecordIds>) -> Result<Response<proto::RecordResponse>, Status> {
        let ids = request.into_inner().ids;
        Ok(Response::new(match self.cluster.delete_records(&ids).await {
            // Partial deletes still report the count.
            Ok(deleted) => proto::RecordResponse {
                success: deleted == ids.len() as u64,
                msg: deleted.to_string(),
                record: None,
            },
            Err(err) => proto::RecordResponse {
                success: false,
                msg: err.to_string(),
                record: None,
            },
        }))
    }
}

#[tonic::async_trait]
impl SumMasterService for OrchestratorService {
    async fn add_node(&self, request: Request<proto::ByAddr>) -> Result<Response<proto::NodeResponse>, Status> {
        let addr = request.into_inner();
        let outcome = self.cluster.add_node(&addr.address, &addr.cert_file).await;
        Ok(node_response(outcome.map(|id| (id.to_string(), Vec::new()))))
    }

    async fn list_nodes(&self, _request: Request<proto::Empty>) -> Result<Response<proto::NodeResponse>, Status> {
        Ok(node_response(Ok((String::new(), self.cluster.list_nodes().await))))
    }

    async fn delete_node(&self, request: Request<proto::ById>) -> Result<Response<proto::NodeResponse>, Status> {
        let outcome = self.cluster.delete_node(request.into_inner().id).await;
        Ok(node_response(outcome.map(|_| (String::new(), Vec::new()))))
    }
}
