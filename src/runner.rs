//! Distributed oracle execution.
//!
//! A Run resolves the records the oracle looks up by parameter, embeds them
//! into a patched copy of the source, deploys that copy on every node as a
//! temporary oracle, runs it everywhere with the caller's arguments and
//! merges the per-node results. Temporary oracles are always removed.

use crate::cluster::Cluster;
use crate::codec::{decode_payload, encode_value};
use crate::error::{OrchestratorError, Result};
use crate::node::{settle, Node, NodeId};
use crate::proto;
use crate::router::{describe, fetch_record, ShardMap};
use crate::scatter::{run_on_all, Gather};
use crate::script::{merge_results, OracleDescriptor, Resolution};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tonic::Request;
use tracing::{debug, warn};

/// Temporary oracles created on nodes for one Run.
#[derive(Default)]
struct Deployed(Mutex<Vec<(Arc<Node>, u64)>>);

impl Drop for Deployed {
    // Reached with leftovers only when the Run was abandoned midway.
    fn drop(&mut self) {
        let leftovers = std::mem::take(self.0.get_mut());
        if leftovers.is_empty() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(remove_oracles(leftovers));
        }
    }
}

#[derive(Clone, Default)]
struct EphemeralDeployment {
    deployed: Arc<Deployed>,
}

impl EphemeralDeployment {
    fn track(&self, node: Arc<Node>, oracle_id: u64) {
        self.deployed.0.lock().push((node, oracle_id));
    }

    async fn release(&self) {
        let deployed = std::mem::take(&mut *self.deployed.0.lock());
        remove_oracles(deployed).await;
    }
}

async fn remove_oracles(deployed: Vec<(Arc<Node>, u64)>) {
    for (node, id) in deployed {
        let removed = settle(
            node.id,
            node.data().delete_oracle(Request::new(proto::ById { id })).await,
        );
        if let Err(err) = removed {
            warn!(
                "Unable to delete temporary oracle {id} on node {}: {err}",
                node.id
            );
        }
    }
}

impl Cluster {
    /// Run oracle `oracle_id` on every node and merge the results.
    pub async fn run(&self, oracle_id: u64, args: Vec<String>) -> Result<proto::Data> {
        let oracle = self.oracles.read().await.read(oracle_id)?;

        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let resolved = {
            let map = self.records.read().await;
            resolve_lookups(&oracle, &args, &nodes, &map).await?
        };
        let code = oracle.patch_code(&resolved)?;
        let template = proto::Oracle {
            id: 0,
            name: oracle.name.clone(),
            code,
        };
        debug!(oracle = oracle_id, nodes = nodes.len(), "running oracle");

        let deployment = EphemeralDeployment::default();
        let (mut results, errors) = run_on_all(&nodes, |node: Arc<Node>, gather: Gather<(NodeId, Value)>| {
            let template = template.clone();
            let args = args.clone();
            let deployment = deployment.clone();
            async move {
                match deploy_and_run(&node, template, args, &deployment, &gather).await {
                    Ok(Some(value)) => gather.emit((node.id, value)),
                    Ok(None) => {}
                    Err(err) => {
                        gather.fail(err);
                        gather.cancel_all();
                    }
                }
            }
        })
        .await;
        deployment.release().await;

        if !errors.is_empty() {
            return Err(OrchestratorError::NodeErrors(errors));
        }
        results.sort_by_key(|(node, _)| *node);
        let results = results.into_iter().map(|(_, value)| value).collect();

        let merged = merge_results(&oracle, results, &self.pool).await?;
        Ok(encode_value(&merged)?)
    }
}

/// Resolve every record-lookup argument, aligned with the entry function's
/// parameters. A record nobody holds becomes [`Resolution::Missing`].
async fn resolve_lookups(
    oracle: &OracleDescriptor,
    args: &[String],
    nodes: &[Arc<Node>],
    map: &ShardMap,
) -> Result<Vec<Option<Resolution>>> {
    let mut resolved = vec![None; oracle.parameters().len()];
    for (position, arg) in args.iter().enumerate().take(resolved.len()) {
        if !oracle.is_lookup(position) {
            continue;
        }
        let id: u64 = arg.trim().parse().map_err(|e| {
            OrchestratorError::InvalidArgument(format!(
                "Unable to parse record id from parameter #{position}: {e}"
            ))
        })?;
        resolved[position] = Some(match fetch_record(nodes, map, id).await {
            Ok(record) => Resolution::Found(record),
            Err(OrchestratorError::RecordNotFound(_)) => Resolution::Missing,
            Err(err) => {
                return Err(OrchestratorError::Rejected(format!(
                    "Unable to retrieve record {id}: {err}"
                )))
            }
        });
    }
    Ok(resolved)
}

/// Create the temporary oracle on `node` and run it. `Ok(None)` means a
/// sibling failed and the run was abandoned.
async fn deploy_and_run(
    node: &Arc<Node>,
    template: proto::Oracle,
    args: Vec<String>,
    deployment: &EphemeralDeployment,
    gather: &Gather<(NodeId, Value)>,
) -> std::result::Result<Option<Value>, String> {
    if gather.cancelled() {
        return Ok(None);
    }
    let created = settle(node.id, node.data().create_oracle(Request::new(template)).await)
        .map_err(|e| describe(node.id, &e))?;
    let oracle_id: u64 = created.msg.parse().map_err(|e| {
        format!(
            "node {}: unable to parse oracleId string '{}': {e}",
            node.id, created.msg
        )
    })?;
    deployment.track(node.clone(), oracle_id);

    let call = proto::Call { oracle_id, args };
    let Some(outcome) = gather
        .unless_cancelled(async { settle(node.id, node.data().run(Request::new(call)).await) })
        .await
    else {
        return Ok(None);
    };
    let resp = outcome.map_err(|e| describe(node.id, &e))?;
    let data = resp.data.unwrap_or_default();
    decode_payload(&data)
        .map(Some)
        .map_err(|e| format!("node {}: {e}", node.id))
}
