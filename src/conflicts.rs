//! Record id conflicts between nodes.
//!
//! Nodes that were populated before joining the cluster may hold records
//! under the same id. Identical copies are deduplicated; copies whose
//! content differs keep the id on one node and get a fresh id everywhere
//! else.

use crate::cluster::{find_node, Cluster};
use crate::codec::structural_hash;
use crate::error::{OrchestratorError, Result};
use crate::node::{settle, Node, NodeId};
use crate::proto;
use crate::scatter::{run_on_all, Gather};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tonic::Request;
use tracing::info;

/// Ids held by more than one node, with their holders in node order.
pub fn contended_ids(held: &[(NodeId, Vec<u64>)]) -> BTreeMap<u64, Vec<NodeId>> {
    let mut contenders: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
    for (node, ids) in held {
        for id in ids {
            contenders.entry(*id).or_default().push(*node);
        }
    }
    contenders.retain(|_, holders| holders.len() > 1);
    contenders
}

/// Group holders by content hash. Groups and their members keep first-seen
/// order.
pub fn group_by_hash<K>(fetched: Vec<(K, String)>) -> Vec<Vec<K>> {
    let mut groups: Vec<(String, Vec<K>)> = Vec::new();
    for (holder, hash) in fetched {
        match groups.iter_mut().find(|(seen, _)| *seen == hash) {
            Some((_, members)) => members.push(holder),
            None => groups.push((hash, vec![holder])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

fn summarize(mut failures: Vec<String>, single: &str, multiple: &str) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(OrchestratorError::Conflict(format!("{single}: {}", failures.remove(0)))),
        _ => Err(OrchestratorError::Conflict(format!("{multiple}: [{}]", failures.join(", ")))),
    }
}

impl Cluster {
    /// Settle every contended id across `nodes`. Failures on one id do not
    /// stop the others; they are reported together at the end. Returns the
    /// number of contended ids found.
    pub(crate) async fn resolve_conflicts(&self, nodes: &[Arc<Node>]) -> Result<usize> {
        if nodes.len() < 2 {
            return Ok(0);
        }
        let held: Vec<(NodeId, Vec<u64>)> = nodes.iter().map(|n| (n.id, n.record_ids())).collect();
        let contended = contended_ids(&held);
        if contended.is_empty() {
            return Ok(0);
        }
        info!(records = contended.len(), "solving record id conflicts");

        let mut failures = Vec::new();
        for (id, holders) in &contended {
            let contenders: Vec<Arc<Node>> = holders
                .iter()
                .filter_map(|holder| find_node(nodes, *holder).cloned())
                .collect();
            if let Err(err) = self.settle_conflict(*id, &contenders, nodes).await {
                failures.push(err.to_string());
            }
        }

        summarize(
            failures,
            "error in solving conflict",
            "multiple errors in solving conflicts",
        )?;
        Ok(contended.len())
    }

    async fn settle_conflict(&self, id: u64, contenders: &[Arc<Node>], nodes: &[Arc<Node>]) -> Result<()> {
        let (mut fetched, errors) = run_on_all(contenders, move |node: Arc<Node>, gather: Gather<(NodeId, proto::Record)>| async move {
            match settle(node.id, node.data().read_record(Request::new(proto::ById { id })).await) {
                Ok(resp) => gather.emit((node.id, resp.record.unwrap_or_default())),
                Err(err) => gather.fail(format!("Cannot retrieve record {id} from node {}: {err}", node.id)),
            }
        })
        .await;
        if !errors.is_empty() {
            return Err(OrchestratorError::Conflict(format!(
                "unable to fetch records from other nodes: [{}]",
                errors.join(", ")
            )));
        }
        fetched.sort_by_key(|(holder, _)| *holder);

        let groups = group_by_hash(
            fetched
                .iter()
                .map(|(holder, record)| (*holder, structural_hash(record)))
                .collect(),
        );
        let records: HashMap<NodeId, proto::Record> = fetched.into_iter().collect();

        let mut failures = Vec::new();
        for (index, group) in groups.iter().enumerate() {
            let Some((keeper, duplicates)) = group.split_first() else {
                continue;
            };
            if let Err(err) = delete_copies(id, duplicates, nodes).await {
                failures.push(err);
                continue;
            }
            // The first group keeps the id.
            if index == 0 {
                continue;
            }
            let (Some(node), Some(record)) = (find_node(nodes, *keeper), records.get(keeper)) else {
                continue;
            };
            if let Err(err) = self.renumber(id, record, node, nodes).await {
                failures.push(err);
            }
        }

        summarize(
            failures,
            "error during conflict resolution",
            "multiple errors during conflict resolution",
        )
    }

    /// Move the record stored under `old` on `node` to a fresh id.
    async fn renumber(
        &self,
        old: u64,
        record: &proto::Record,
        node: &Arc<Node>,
        nodes: &[Arc<Node>],
    ) -> std::result::Result<u64, String> {
        let fresh = self.fresh_record_id(nodes);
        let _busy = node.lock().await;

        let moved = proto::Record {
            id: fresh,
            ..record.clone()
        };
        settle(node.id, node.internal().create_record_with_id(Request::new(moved)).await)
            .map_err(|e| format!("unable to create record {fresh} on node {}: {e}", node.id))?;
        node.note_created(&[fresh]);

        settle(node.id, node.data().delete_record(Request::new(proto::ById { id: old })).await)
            .map_err(|e| format!("unable to delete record {old} on node {}: {e}", node.id))?;
        node.note_deleted(&[old]);

        info!(from = old, to = fresh, node = node.id, "record id changed");
        Ok(fresh)
    }

    fn fresh_record_id(&self, nodes: &[Arc<Node>]) -> u64 {
        loop {
            let id = self.counters.records.allocate();
            if !nodes.iter().any(|n| n.holds(id)) {
                return id;
            }
        }
    }
}

async fn delete_copies(id: u64, holders: &[NodeId], nodes: &[Arc<Node>]) -> std::result::Result<(), String> {
    for holder in holders {
        let Some(node) = find_node(nodes, *holder) else {
            continue;
        };
        let _busy = node.lock().await;
        settle(node.id, node.data().delete_record(Request::new(proto::ById { id })).await)
            .map_err(|e| format!("unable to delete record {id} on node {}: {e}", node.id))?;
        node.note_deleted(&[id]);
    }
    Ok(())
}
