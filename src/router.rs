//! Record routing.
//!
//! The [`ShardMap`] knows which node owns every record id the orchestrator
//! has seen. Requests for mapped ids go straight to the owner; requests for
//! ids the map does not know are broadcast, first positive answer wins.

use crate::cluster::{find_node, least_loaded, Cluster};
use crate::error::{OrchestratorError, Result};
use crate::node::{is_not_found, settle, transport_error, Node, NodeId};
use crate::proto;
use crate::scatter::{run_on_all, Gather};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tonic::Request;
use tracing::{debug, error, warn};

/// Global record id to owning node.
#[derive(Debug, Default, Clone)]
pub struct ShardMap {
    owners: HashMap<u64, NodeId>,
}

impl ShardMap {
    /// Rebuild from the nodes' known id sets. When two nodes claim an id the
    /// first one in node order keeps it.
    pub fn rebuild(nodes: &[Arc<Node>]) -> Self {
        let mut owners = HashMap::new();
        for node in nodes {
            for id in node.record_ids() {
                owners.entry(id).or_insert(node.id);
            }
        }
        Self { owners }
    }

    pub fn owner(&self, id: u64) -> Option<NodeId> {
        self.owners.get(&id).copied()
    }

    pub fn assign(&mut self, id: u64, node: NodeId) {
        self.owners.insert(id, node);
    }

    pub fn assign_many(&mut self, ids: impl IntoIterator<Item = u64>, node: NodeId) {
        for id in ids {
            self.owners.insert(id, node);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<NodeId> {
        self.owners.remove(&id)
    }

    /// Forget every id owned by `node`.
    pub fn purge_node(&mut self, node: NodeId) {
        self.owners.retain(|_, owner| *owner != node);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<u64, NodeId> {
        self.owners.iter().map(|(id, node)| (*id, *node)).collect()
    }
}

/// One node-local page request serving part of a global page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlice {
    pub node: NodeId,
    pub page: u64,
    pub per_page: u64,
    /// Leading records of the local page that belong to the previous window.
    pub skip: u64,
}

/// Translate global page `page` of size `per_page` into node-local page
/// requests. `counts` lists every node with its record count, in node order.
pub fn page_slices(counts: &[(NodeId, u64)], page: u64, per_page: u64) -> Vec<PageSlice> {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let window_start = (page - 1).saturating_mul(per_page);
    let window_end = window_start.saturating_add(per_page);

    let mut slices = Vec::new();
    let mut base = 0u64;
    for &(node, count) in counts {
        let lo = window_start.max(base);
        let hi = window_end.min(base + count);
        if lo < hi {
            let offset = lo - base;
            let take = hi - lo;
            slices.push(if offset == 0 {
                PageSlice { node, page: 1, per_page: take, skip: 0 }
            } else if offset % take == 0 {
                PageSlice { node, page: offset / take + 1, per_page: take, skip: 0 }
            } else {
                PageSlice { node, page: 1, per_page: offset + take, skip: offset }
            });
        }
        base += count;
        if base >= window_end {
            break;
        }
    }
    slices
}

/// A node failure as it appears in aggregated error lists.
pub(crate) fn describe(node: NodeId, err: &OrchestratorError) -> String {
    match err {
        OrchestratorError::Transport(msg) => msg.clone(),
        other => format!("node {node}: {other}"),
    }
}

fn is_not_indexed(message: &str) -> bool {
    message.starts_with("meta ") && message.ends_with(" not indexed.")
}

/// Ask every node, keep the first positive answer and cancel the rest.
/// Missing-record answers are not errors: if nothing else went wrong the
/// outcome is `RecordNotFound`.
async fn broadcast<R, F, Fut>(nodes: &[Arc<Node>], id: u64, call: F) -> Result<(NodeId, R)>
where
    R: Send + 'static,
    F: Fn(Arc<Node>) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let (results, errors) = run_on_all(nodes, |node: Arc<Node>, gather: Gather<(NodeId, R)>| {
        let pending = call(node.clone());
        async move {
            match gather.unless_cancelled(pending).await {
                Some(Ok(resp)) => {
                    gather.emit((node.id, resp));
                    gather.cancel_all();
                }
                Some(Err(OrchestratorError::Rejected(msg))) if is_not_found(&msg, id) => {}
                Some(Err(err)) => gather.fail(describe(node.id, &err)),
                None => {}
            }
        }
    })
    .await;

    if results.len() > 1 {
        warn!(id, answers = results.len(), "got more than one answer when only one was expected");
    }
    match results.into_iter().next() {
        Some(found) => Ok(found),
        None if errors.is_empty() => Err(OrchestratorError::RecordNotFound(id)),
        None => Err(OrchestratorError::Unsatisfied(errors)),
    }
}

/// Read record `id` from its owner, or from whoever has it when the map
/// does not know the id. Callers hold the node list and the shard map.
pub(crate) async fn fetch_record(nodes: &[Arc<Node>], map: &ShardMap, id: u64) -> Result<proto::Record> {
    let resp = match map.owner(id).and_then(|owner| find_node(nodes, owner)) {
        Some(node) => {
            match settle(node.id, node.data().read_record(Request::new(proto::ById { id })).await) {
                Err(OrchestratorError::Rejected(msg)) if is_not_found(&msg, id) => {
                    return Err(OrchestratorError::RecordNotFound(id));
                }
                other => other?,
            }
        }
        None => {
            broadcast(nodes, id, move |node| async move {
                settle(node.id, node.data().read_record(Request::new(proto::ById { id })).await)
            })
            .await?
            .1
        }
    };
    resp.record.ok_or(OrchestratorError::RecordNotFound(id))
}

impl Cluster {
    /// Store a new record on the least loaded node under a fresh id.
    pub async fn create_record(&self, record: proto::Record) -> Result<u64> {
        let nodes = self.nodes.read().await;
        let mut map = self.records.write().await;
        let node = least_loaded(&nodes).ok_or(OrchestratorError::NoNodes)?.clone();

        let _busy = node.lock().await;
        let id = self.counters.records.allocate();
        let record = proto::Record { id, ..record };
        settle(node.id, node.internal().create_record_with_id(Request::new(record)).await)?;

        node.note_created(&[id]);
        map.assign(id, node.id);
        Ok(id)
    }

    /// Store a batch on the least loaded node under contiguous fresh ids,
    /// then rebalance.
    pub async fn create_records(&self, records: Vec<proto::Record>) -> Result<Vec<u64>> {
        let nodes = self.nodes.read().await;
        let mut map = self.records.write().await;
        let node = least_loaded(&nodes).ok_or(OrchestratorError::NoNodes)?.clone();

        let ids: Vec<u64> = self.counters.records.allocate_many(records.len() as u64).collect();
        let records: Vec<proto::Record> = records
            .into_iter()
            .zip(&ids)
            .map(|(record, &id)| proto::Record { id, ..record })
            .collect();

        {
            let _busy = node.lock().await;
            settle(
                node.id,
                node.internal()
                    .create_records_with_id(Request::new(proto::Records { records }))
                    .await,
            )?;
            node.note_created(&ids);
            map.assign_many(ids.iter().copied(), node.id);
        }

        self.balance_locked(&nodes, &mut map).await;
        Ok(ids)
    }

    pub async fn read_record(&self, id: u64) -> Result<proto::Record> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let map = self.records.read().await;
        fetch_record(&nodes, &map, id).await
    }

    pub async fn update_record(&self, record: proto::Record) -> Result<()> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let map = self.records.read().await;
        let id = record.id;

        match map.owner(id).and_then(|owner| find_node(&nodes, owner)) {
            Some(node) => {
                let _busy = node.lock().await;
                settle(node.id, node.data().update_record(Request::new(record)).await)?;
            }
            None => {
                broadcast(&nodes, id, move |node| {
                    let record = record.clone();
                    async move { settle(node.id, node.data().update_record(Request::new(record)).await) }
                })
                .await?;
            }
        }
        Ok(())
    }

    pub async fn delete_record(&self, id: u64) -> Result<()> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let mut map = self.records.write().await;

        let holder = match map.owner(id).and_then(|owner| find_node(&nodes, owner)) {
            Some(node) => {
                let _busy = node.lock().await;
                settle(
                    node.id,
                    node.data().delete_record(Request::new(proto::ById { id })).await,
                )?;
                node.id
            }
            None => {
                broadcast(&nodes, id, move |node| async move {
                    let _busy = node.lock().await;
                    settle(node.id, node.data().delete_record(Request::new(proto::ById { id })).await)
                })
                .await?
                .0
            }
        };

        if let Some(node) = find_node(&nodes, holder) {
            node.note_deleted(&[id]);
        }
        map.remove(id);
        Ok(())
    }

    /// Records whose metadata `meta` equals `value`, from every node.
    pub async fn find_records(&self, meta: &str, value: &str) -> Result<Vec<proto::Record>> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let query = proto::ByMeta {
            meta: meta.to_string(),
            value: value.to_string(),
        };

        let (mut found, errors) = run_on_all(&nodes, |node: Arc<Node>, gather: Gather<(NodeId, Vec<proto::Record>)>| {
            let query = query.clone();
            async move {
                match settle(node.id, node.data().find_records(Request::new(query)).await) {
                    Ok(resp) => gather.emit((node.id, resp.records)),
                    // A node where no record carries the key.
                    Err(OrchestratorError::Rejected(msg)) if is_not_indexed(&msg) => {}
                    Err(err) => gather.fail(describe(node.id, &err)),
                }
            }
        })
        .await;

        if !errors.is_empty() {
            return Err(OrchestratorError::NodeErrors(errors));
        }
        found.sort_by_key(|(node, _)| *node);
        Ok(found.into_iter().flat_map(|(_, records)| records).collect())
    }

    /// One global page of records, ordered by node then by local id.
    /// Unreachable nodes leave a hole in the page and are only logged.
    pub async fn list_records(&self, page: u64, per_page: u64) -> proto::RecordListResponse {
        let page = page.max(1);
        let per_page = per_page.max(1);

        let nodes = self.nodes.read().await;
        let _map = self.records.read().await;

        let mut counts: Vec<(NodeId, u64)> = nodes.iter().map(|n| (n.id, n.record_count())).collect();
        counts.sort_by_key(|(id, _)| *id);
        let total: u64 = counts.iter().map(|(_, count)| count).sum();
        let pages = total.div_ceil(per_page);

        let work: Vec<(usize, PageSlice, Arc<Node>)> = page_slices(&counts, page, per_page)
            .into_iter()
            .enumerate()
            .filter_map(|(index, slice)| {
                find_node(&nodes, slice.node).map(|node| (index, slice, node.clone()))
            })
            .collect();

        let (mut parts, errors) = run_on_all(
            &work,
            |(index, slice, node): (usize, PageSlice, Arc<Node>), gather: Gather<(usize, Vec<proto::Record>)>| async move {
                let request = proto::ListRequest {
                    page: slice.page,
                    per_page: slice.per_page,
                };
                match node.data().list_records(Request::new(request)).await {
                    Ok(resp) => {
                        let records = resp
                            .into_inner()
                            .records
                            .into_iter()
                            .skip(slice.skip as usize)
                            .collect();
                        gather.emit((index, records));
                    }
                    Err(status) => gather.fail(transport_error(node.id, &status).to_string()),
                }
            },
        )
        .await;

        if !errors.is_empty() {
            warn!(errors = %errors.join(", "), "unable to communicate with nodes");
        }
        parts.sort_by_key(|(index, _)| *index);

        proto::RecordListResponse {
            total,
            pages,
            records: parts.into_iter().flat_map(|(_, records)| records).collect(),
        }
    }

    /// Store a record under a caller-chosen id.
    pub async fn create_record_with_id(&self, record: proto::Record) -> Result<()> {
        let nodes = self.nodes.read().await;
        let mut map = self.records.write().await;
        let node = least_loaded(&nodes).ok_or(OrchestratorError::NoNodes)?.clone();

        let id = record.id;
        if map.owner(id).is_some() || nodes.iter().any(|n| n.holds(id)) {
            return Err(OrchestratorError::RecordExists(id));
        }

        let _busy = node.lock().await;
        settle(node.id, node.internal().create_record_with_id(Request::new(record)).await)?;
        node.note_created(&[id]);
        map.assign(id, node.id);
        self.counters.records.bump_floor(id);
        Ok(())
    }

    /// Store records under caller-chosen ids, spread evenly over the nodes.
    /// Slices a node refused are retried on the last node that accepted one;
    /// if that fails too every id of the batch is deleted again.
    pub async fn create_records_with_id(&self, records: Vec<proto::Record>) -> Result<()> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        if records.is_empty() {
            return Ok(());
        }
        let mut map = self.records.write().await;

        let per_node = records.len() / nodes.len();
        let remainder = records.len() % nodes.len();

        let mut start = 0;
        let mut end = 0;
        let mut accepted: Option<Arc<Node>> = None;
        let mut last_error: Option<OrchestratorError> = None;

        for (index, node) in nodes.iter().enumerate() {
            end += per_node + usize::from(index < remainder);
            match self.store_slice(node, &records[start..end], &mut map).await {
                Ok(()) => {
                    accepted = Some(node.clone());
                    start = end;
                }
                Err(err) => {
                    error!(node = node.id, error = %err, "unable to create records on node");
                    last_error = Some(err);
                }
            }
        }

        let Some(fallback) = accepted else {
            let last = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(OrchestratorError::Rejected(format!(
                "Cannot create records on nodes: last error = {last}"
            )));
        };

        if start != end {
            if let Err(err) = self.store_slice(&fallback, &records[start..end], &mut map).await {
                let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
                if let Err(rollback) = self.delete_ids(&nodes, &ids, &mut map).await {
                    warn!(error = %rollback, "rollback of partially created records failed");
                }
                return Err(OrchestratorError::Rejected(format!(
                    "Unable to create records on fallback node {}: {err}",
                    fallback.id
                )));
            }
        }

        self.balance_locked(&nodes, &mut map).await;
        Ok(())
    }

    async fn store_slice(&self, node: &Arc<Node>, slice: &[proto::Record], map: &mut ShardMap) -> Result<()> {
        if slice.is_empty() {
            return Ok(());
        }
        debug!(node = node.id, records = slice.len(), "creating records on node");
        let _busy = node.lock().await;
        let records = slice.to_vec();
        settle(
            node.id,
            node.internal()
                .create_records_with_id(Request::new(proto::Records { records }))
                .await,
        )?;

        let ids: Vec<u64> = slice.iter().map(|r| r.id).collect();
        node.note_created(&ids);
        map.assign_many(ids.iter().copied(), node.id);
        if let Some(max) = ids.iter().max() {
            self.counters.records.bump_floor(*max);
        }
        Ok(())
    }

    /// Delete `ids` wherever they live, then rebalance. Returns how many
    /// records the nodes actually dropped.
    pub async fn delete_records(&self, ids: &[u64]) -> Result<u64> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(OrchestratorError::NoNodes);
        }
        let mut map = self.records.write().await;
        let outcome = self.delete_ids(&nodes, ids, &mut map).await;
        self.balance_locked(&nodes, &mut map).await;
        outcome
    }

    pub(crate) async fn delete_ids(&self, nodes: &[Arc<Node>], ids: &[u64], map: &mut ShardMap) -> Result<u64> {
        let request = proto::RecordIds { ids: ids.to_vec() };
        let (deleted, errors) = run_on_all(nodes, |node: Arc<Node>, gather: Gather<(NodeId, u64)>| {
            let request = request.clone();
            async move {
                let _busy = node.lock().await;
                let resp = match node.internal().delete_records(Request::new(request)).await {
                    Ok(resp) => resp.into_inner(),
                    Err(status) => {
                        gather.fail(format!("communication error with node {}: {}", node.address, status.message()));
                        return;
                    }
                };
                match resp.msg.parse::<u64>() {
                    Ok(0) => {}
                    Ok(count) => gather.emit((node.id, count)),
                    Err(err) => gather.fail(format!(
                        "unable to parse node '{}' response '{}' as uint: {err}",
                        node.address, resp.msg
                    )),
                }
            }
        })
        .await;

        for &(holder, _) in &deleted {
            if let Some(node) = find_node(nodes, holder) {
                node.note_deleted(ids);
            }
        }
        for id in ids {
            if map.owner(*id).is_some_and(|owner| deleted.iter().any(|(n, _)| *n == owner)) {
                map.remove(*id);
            }
        }

        if !errors.is_empty() {
            return Err(OrchestratorError::Rejected(format!(
                "errors from nodes: [{}]",
                errors.join(", ")
            )));
        }
        Ok(deleted.iter().map(|(_, count)| count).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(node: NodeId, page: u64, per_page: u64, skip: u64) -> PageSlice {
        PageSlice { node, page, per_page, skip }
    }

    #[test]
    fn first_page_inside_first_node() {
        let slices = page_slices(&[(1, 10), (2, 10)], 1, 5);
        assert_eq!(slices, vec![slice(1, 1, 5, 0)]);
    }

    #[test]
    fn aligned_window_uses_native_paging() {
        let slices = page_slices(&[(1, 10), (2, 10)], 2, 5);
        assert_eq!(slices, vec![slice(1, 2, 5, 0)]);
    }

    #[test]
    fn window_spanning_two_nodes() {
        // Global records 8..12: the last two of node 1, the first two of node 2.
        let slices = page_slices(&[(1, 10), (2, 10)], 3, 4);
        assert_eq!(slices, vec![slice(1, 5, 2, 0), slice(2, 1, 2, 0)]);
    }

    #[test]
    fn unaligned_offset_fetches_and_skips() {
        // Global records 3..6: node 1 holds 3 and 4, node 2 holds 5.
        let slices = page_slices(&[(1, 5), (2, 10)], 2, 3);
        assert_eq!(slices, vec![slice(1, 1, 5, 3), slice(2, 1, 1, 0)]);
    }

    #[test]
    fn empty_nodes_are_skipped() {
        let slices = page_slices(&[(1, 0), (2, 3), (3, 3)], 1, 4);
        assert_eq!(slices, vec![slice(2, 1, 3, 0), slice(3, 1, 1, 0)]);
    }

    #[test]
    fn window_past_the_end_is_empty() {
        assert!(page_slices(&[(1, 3)], 5, 10).is_empty());
        assert!(page_slices(&[], 1, 10).is_empty());
    }

    #[test]
    fn degenerate_paging_is_clamped() {
        assert_eq!(page_slices(&[(1, 3)], 0, 0), vec![slice(1, 1, 1, 0)]);
    }

    #[test]
    fn shard_map_purges_a_node() {
        let mut map = ShardMap::default();
        map.assign_many([1, 2, 3], 1);
        map.assign(4, 2);
        map.purge_node(1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.owner(4), Some(2));
        assert_eq!(map.owner(1), None);
    }

    #[test]
    fn node_failures_are_prefixed_once() {
        let transport = OrchestratorError::Transport("node 3: connection refused".into());
        assert_eq!(describe(3, &transport), "node 3: connection refused");
        let refused = OrchestratorError::Rejected("disk full".into());
        assert_eq!(describe(3, &refused), "node 3: disk full");
    }

    #[test]
    fn not_indexed_answers_are_recognized() {
        assert!(is_not_indexed("meta color not indexed."));
        assert!(!is_not_indexed("record 1 not found."));
    }
}
