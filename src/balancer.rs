//! Load balancing.
//!
//! Each node should hold `total / n` records, the first `total % n` nodes
//! one more. Nothing moves while every node is within 5% of the fair share.

use crate::cluster::{find_node, Cluster};
use crate::config::BALANCE_TOLERANCE_DIVISOR;
use crate::error::Result;
use crate::node::{settle, transport_error, Node, NodeId};
use crate::proto;
use crate::router::ShardMap;
use std::sync::Arc;
use tonic::Request;
use tracing::{debug, error, info, warn};

/// Move `count` records from one node to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: NodeId,
    pub to: NodeId,
    pub count: u64,
}

/// Transfers that bring `counts` (node, records held, in node order) to
/// the fair distribution, or nothing when the imbalance is tolerable.
pub fn plan(counts: &[(NodeId, u64)]) -> Vec<Transfer> {
    let total: u64 = counts.iter().map(|(_, count)| count).sum();
    let nodes = counts.len() as u64;
    if total == 0 || nodes == 0 {
        return Vec::new();
    }

    let fair = total / nodes;
    let remainder = total % nodes;
    let mut deltas: Vec<i64> = counts
        .iter()
        .enumerate()
        .map(|(index, (_, count))| {
            let target = fair + u64::from((index as u64) < remainder);
            target as i64 - *count as i64
        })
        .collect();

    let tolerance = (fair / BALANCE_TOLERANCE_DIVISOR) as i64;
    if !deltas.iter().any(|delta| delta.abs() > tolerance) {
        return Vec::new();
    }

    let mut transfers = Vec::new();
    for receiver in 0..deltas.len() {
        for donor in 0..deltas.len() {
            if deltas[receiver] <= 0 {
                break;
            }
            if deltas[donor] >= 0 {
                continue;
            }
            let count = deltas[receiver].min(-deltas[donor]);
            transfers.push(Transfer {
                from: counts[donor].0,
                to: counts[receiver].0,
                count: count as u64,
            });
            deltas[receiver] -= count;
            deltas[donor] += count;
        }
    }

    for (index, delta) in deltas.iter().enumerate() {
        if *delta != 0 {
            warn!(node = counts[index].0, delta, "node still unbalanced after planning");
        }
    }
    transfers
}

/// Copy the first `count` records of `from` onto `to`, then delete them from
/// `from`. Returns how many records moved.
///
/// When the final delete fails the records exist on both nodes. That is
/// logged and left alone; `to` is recorded as the owner and the copies on
/// `from` are neither moved nor counted by later passes.
pub async fn transfer(from: &Arc<Node>, to: &Arc<Node>, count: u64, map: &mut ShardMap) -> Result<usize> {
    info!(from = from.id, to = to.id, records = count, "transferring records");

    let _source = from.lock().await;
    let _target = to.lock().await;

    let records = from
        .data()
        .list_records(Request::new(proto::ListRequest {
            page: 1,
            per_page: count + from.duplicated_count(),
        }))
        .await
        .map_err(|status| transport_error(from.id, &status))?
        .into_inner()
        .records
        .into_iter()
        .filter(|r| !from.is_duplicated(r.id))
        .take(count as usize)
        .collect::<Vec<_>>();
    if records.is_empty() {
        return Ok(0);
    }
    debug!(node = from.id, records = records.len(), "fetched records to transfer");

    let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
    settle(
        to.id,
        to.internal()
            .create_records_with_id(Request::new(proto::Records { records }))
            .await,
    )?;
    to.note_created(&ids);
    map.assign_many(ids.iter().copied(), to.id);

    let deleted = settle(
        from.id,
        from.internal()
            .delete_records(Request::new(proto::RecordIds { ids: ids.clone() }))
            .await,
    );
    match deleted {
        Ok(_) => from.note_deleted(&ids),
        Err(err) => {
            warn!(
                node = from.id,
                records = ids.len(),
                error = %err,
                "unable to delete transferred records, they are now duplicated"
            );
            from.note_duplicated(&ids);
        }
    }

    Ok(ids.len())
}

impl Cluster {
    /// One balancing pass.
    pub async fn balance(&self) {
        let nodes = self.nodes.read().await;
        let mut map = self.records.write().await;
        self.balance_locked(&nodes, &mut map).await;
    }

    /// Balancing pass for callers already holding the node list and the
    /// shard map.
    pub(crate) async fn balance_locked(&self, nodes: &[Arc<Node>], map: &mut ShardMap) {
        let counts: Vec<(NodeId, u64)> = nodes.iter().map(|n| (n.id, n.owned_count())).collect();
        let transfers = plan(&counts);
        if transfers.is_empty() {
            return;
        }
        info!(transfers = transfers.len(), "balancing");

        for step in transfers {
            let (Some(from), Some(to)) = (find_node(nodes, step.from), find_node(nodes, step.to)) else {
                continue;
            };
            if let Err(err) = transfer(from, to, step.count, map).await {
                error!(from = step.from, to = step.to, error = %err, "transfer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(counts: &[(NodeId, u64)], transfers: &[Transfer]) -> Vec<u64> {
        let mut after: Vec<u64> = counts.iter().map(|(_, c)| *c).collect();
        for t in transfers {
            let from = counts.iter().position(|(n, _)| *n == t.from).unwrap();
            let to = counts.iter().position(|(n, _)| *n == t.to).unwrap();
            after[from] -= t.count;
            after[to] += t.count;
        }
        after
    }

    #[test]
    fn balanced_cluster_needs_nothing() {
        assert!(plan(&[(1, 50), (2, 50)]).is_empty());
        assert!(plan(&[]).is_empty());
        assert!(plan(&[(1, 0), (2, 0)]).is_empty());
    }

    #[test]
    fn small_imbalance_is_tolerated() {
        // Fair share 100, tolerance 5.
        assert!(plan(&[(1, 104), (2, 96)]).is_empty());
        assert!(!plan(&[(1, 110), (2, 90)]).is_empty());
    }

    #[test]
    fn new_empty_node_receives_half() {
        let transfers = plan(&[(1, 100), (2, 0)]);
        assert_eq!(transfers, vec![Transfer { from: 1, to: 2, count: 50 }]);
    }

    #[test]
    fn every_node_ends_within_one_of_fair() {
        let counts = [(1, 90), (2, 3), (3, 0), (4, 7)];
        let transfers = plan(&counts);
        let after = apply(&counts, &transfers);
        assert_eq!(after.iter().sum::<u64>(), 100);
        assert_eq!(after, vec![25, 25, 25, 25]);
    }

    #[test]
    fn remainder_goes_to_first_nodes() {
        let counts = [(1, 0), (2, 0), (3, 10)];
        let after = apply(&counts, &plan(&counts));
        assert_eq!(after, vec![4, 3, 3]);
    }

    #[test]
    fn transfers_never_move_more_than_a_donor_has() {
        let counts = [(1, 40), (2, 40), (3, 0), (4, 0)];
        let transfers = plan(&counts);
        assert!(transfers.iter().all(|t| t.count > 0 && t.from != t.to));
        assert_eq!(apply(&counts, &transfers), vec![20, 20, 20, 20]);
    }
}
