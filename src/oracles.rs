//! The orchestrator's oracle catalog.
//!
//! Oracles live only on the orchestrator; nodes receive temporary copies
//! for the duration of a Run. Oracles found on nodes at bootstrap or when
//! they join are absorbed into the catalog and removed from the node.

use crate::cluster::Cluster;
use crate::config::NODE_ID_PAGE_SIZE;
use crate::counters::Counters;
use crate::error::{OrchestratorError, Result};
use crate::node::{settle, transport_error, Node};
use crate::proto;
use crate::script::OracleDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tonic::Request;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct OracleCatalog {
    oracles: BTreeMap<u64, Arc<OracleDescriptor>>,
    counters: Arc<Counters>,
}

impl OracleCatalog {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            oracles: BTreeMap::new(),
            counters,
        }
    }

    /// Parse and register a new oracle, returning its id.
    pub fn create(&mut self, name: &str, code: &str) -> Result<u64> {
        let parsed = OracleDescriptor::parse(name, code)?;
        let id = self.counters.oracles.allocate();
        self.oracles.insert(id, Arc::new(parsed.with_id(id)));
        Ok(id)
    }

    /// Replace the oracle stored under `oracle.id`.
    pub fn update(&mut self, oracle: &proto::Oracle) -> Result<()> {
        let parsed = OracleDescriptor::parse(oracle.name.as_str(), oracle.code.as_str())?;
        let slot = self
            .oracles
            .get_mut(&oracle.id)
            .ok_or(OrchestratorError::OracleNotFound(oracle.id))?;
        *slot = Arc::new(parsed.with_id(oracle.id));
        Ok(())
    }

    pub fn read(&self, id: u64) -> Result<Arc<OracleDescriptor>> {
        self.oracles
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::OracleNotFound(id))
    }

    /// The lowest-id oracle called `name`.
    pub fn find(&self, name: &str) -> Result<Arc<OracleDescriptor>> {
        self.oracles
            .values()
            .find(|oracle| oracle.name == name)
            .cloned()
            .ok_or_else(|| OrchestratorError::OracleNameNotFound(name.to_string()))
    }

    /// One page of oracles sorted by id. A page past the end carries only
    /// the totals.
    pub fn list(&self, page: u64, per_page: u64) -> proto::OracleListResponse {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = self.oracles.len() as u64;
        let pages = total.div_ceil(per_page);
        let start = (page - 1).saturating_mul(per_page);

        let oracles = if start >= total {
            Vec::new()
        } else {
            self.oracles
                .values()
                .skip(start as usize)
                .take(per_page as usize)
                .map(|oracle| oracle.as_proto())
                .collect()
        };
        proto::OracleListResponse {
            total,
            pages,
            oracles,
        }
    }

    pub fn delete(&mut self, id: u64) -> Result<()> {
        self.oracles
            .remove(&id)
            .map(|_| ())
            .ok_or(OrchestratorError::OracleNotFound(id))
    }

    /// Whether an oracle with the same name and code is registered.
    pub fn contains_equal(&self, oracle: &proto::Oracle) -> bool {
        self.oracles.values().any(|known| known.is_equal_to(oracle))
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }
}

impl Cluster {
    pub async fn create_oracle(&self, name: &str, code: &str) -> Result<u64> {
        self.oracles.write().await.create(name, code)
    }

    pub async fn update_oracle(&self, oracle: &proto::Oracle) -> Result<()> {
        self.oracles.write().await.update(oracle)
    }

    pub async fn read_oracle(&self, id: u64) -> Result<proto::Oracle> {
        Ok(self.oracles.read().await.read(id)?.as_proto())
    }

    pub async fn find_oracle(&self, name: &str) -> Result<proto::Oracle> {
        Ok(self.oracles.read().await.find(name)?.as_proto())
    }

    pub async fn list_oracles(&self, page: u64, per_page: u64) -> proto::OracleListResponse {
        self.oracles.read().await.list(page, per_page)
    }

    pub async fn delete_oracle(&self, id: u64) -> Result<()> {
        self.oracles.write().await.delete(id)
    }
}

/// Move every oracle stored on `node` into `catalog`. Returns how many were
/// taken over; failures are logged.
pub async fn absorb_oracles(node: &Node, catalog: &mut OracleCatalog) -> usize {
    let stored = match list_stored_oracles(node).await {
        Ok(stored) => stored,
        Err(err) => {
            error!(node = node.id, error = %err, "unable to read oracles from node");
            return 0;
        }
    };

    let mut absorbed = 0;
    for oracle in &stored {
        match absorb_one(node, oracle, catalog).await {
            Ok(()) => absorbed += 1,
            Err(err) => error!(node = node.id, error = %err, "failed to absorb oracle"),
        }
    }
    if absorbed > 0 {
        info!(node = node.id, oracles = absorbed, "absorbed oracles from node");
    }
    absorbed
}

async fn absorb_one(
    node: &Node,
    oracle: &proto::Oracle,
    catalog: &mut OracleCatalog,
) -> std::result::Result<(), String> {
    if !catalog.contains_equal(oracle) {
        catalog.create(&oracle.name, &oracle.code).map_err(|e| {
            format!(
                "unable to load oracle #{} ({}) from node {}: {e}",
                oracle.id, oracle.name, node.id
            )
        })?;
    }

    let deleted = settle(
        node.id,
        node.data()
            .delete_oracle(Request::new(proto::ById { id: oracle.id }))
            .await,
    );
    if let Err(err) = deleted {
        warn!(
            "cannot delete oracle #{} ({}) from node {}: {err}",
            oracle.id, oracle.name, node.id
        );
    }
    Ok(())
}

async fn list_stored_oracles(node: &Node) -> Result<Vec<proto::Oracle>> {
    let mut stored = Vec::new();
    let mut page = 1;
    loop {
        let resp = node
            .data()
            .list_oracles(Request::new(proto::ListRequest {
                page,
                per_page: NODE_ID_PAGE_SIZE,
            }))
            .await
            .map_err(|status| transport_error(node.id, &status))?
            .into_inner();
        stored.extend(resp.oracles);
        if page >= resp.pages {
            break;
        }
        page += 1;
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;

    const SOURCE: &str = "function score(id) { return records.Find(id).ID(); }";

    fn catalog() -> OracleCatalog {
        OracleCatalog::new(Arc::new(Counters::default()))
    }

    #[test]
    fn ids_are_allocated_in_order() {
        let mut catalog = catalog();
        assert_eq!(catalog.create("a", SOURCE).unwrap(), 1);
        assert_eq!(catalog.create("b", SOURCE).unwrap(), 2);
        catalog.delete(1).unwrap();
        assert_eq!(catalog.create("c", SOURCE).unwrap(), 3);
    }

    #[test]
    fn broken_code_is_rejected() {
        let mut catalog = catalog();
        let err = catalog.create("bad", "function (").unwrap_err();
        assert!(matches!(err, OrchestratorError::Script(ScriptError::Parse(_))));
        assert!(err.to_string().starts_with("Error parsing the code: "));
        assert!(catalog.is_empty());

        let err = catalog.create("empty", "var x = 1;").unwrap_err();
        assert_eq!(err.to_string(), "Error parsing the code: no function provided");
    }

    #[test]
    fn lookups_by_id_and_name() {
        let mut catalog = catalog();
        let id = catalog.create("score", SOURCE).unwrap();
        assert_eq!(catalog.read(id).unwrap().name, "score");
        assert_eq!(catalog.find("score").unwrap().id, id);
        assert_eq!(catalog.read(99).unwrap_err().to_string(), "oracle 99 not found.");
        assert_eq!(
            catalog.find("nope").unwrap_err().to_string(),
            "oracle 'nope' not found."
        );
    }

    #[test]
    fn update_keeps_the_id() {
        let mut catalog = catalog();
        let id = catalog.create("score", SOURCE).unwrap();
        let replacement = proto::Oracle {
            id,
            name: "score2".into(),
            code: "function other() { return 1; }".into(),
        };
        catalog.update(&replacement).unwrap();
        let stored = catalog.read(id).unwrap();
        assert_eq!(stored.name, "score2");
        assert_eq!(stored.entry(), "other");

        let missing = proto::Oracle { id: 42, ..replacement };
        assert!(matches!(catalog.update(&missing), Err(OrchestratorError::OracleNotFound(42))));
    }

    #[test]
    fn paging_sorted_by_id() {
        let mut catalog = catalog();
        for name in ["a", "b", "c", "d", "e"] {
            catalog.create(name, SOURCE).unwrap();
        }
        let page = catalog.list(2, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        let names: Vec<_> = page.oracles.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["c", "d"]);

        let last = catalog.list(3, 2);
        assert_eq!(last.oracles.len(), 1);

        let past = catalog.list(4, 2);
        assert_eq!((past.total, past.pages), (5, 3));
        assert!(past.oracles.is_empty());
    }

    #[test]
    fn equality_is_name_and_code() {
        let mut catalog = catalog();
        catalog.create("score", SOURCE).unwrap();
        let same = proto::Oracle {
            id: 7,
            name: "score".into(),
            code: SOURCE.into(),
        };
        assert!(catalog.contains_equal(&same));
        let renamed = proto::Oracle {
            name: "other".into(),
            ..same
        };
        assert!(!catalog.contains_equal(&renamed));
    }
}
