// src/core/catalog/store.rs

//! The transactional catalog store. The embedded table lives behind a
//! `tokio::sync::Mutex` gate: a transaction owns the gate for its whole
//! lifetime, so concurrent workers serialise on the catalog itself rather
//! than on ad-hoc in-process locks. A transaction operates on a working
//! copy; `commit` publishes it, `abort` discards it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CureStatus, HostId, HostRow, NodeId, NodeRole, NodeRow, SyncState};
use crate::core::errors::BerylMgrError;

/// Predicate for `select_where`. Unset fields match everything. Scans are
/// returned in id order, which is the stable "row scan order" the engines
/// rely on for tie-breaking.
#[derive(Debug, Clone, Default)]
pub struct NodePredicate {
    pub role: Option<NodeRole>,
    pub in_cluster: Option<bool>,
    pub inited: Option<bool>,
    pub master_id: Option<Option<NodeId>>,
    pub sync_state: Option<SyncState>,
}

impl NodePredicate {
    fn matches(&self, row: &NodeRow) -> bool {
        self.role.is_none_or(|r| row.role == r)
            && self.in_cluster.is_none_or(|v| row.in_cluster == v)
            && self.inited.is_none_or(|v| row.inited == v)
            && self.master_id.is_none_or(|m| row.master_id == m)
            && self.sync_state.is_none_or(|s| row.sync_state == s)
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogTables {
    nodes: BTreeMap<NodeId, NodeRow>,
    hosts: BTreeMap<HostId, HostRow>,
    next_node_id: NodeId,
    next_host_id: HostId,
}

/// Handle to the shared catalog. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Catalog {
    gate: Arc<Mutex<CatalogTables>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Mutex::new(CatalogTables {
                next_node_id: 1,
                next_host_id: 1,
                ..CatalogTables::default()
            })),
        }
    }

    /// Begins a transaction. Blocks until every other transaction has
    /// committed or aborted.
    pub async fn begin(&self) -> CatalogTxn {
        let guard = self.gate.clone().lock_owned().await;
        let work = guard.clone();
        CatalogTxn { guard, work }
    }

    /// A consistent point-in-time read of both tables, for the read-only
    /// list/monitor views.
    pub async fn snapshot(&self) -> (Vec<NodeRow>, Vec<HostRow>) {
        let tables = self.gate.lock().await;
        (
            tables.nodes.values().cloned().collect(),
            tables.hosts.values().cloned().collect(),
        )
    }
}

/// An open catalog transaction. Dropping it without calling `commit` is an
/// abort.
pub struct CatalogTxn {
    guard: OwnedMutexGuard<CatalogTables>,
    work: CatalogTables,
}

impl CatalogTxn {
    // --- reads ---

    pub fn select_by_id(&self, id: NodeId) -> Option<NodeRow> {
        self.work.nodes.get(&id).cloned()
    }

    pub fn select_by_name(&self, name: &str) -> Option<NodeRow> {
        self.work.nodes.values().find(|n| n.name == name).cloned()
    }

    pub fn select_where(&self, pred: &NodePredicate) -> Vec<NodeRow> {
        self.work
            .nodes
            .values()
            .filter(|n| pred.matches(n))
            .cloned()
            .collect()
    }

    /// All slaves of the given master, in scan order.
    pub fn slaves_of(&self, master: NodeId) -> Vec<NodeRow> {
        self.select_where(&NodePredicate {
            master_id: Some(Some(master)),
            ..NodePredicate::default()
        })
    }

    pub fn host_by_id(&self, id: HostId) -> Option<HostRow> {
        self.work.hosts.get(&id).cloned()
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostRow> {
        self.work.hosts.values().find(|h| h.name == name).cloned()
    }

    /// Host lookup that most engine paths use: failing to resolve the host
    /// of an existing node is a broken reference, not a missing row.
    pub fn host_of(&self, node: &NodeRow) -> Result<HostRow, BerylMgrError> {
        self.host_by_id(node.host)
            .ok_or_else(|| BerylMgrError::HostNotFound(node.name.clone()))
    }

    // --- writes ---

    /// Inserts a node row, allocating its id. Validates uniqueness and the
    /// referential rules before accepting the row.
    pub fn insert(&mut self, mut row: NodeRow) -> Result<NodeId, BerylMgrError> {
        self.validate(&row, None)?;
        let id = self.work.next_node_id;
        self.work.next_node_id += 1;
        row.id = id;
        self.work.nodes.insert(id, row);
        Ok(id)
    }

    pub fn insert_host(&mut self, mut row: HostRow) -> Result<HostId, BerylMgrError> {
        if self.work.hosts.values().any(|h| h.name == row.name) {
            return Err(BerylMgrError::InvalidRequest(format!(
                "host \"{}\" already exists",
                row.name
            )));
        }
        let id = self.work.next_host_id;
        self.work.next_host_id += 1;
        row.id = id;
        self.work.hosts.insert(id, row);
        Ok(id)
    }

    /// Overwrites all mutable fields of an existing row.
    pub fn update_in_place(&mut self, row: &NodeRow) -> Result<(), BerylMgrError> {
        if !self.work.nodes.contains_key(&row.id) {
            return Err(BerylMgrError::NodeNotFound(row.name.clone()));
        }
        self.validate(row, Some(row.id))?;
        self.work.nodes.insert(row.id, row.clone());
        Ok(())
    }

    pub fn delete(&mut self, id: NodeId) -> Result<(), BerylMgrError> {
        if self.work.nodes.remove(&id).is_none() {
            return Err(BerylMgrError::NodeNotFound(format!("id {id}")));
        }
        Ok(())
    }

    /// The fence primitive: compare-and-swap on `cure_status`, failing with
    /// `CatalogConflict` when the row is not in the expected state. Because
    /// transactions serialise on the catalog gate, exactly one of any pair
    /// of concurrent workers wins this CAS.
    pub fn update_cure_status(
        &mut self,
        id: NodeId,
        expected: CureStatus,
        new: CureStatus,
    ) -> Result<(), BerylMgrError> {
        let row = self
            .work
            .nodes
            .get_mut(&id)
            .ok_or_else(|| BerylMgrError::NodeNotFound(format!("id {id}")))?;
        if row.cure_status != expected {
            return Err(BerylMgrError::CatalogConflict(format!(
                "node \"{}\": cure status is {}, expected {}",
                row.name, row.cure_status, expected
            )));
        }
        row.cure_status = new;
        Ok(())
    }

    // --- terminal operations ---

    pub fn commit(mut self) {
        *self.guard = self.work;
    }

    pub fn abort(self) {
        // Dropping the working copy and the gate is the whole rollback.
    }

    // --- validation ---

    /// A slave's `master_id` must point to a master row of the same family,
    /// never to another slave. `(host, port)` and `(host, path)` are unique
    /// across all nodes, as are names.
    fn validate(&self, row: &NodeRow, skip: Option<NodeId>) -> Result<(), BerylMgrError> {
        for other in self.work.nodes.values() {
            if Some(other.id) == skip {
                continue;
            }
            if other.name == row.name {
                return Err(BerylMgrError::InvalidRequest(format!(
                    "node \"{}\" already exists",
                    row.name
                )));
            }
            if other.host == row.host && other.port == row.port {
                return Err(BerylMgrError::InvariantViolation(format!(
                    "node \"{}\" already occupies port {} on that host",
                    other.name, row.port
                )));
            }
            if other.host == row.host && other.path == row.path {
                return Err(BerylMgrError::InvariantViolation(format!(
                    "node \"{}\" already occupies path {} on that host",
                    other.name, row.path
                )));
            }
        }

        match (row.role.is_slave(), row.master_id) {
            (true, Some(master_id)) => {
                let master = self.work.nodes.get(&master_id).ok_or_else(|| {
                    BerylMgrError::InvariantViolation(format!(
                        "node \"{}\" references missing master id {master_id}",
                        row.name
                    ))
                })?;
                if master.role != NodeRole::master_of(row.role.family()) {
                    return Err(BerylMgrError::InvariantViolation(format!(
                        "node \"{}\" ({}) cannot follow \"{}\" ({})",
                        row.name, row.role, master.name, master.role
                    )));
                }
            }
            (true, None) => {
                return Err(BerylMgrError::InvariantViolation(format!(
                    "slave node \"{}\" has no master reference",
                    row.name
                )));
            }
            (false, Some(_)) => {
                return Err(BerylMgrError::InvariantViolation(format!(
                    "master node \"{}\" must not reference a master",
                    row.name
                )));
            }
            (false, None) => {}
        }
        Ok(())
    }
}
