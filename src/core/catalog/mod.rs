// src/core/catalog/mod.rs

//! The cluster catalog: the authoritative record of every node in the
//! cluster. The running processes are shadows of these rows; on any
//! disagreement the engines re-read the row and abort rather than overwrite.

pub mod store;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub use store::{Catalog, CatalogTxn, NodePredicate};

/// Opaque row key of a node. Immutable once created.
pub type NodeId = u64;

/// Opaque row key of a host.
pub type HostId = u64;

/// The three node families of a Beryl cluster. A slave always belongs to
/// the same family as its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum NodeFamily {
    #[strum(serialize = "coordinator")]
    Coordinator,
    #[strum(serialize = "datanode")]
    Datanode,
    #[strum(serialize = "gtm")]
    Gtm,
}

/// The role of a node within its family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    #[strum(serialize = "coord-master")]
    CoordMaster,
    #[strum(serialize = "coord-slave")]
    CoordSlave,
    #[strum(serialize = "dn-master")]
    DatanodeMaster,
    #[strum(serialize = "dn-slave")]
    DatanodeSlave,
    #[strum(serialize = "gtm-master")]
    GtmMaster,
    #[strum(serialize = "gtm-slave")]
    GtmSlave,
}

impl NodeRole {
    pub fn is_master(self) -> bool {
        matches!(
            self,
            NodeRole::CoordMaster | NodeRole::DatanodeMaster | NodeRole::GtmMaster
        )
    }

    pub fn is_slave(self) -> bool {
        !self.is_master()
    }

    pub fn family(self) -> NodeFamily {
        match self {
            NodeRole::CoordMaster | NodeRole::CoordSlave => NodeFamily::Coordinator,
            NodeRole::DatanodeMaster | NodeRole::DatanodeSlave => NodeFamily::Datanode,
            NodeRole::GtmMaster | NodeRole::GtmSlave => NodeFamily::Gtm,
        }
    }

    /// The master role of a family.
    pub fn master_of(family: NodeFamily) -> NodeRole {
        match family {
            NodeFamily::Coordinator => NodeRole::CoordMaster,
            NodeFamily::Datanode => NodeRole::DatanodeMaster,
            NodeFamily::Gtm => NodeRole::GtmMaster,
        }
    }

    /// The slave role of a family.
    pub fn slave_of(family: NodeFamily) -> NodeRole {
        match family {
            NodeFamily::Coordinator => NodeRole::CoordSlave,
            NodeFamily::Datanode => NodeRole::DatanodeSlave,
            NodeFamily::Gtm => NodeRole::GtmSlave,
        }
    }
}

/// Synchronous-replication intent of a slave. Masters carry `None`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Required member of the master's synchronous-standby list.
    #[strum(serialize = "sync")]
    Sync,
    /// Eligible member; promoted to `sync` when the list would be empty.
    #[strum(serialize = "potential")]
    Potential,
    /// Never appears in the synchronous-standby list.
    #[strum(serialize = "async")]
    Async,
    /// Not a replica (masters).
    #[default]
    #[strum(serialize = "none")]
    None,
}

/// Per-row state coordinating the doctors (detectors) and the switcher
/// (actor). Owned by the switcher while a switch is in flight.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum CureStatus {
    #[default]
    #[strum(serialize = "normal")]
    Normal,
    #[strum(serialize = "wait-switch")]
    WaitSwitch,
    #[strum(serialize = "switching")]
    Switching,
    #[strum(serialize = "follow-master")]
    FollowMaster,
    #[strum(serialize = "wait-rewind")]
    WaitRewind,
    #[strum(serialize = "isolated")]
    Isolated,
}

/// Shutdown modes understood by the node binaries, in increasing order of
/// abruptness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    #[strum(serialize = "smart")]
    Smart,
    #[strum(serialize = "fast")]
    Fast,
    #[strum(serialize = "immediate")]
    Immediate,
}

/// A machine that runs node processes and one agent. Host CRUD is owned by
/// an external collaborator; the core only reads these rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRow {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub agent_port: u16,
    pub os_user: String,
}

/// One catalog row: a single coordinator, datanode, or GTM process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: NodeId,
    pub name: String,
    pub host: HostId,
    pub port: u16,
    pub role: NodeRole,
    /// References another node when `role` is a slave; `None` for masters.
    pub master_id: Option<NodeId>,
    pub sync_state: SyncState,
    /// Absolute filesystem path on `host`.
    pub path: String,
    pub inited: bool,
    pub in_cluster: bool,
    pub allow_cure: bool,
    pub cure_status: CureStatus,
}

impl NodeRow {
    /// Field-by-field comparison against a re-read copy, ignoring
    /// `cure_status` which is validated separately against the expected set.
    pub fn identical_except_cure(&self, other: &NodeRow) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.host == other.host
            && self.port == other.port
            && self.role == other.role
            && self.master_id == other.master_id
            && self.sync_state == other.sync_state
            && self.path == other.path
            && self.inited == other.inited
            && self.in_cluster == other.in_cluster
            && self.allow_cure == other.allow_cure
    }
}
