// src/core/routing.rs

//! The routing-table editor: keeps every in-cluster coordinator's node
//! table pointing at the master rows the catalog holds, plus the topology
//! planner that computes preferred coordinator-datanode pairings.

use tracing::{info, warn};

use crate::core::catalog::{HostRow, NodeId, NodeRow};
use crate::core::pgclient::PgClient;

/// One coordinator that could not be updated. Collected, never fatal: the
/// operator reconciles with `flush host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingFailure {
    pub coordinator: String,
    pub error: String,
}

impl std::fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "routing refresh failed on {}: {}", self.coordinator, self.error)
    }
}

/// The result of a fan-out over coordinators.
#[derive(Debug, Default)]
pub struct RoutingReport {
    /// Names of coordinators whose routing table was updated and reloaded.
    pub succeeded: Vec<String>,
    pub failures: Vec<RoutingFailure>,
}

impl RoutingReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Preferred pairing of one coordinator with one datanode master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferredPair {
    pub coordinator: NodeId,
    pub datanode: NodeId,
    pub primary: bool,
}

/// Computes preferred coordinator-datanode pairs: a coordinator prefers a
/// datanode master on its own host when one exists, otherwise the masters
/// are dealt out round-robin. The first datanode master in scan order is
/// the primary.
pub fn plan_preferred_pairs(
    coordinators: &[NodeRow],
    datanode_masters: &[NodeRow],
) -> Vec<PreferredPair> {
    if datanode_masters.is_empty() {
        return Vec::new();
    }
    let primary_id = datanode_masters[0].id;
    coordinators
        .iter()
        .enumerate()
        .map(|(index, coord)| {
            let datanode = datanode_masters
                .iter()
                .find(|dn| dn.host == coord.host)
                .unwrap_or(&datanode_masters[index % datanode_masters.len()]);
            PreferredPair {
                coordinator: coord.id,
                datanode: datanode.id,
                primary: datanode.id == primary_id,
            }
        })
        .collect()
}

async fn run_on_coordinator(
    coord: &NodeRow,
    host: &HostRow,
    default_db: &str,
    statements: &[String],
) -> Result<(), String> {
    let mut conn = PgClient::connect(&host.address, coord.port, &host.os_user, default_db)
        .await
        .map_err(|e| e.to_string())?;
    for sql in statements {
        if let Err(e) = conn.execute(sql).await {
            conn.close().await;
            return Err(e.to_string());
        }
    }
    conn.close().await;
    Ok(())
}

async fn fan_out(
    coordinators: &[(NodeRow, HostRow)],
    default_db: &str,
    statements: impl Fn(&NodeRow) -> Vec<String>,
) -> RoutingReport {
    let mut report = RoutingReport::default();
    for (coord, host) in coordinators {
        let stmts = statements(coord);
        match run_on_coordinator(coord, host, default_db, &stmts).await {
            Ok(()) => {
                info!("routing refreshed on coordinator \"{}\"", coord.name);
                report.succeeded.push(coord.name.clone());
            }
            Err(error) => {
                warn!("routing refresh failed on \"{}\": {}", coord.name, error);
                report.failures.push(RoutingFailure {
                    coordinator: coord.name.clone(),
                    error,
                });
            }
        }
    }
    report
}

/// Re-points an existing routing entry at a new `(host, port)` on every
/// given coordinator, atomically from each coordinator's perspective.
pub async fn alter_node_on_coordinators(
    coordinators: &[(NodeRow, HostRow)],
    default_db: &str,
    entry_name: &str,
    address: &str,
    port: u16,
) -> RoutingReport {
    fan_out(coordinators, default_db, |_| {
        vec![
            format!("ALTER NODE \"{entry_name}\" WITH (HOST='{address}', PORT={port});"),
            "SELECT pgxc_pool_reload();".to_string(),
        ]
    })
    .await
}

/// Registers a new node on every given coordinator, applying the planner's
/// preferred/primary flags per coordinator.
pub async fn create_node_on_coordinators(
    coordinators: &[(NodeRow, HostRow)],
    default_db: &str,
    node: &NodeRow,
    address: &str,
    kind: &str,
    pairs: &[PreferredPair],
) -> RoutingReport {
    let port = node.port;
    let name = node.name.clone();
    let id = node.id;
    fan_out(coordinators, default_db, move |coord| {
        let pair = pairs
            .iter()
            .find(|p| p.coordinator == coord.id && p.datanode == id);
        let mut with = format!("TYPE='{kind}', HOST='{address}', PORT={port}");
        if pair.is_some_and(|p| p.primary) {
            with.push_str(", PRIMARY");
        }
        if pair.is_some() {
            with.push_str(", PREFERRED");
        }
        vec![
            format!("CREATE NODE \"{name}\" WITH ({with});"),
            "SELECT pgxc_pool_reload();".to_string(),
        ]
    })
    .await
}

/// Removes a routing entry from every given coordinator.
pub async fn drop_node_on_coordinators(
    coordinators: &[(NodeRow, HostRow)],
    default_db: &str,
    entry_name: &str,
) -> RoutingReport {
    fan_out(coordinators, default_db, |_| {
        vec![
            format!("DROP NODE \"{entry_name}\";"),
            "SELECT pgxc_pool_reload();".to_string(),
        ]
    })
    .await
}
