// src/core/append.rs

//! The append engine: joins a freshly added node to a running cluster.
//! Slave flows basebackup from their master and slot into its
//! synchronous-standby list; master flows restore the catalog under the
//! cluster lock and register themselves on every coordinator.

use std::time::Duration;

use tracing::{info, warn};

use crate::core::agent::{AgentClient, AgentCmd, CommandPayload, ConfEdit, HbaLine};
use crate::core::catalog::{
    Catalog, CatalogTxn, HostRow, NodeFamily, NodePredicate, NodeRole, NodeRow, ShutdownMode,
    SyncState,
};
use crate::core::errors::BerylMgrError;
use crate::core::lock::ClusterLock;
use crate::core::pgclient::PgClient;
use crate::core::probe::wait_node_ok;
use crate::core::routing::{create_node_on_coordinators, plan_preferred_pairs};
use crate::core::standby::{apply_sync_standby, plan_sync_standby};

/// How long a freshly started node gets to answer its first ping.
const STARTUP_BUDGET: Duration = Duration::from_secs(60);

/// Joins the named node to the cluster. Dispatches on the row's role; the
/// returned strings are operator-visible notices and residual diagnostics.
pub async fn append_node(
    catalog: &Catalog,
    name: &str,
    default_db: &str,
    manager_address: &str,
) -> Result<Vec<String>, BerylMgrError> {
    let mut txn = catalog.begin().await;
    let row = txn
        .select_by_name(name)
        .ok_or_else(|| BerylMgrError::NodeNotFound(name.to_string()))?;
    if row.in_cluster {
        txn.abort();
        return Err(BerylMgrError::InvalidRequest(format!(
            "node \"{name}\" is already in the cluster"
        )));
    }

    let result = match row.role {
        NodeRole::DatanodeSlave | NodeRole::GtmSlave => {
            append_replica(&mut txn, &row, default_db).await
        }
        NodeRole::DatanodeMaster => {
            append_master(&mut txn, &row, default_db, manager_address).await
        }
        NodeRole::CoordMaster => {
            append_coordinator(&mut txn, &row, default_db, manager_address).await
        }
        other => Err(BerylMgrError::InvalidRequest(format!(
            "append does not support role {other}"
        ))),
    };

    match result {
        Ok(diags) => {
            txn.commit();
            Ok(diags)
        }
        Err(e) => {
            txn.abort();
            Err(e)
        }
    }
}

/// Appends a datanode or GTM slave: open the master's HBA for replication,
/// basebackup, write the two config files, start, slot into the master's
/// synchronous-standby list, and flip the membership flags once the node
/// answers.
async fn append_replica(
    txn: &mut CatalogTxn,
    row: &NodeRow,
    default_db: &str,
) -> Result<Vec<String>, BerylMgrError> {
    let family = row.role.family();
    let mut diagnostics = Vec::new();

    let master_id = row.master_id.ok_or_else(|| {
        BerylMgrError::InvariantViolation(format!("slave \"{}\" has no master reference", row.name))
    })?;
    let master = txn
        .select_by_id(master_id)
        .ok_or_else(|| BerylMgrError::NodeNotFound(format!("master of \"{}\"", row.name)))?;
    let master_host = txn.host_of(&master)?;
    let host = txn.host_of(row)?;

    // Open the master's HBA for the replication connection from the new
    // slave's host, then reload the rules.
    let mut master_agent = AgentClient::connect_host(&master_host).await?;
    let hba = HbaLine::trust("replication", &master_host.os_user, &host.address, 32);
    master_agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshHba)
                .blob(&HbaLine::payload_for(
                    &format!("{}/pg_hba.conf", master.path),
                    std::slice::from_ref(&hba),
                ))
                .into_msg(),
        )
        .await?;
    master_agent
        .run(AgentCmd::reload(family), &[&master.path])
        .await?;

    // Base backup onto the new slave's path, then its two config files.
    let mut agent = AgentClient::connect_host(&host).await?;
    agent
        .run(
            AgentCmd::Basebackup,
            &[
                &row.path,
                &master_host.address,
                &master.port.to_string(),
                &master_host.os_user,
            ],
        )
        .await?;

    let postgresql = ConfEdit::new(format!("{}/postgresql.conf", row.path))
        .set("port", row.port.to_string())
        .set("hot_standby", "on")
        .set("synchronous_standby_names", "");
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshPostgres)
                .blob(&postgresql.payload())
                .into_msg(),
        )
        .await?;

    let conninfo = format!(
        "host={} port={} user={} application_name={}",
        master_host.address, master.port, master_host.os_user, row.name
    );
    let recovery = ConfEdit::new(format!("{}/recovery.conf", row.path))
        .set("standby_mode", "on")
        .set("primary_conninfo", conninfo)
        .set("recovery_target_timeline", "latest");
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshRecovery)
                .blob(&recovery.payload())
                .into_msg(),
        )
        .await?;

    agent.run(AgentCmd::start(family), &[&row.path]).await?;

    // Slot the new slave into the master's synchronous-standby list and
    // verify the reloaded value.
    let siblings = txn.slaves_of(master.id);
    let plan = plan_sync_standby(&siblings, None, Some(row.id));
    for notice in &plan.notices {
        info!("\"{}\": {notice}", master.name);
        diagnostics.push(notice.clone());
    }
    if let Some(warning) = &plan.warning {
        warn!("\"{}\": {warning}", master.name);
        diagnostics.push(warning.clone());
    }
    for upgraded in &plan.upgrades {
        if *upgraded == row.id {
            continue;
        }
        if let Some(mut sibling) = txn.select_by_id(*upgraded) {
            sibling.sync_state = SyncState::Sync;
            txn.update_in_place(&sibling)?;
        }
    }
    apply_sync_standby(&master_host, &master, default_db, &plan.value).await?;

    if !wait_node_ok(&host.address, row.port, &host.os_user, STARTUP_BUDGET).await {
        return Err(BerylMgrError::RemoteCommandFailed(format!(
            "node \"{}\" did not start serving within {STARTUP_BUDGET:?}",
            row.name
        )));
    }

    let mut joined = row.clone();
    joined.inited = true;
    joined.in_cluster = true;
    if plan.upgrades.contains(&row.id) {
        joined.sync_state = SyncState::Sync;
    }
    txn.update_in_place(&joined)?;
    info!("node \"{}\" appended to the cluster", row.name);
    Ok(diagnostics)
}

/// Appends a datanode master: restore the catalog from a live coordinator
/// under the cluster lock, then register the node on every coordinator.
async fn append_master(
    txn: &mut CatalogTxn,
    row: &NodeRow,
    default_db: &str,
    manager_address: &str,
) -> Result<Vec<String>, BerylMgrError> {
    if !row.inited {
        return Err(BerylMgrError::InvalidRequest(format!(
            "node \"{}\" must be initialized before append",
            row.name
        )));
    }
    let host = txn.host_of(row)?;
    let coordinators = in_cluster_coordinators(txn)?;
    if coordinators.is_empty() {
        return Err(BerylMgrError::InvariantViolation(
            "no in-cluster coordinator to append against".to_string(),
        ));
    }

    let lock = ClusterLock::acquire(&coordinators, manager_address, default_db).await?;
    let body = restore_and_register(txn, row, &host, &coordinators, default_db).await;
    let release = lock.release().await;

    let mut diagnostics = body?;
    if let Err(e) = release {
        diagnostics.push(e.to_string());
    }

    if !wait_node_ok(&host.address, row.port, &host.os_user, STARTUP_BUDGET).await {
        return Err(BerylMgrError::RemoteCommandFailed(format!(
            "node \"{}\" did not start serving within {STARTUP_BUDGET:?}",
            row.name
        )));
    }

    let mut joined = row.clone();
    joined.inited = true;
    joined.in_cluster = true;
    txn.update_in_place(&joined)?;
    info!("node \"{}\" appended to the cluster", row.name);
    Ok(diagnostics)
}

async fn restore_and_register(
    txn: &mut CatalogTxn,
    row: &NodeRow,
    host: &HostRow,
    coordinators: &[(NodeRow, HostRow)],
    default_db: &str,
) -> Result<Vec<String>, BerylMgrError> {
    let mut diagnostics = Vec::new();
    let family = row.role.family();
    let (source, source_host) = &coordinators[0];
    let dump_path = format!("{}/restore_catalog.sql", row.path);

    let mut agent = AgentClient::connect_host(host).await?;
    agent
        .run(
            AgentCmd::Dumpall,
            &[
                &source_host.address,
                &source.port.to_string(),
                &source_host.os_user,
                &dump_path,
            ],
        )
        .await?;

    // Start in restore mode, replay the dump, then restart normally.
    agent
        .run(AgentCmd::start(family), &[&row.path, "restore"])
        .await?;
    agent
        .run(
            AgentCmd::PsqlExec,
            &[
                &host.os_user,
                &row.port.to_string(),
                default_db,
                &dump_path,
            ],
        )
        .await?;
    agent
        .run(
            AgentCmd::stop(family),
            &[&row.path, &ShutdownMode::Fast.to_string()],
        )
        .await?;
    agent.run(AgentCmd::start(family), &[&row.path]).await?;

    let kind = match family {
        NodeFamily::Coordinator => "coordinator",
        NodeFamily::Datanode => "datanode",
        NodeFamily::Gtm => {
            return Err(BerylMgrError::InvalidRequest(
                "gtm masters are not registered in routing tables".to_string(),
            ));
        }
    };
    let mut dn_masters = txn.select_where(&NodePredicate {
        role: Some(NodeRole::DatanodeMaster),
        in_cluster: Some(true),
        ..NodePredicate::default()
    });
    if family == NodeFamily::Datanode {
        dn_masters.push(row.clone());
    }
    let coordinator_rows: Vec<NodeRow> = coordinators.iter().map(|(c, _)| c.clone()).collect();
    let pairs = plan_preferred_pairs(&coordinator_rows, &dn_masters);
    let report =
        create_node_on_coordinators(coordinators, default_db, row, &host.address, kind, &pairs)
            .await;
    if report.succeeded.is_empty() && !report.failures.is_empty() {
        return Err(BerylMgrError::RemoteCommandFailed(format!(
            "no coordinator accepted the new node: {}",
            report.failures[0]
        )));
    }
    for failure in report.failures {
        diagnostics.push(failure.to_string());
    }
    Ok(diagnostics)
}

/// Appends a coordinator master: the master restore flow, plus building the
/// new coordinator's own routing table.
async fn append_coordinator(
    txn: &mut CatalogTxn,
    row: &NodeRow,
    default_db: &str,
    manager_address: &str,
) -> Result<Vec<String>, BerylMgrError> {
    let mut diagnostics = append_master(txn, row, default_db, manager_address).await?;

    // The new coordinator needs its own view of the cluster: one entry per
    // datanode master and per sibling coordinator.
    let host = txn.host_of(row)?;
    let mut conn =
        PgClient::connect(&host.address, row.port, &host.os_user, default_db).await?;
    let dn_masters = txn.select_where(&NodePredicate {
        role: Some(NodeRole::DatanodeMaster),
        in_cluster: Some(true),
        ..NodePredicate::default()
    });
    let coordinators = txn.select_where(&NodePredicate {
        role: Some(NodeRole::CoordMaster),
        in_cluster: Some(true),
        ..NodePredicate::default()
    });
    for (kind, nodes) in [("datanode", dn_masters), ("coordinator", coordinators)] {
        for node in nodes {
            if node.id == row.id {
                continue;
            }
            let node_host = txn.host_of(&node)?;
            let sql = format!(
                "CREATE NODE \"{}\" WITH (TYPE='{kind}', HOST='{}', PORT={});",
                node.name, node_host.address, node.port
            );
            if let Err(e) = conn.execute(&sql).await {
                diagnostics.push(format!(
                    "routing entry \"{}\" on new coordinator: {e}",
                    node.name
                ));
            }
        }
    }
    if let Err(e) = conn.execute("SELECT pgxc_pool_reload();").await {
        diagnostics.push(format!("pool reload on new coordinator: {e}"));
    }
    conn.close().await;
    Ok(diagnostics)
}

fn in_cluster_coordinators(
    txn: &CatalogTxn,
) -> Result<Vec<(NodeRow, HostRow)>, BerylMgrError> {
    txn.select_where(&NodePredicate {
        role: Some(NodeRole::CoordMaster),
        in_cluster: Some(true),
        ..NodePredicate::default()
    })
    .into_iter()
    .map(|c| txn.host_of(&c).map(|h| (c, h)))
    .collect()
}
