// src/core/ops/node.rs

//! Node and host lifecycle verbs: add, alter, drop, remove, append.

use std::str::FromStr;

use tracing::info;

use super::{Attrs, ManagerCtx, OpResult};
use crate::core::agent::{AgentClient, AgentCmd, CommandPayload, HbaLine};
use crate::core::append::append_node;
use crate::core::catalog::{
    CureStatus, HostRow, NodeFamily, NodePredicate, NodeRole, NodeRow, SyncState,
};
use crate::core::errors::BerylMgrError;
use crate::core::lock::ClusterLock;
use crate::core::probe::{PingStatus, ping_node};
use crate::core::routing::drop_node_on_coordinators;
use crate::core::standby::{apply_sync_standby, plan_sync_standby};

pub async fn add_host(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> OpResult {
    let Some(address) = attrs.get("address") else {
        return OpResult::fail(name, "missing address=");
    };
    let Some(agent_port) = attrs.get("agent_port").and_then(|p| p.parse::<u16>().ok()) else {
        return OpResult::fail(name, "missing or malformed agent_port=");
    };
    let os_user = attrs.get("user").cloned().unwrap_or_else(|| "beryl".to_string());

    let mut txn = ctx.catalog.begin().await;
    let result = txn.insert_host(HostRow {
        id: 0,
        name: name.to_string(),
        address: address.clone(),
        agent_port,
        os_user,
    });
    match result {
        Ok(_) => {
            txn.commit();
            OpResult::ok(name, "host added")
        }
        Err(e) => {
            txn.abort();
            OpResult::fail(name, e.to_string())
        }
    }
}

pub async fn add_node(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> OpResult {
    let Some(role) = attrs.get("role").and_then(|r| NodeRole::from_str(r).ok()) else {
        return OpResult::fail(name, "missing or malformed role=");
    };
    let Some(port) = attrs.get("port").and_then(|p| p.parse::<u16>().ok()) else {
        return OpResult::fail(name, "missing or malformed port=");
    };
    let Some(path) = attrs.get("path") else {
        return OpResult::fail(name, "missing path=");
    };
    let Some(host_name) = attrs.get("host") else {
        return OpResult::fail(name, "missing host=");
    };

    let mut txn = ctx.catalog.begin().await;
    let Some(host) = txn.host_by_name(host_name) else {
        txn.abort();
        return OpResult::fail(name, format!("unknown host \"{host_name}\""));
    };

    let master_id = if role.is_slave() {
        let master = match attrs.get("master") {
            Some(master_name) => txn.select_by_name(master_name),
            // With a single master of the family, it is unambiguous.
            None => {
                let masters = txn.select_where(&NodePredicate {
                    role: Some(NodeRole::master_of(role.family())),
                    ..NodePredicate::default()
                });
                (masters.len() == 1).then(|| masters[0].clone())
            }
        };
        match master {
            Some(m) => Some(m.id),
            None => {
                txn.abort();
                return OpResult::fail(name, "cannot resolve master=, specify it explicitly");
            }
        }
    } else {
        None
    };

    let sync_state = match attrs.get("sync") {
        Some(s) => match SyncState::from_str(s) {
            Ok(s) => s,
            Err(_) => {
                txn.abort();
                return OpResult::fail(name, format!("malformed sync=\"{s}\""));
            }
        },
        None if role.is_slave() => SyncState::Potential,
        None => SyncState::None,
    };

    let row = NodeRow {
        id: 0,
        name: name.to_string(),
        host: host.id,
        port,
        role,
        master_id,
        sync_state,
        path: path.clone(),
        inited: false,
        in_cluster: false,
        allow_cure: true,
        cure_status: CureStatus::Normal,
    };
    match txn.insert(row) {
        Ok(_) => {
            txn.commit();
            OpResult::ok(name, "node added")
        }
        Err(e) => {
            txn.abort();
            OpResult::fail(name, e.to_string())
        }
    }
}

/// Alters a row that is not yet part of the cluster. In-cluster rows are
/// mutated only by the switcher, append, and remove procedures; the single
/// exception is the `allow_cure` toggle, which fences the doctors.
pub async fn alter_node(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> OpResult {
    let mut txn = ctx.catalog.begin().await;
    let Some(mut row) = txn.select_by_name(name) else {
        txn.abort();
        return OpResult::fail(name, "node does not exist");
    };

    if let Some(allow) = attrs.get("allow_cure").and_then(|v| v.parse::<bool>().ok()) {
        row.allow_cure = allow;
    }

    let structural: Vec<&str> = ["port", "path", "sync", "host"]
        .into_iter()
        .filter(|k| attrs.contains_key(*k))
        .collect();
    if !structural.is_empty() {
        if row.in_cluster {
            txn.abort();
            return OpResult::fail(
                name,
                "node is in the cluster; structural changes go through the procedures",
            );
        }
        if let Some(port) = attrs.get("port").and_then(|p| p.parse::<u16>().ok()) {
            row.port = port;
        }
        if let Some(path) = attrs.get("path") {
            row.path = path.clone();
        }
        if let Some(sync) = attrs.get("sync").and_then(|s| SyncState::from_str(s).ok()) {
            row.sync_state = sync;
        }
        if let Some(host_name) = attrs.get("host") {
            match txn.host_by_name(host_name) {
                Some(host) => row.host = host.id,
                None => {
                    txn.abort();
                    return OpResult::fail(name, format!("unknown host \"{host_name}\""));
                }
            }
        }
    }

    match txn.update_in_place(&row) {
        Ok(()) => {
            txn.commit();
            OpResult::ok(name, "node altered")
        }
        Err(e) => {
            txn.abort();
            OpResult::fail(name, e.to_string())
        }
    }
}

/// Deletes a row that has already left the cluster.
pub async fn drop_node(ctx: &ManagerCtx, name: &str) -> OpResult {
    let mut txn = ctx.catalog.begin().await;
    let Some(row) = txn.select_by_name(name) else {
        txn.abort();
        return OpResult::fail(name, "node does not exist");
    };
    if row.in_cluster {
        txn.abort();
        return OpResult::fail(name, "node is in the cluster; remove it first");
    }
    if row.role.is_master() && !txn.slaves_of(row.id).is_empty() {
        txn.abort();
        return OpResult::fail(name, "node still has slaves");
    }
    match txn.delete(row.id) {
        Ok(()) => {
            txn.commit();
            OpResult::ok(name, "node dropped")
        }
        Err(e) => {
            txn.abort();
            OpResult::fail(name, e.to_string())
        }
    }
}

/// Takes a stopped node out of the cluster: verifies the process is down,
/// unwinds its routing or synchronous-standby footprint, and flips
/// `in_cluster = false`. The row itself survives for a later `drop`.
pub async fn remove_node(ctx: &ManagerCtx, name: &str) -> Vec<OpResult> {
    let mut txn = ctx.catalog.begin().await;
    let Some(row) = txn.select_by_name(name) else {
        txn.abort();
        return vec![OpResult::fail(name, "node does not exist")];
    };
    if !row.in_cluster {
        txn.abort();
        return vec![OpResult::fail(name, "node is not in the cluster")];
    }
    let host = match txn.host_of(&row) {
        Ok(h) => h,
        Err(e) => {
            txn.abort();
            return vec![OpResult::fail(name, e.to_string())];
        }
    };

    if ping_node(&host.address, row.port, &host.os_user).await == PingStatus::Ok {
        txn.abort();
        return vec![OpResult::fail(name, "node is still running; stop it first")];
    }

    let mut results = Vec::new();

    if row.role.is_master() {
        if !txn.slaves_of(row.id).is_empty() {
            txn.abort();
            return vec![OpResult::fail(name, "master still has slaves")];
        }
        if row.role.family() != NodeFamily::Gtm {
            // Drop the routing entry under the cluster lock so the edit is
            // atomic with respect to user transactions.
            let coordinators: Vec<_> = txn
                .select_where(&NodePredicate {
                    role: Some(NodeRole::CoordMaster),
                    in_cluster: Some(true),
                    ..NodePredicate::default()
                })
                .into_iter()
                .filter(|c| c.id != row.id)
                .filter_map(|c| txn.host_of(&c).ok().map(|h| (c, h)))
                .collect();
            if !coordinators.is_empty() {
                match ClusterLock::acquire(
                    &coordinators,
                    &ctx.config.manager_address,
                    &ctx.config.default_db,
                )
                .await
                {
                    Ok(lock) => {
                        let report = drop_node_on_coordinators(
                            &coordinators,
                            &ctx.config.default_db,
                            &row.name,
                        )
                        .await;
                        for failure in report.failures {
                            results.push(OpResult::fail(name, failure.to_string()));
                        }
                        if let Err(e) = lock.release().await {
                            results.push(OpResult::fail(name, e.to_string()));
                        }
                    }
                    Err(e) => {
                        txn.abort();
                        return vec![OpResult::fail(name, e.to_string())];
                    }
                }
            }
        }
    } else if let Some(master_id) = row.master_id {
        // Rewrite the master's synchronous-standby list without this slave
        // and retract the replication HBA rule append installed for it.
        if let Some(master) = txn.select_by_id(master_id) {
            if let Ok(master_host) = txn.host_of(&master) {
                let hba = HbaLine::trust("replication", &master_host.os_user, &host.address, 32);
                let retract = async {
                    let mut agent = AgentClient::connect_host(&master_host).await?;
                    agent
                        .run_payload(
                            CommandPayload::new(AgentCmd::ConfDeleteHbaLine)
                                .blob(&HbaLine::payload_for(
                                    &format!("{}/pg_hba.conf", master.path),
                                    std::slice::from_ref(&hba),
                                ))
                                .into_msg(),
                        )
                        .await?;
                    agent
                        .run(AgentCmd::reload(master.role.family()), &[&master.path])
                        .await
                };
                if let Err(e) = retract.await {
                    results.push(OpResult::fail(name, format!("hba retraction: {e}")));
                }
                let siblings = txn.slaves_of(master.id);
                let plan = plan_sync_standby(&siblings, Some(row.id), None);
                for upgraded in &plan.upgrades {
                    if let Some(mut sibling) = txn.select_by_id(*upgraded) {
                        sibling.sync_state = SyncState::Sync;
                        if let Err(e) = txn.update_in_place(&sibling) {
                            results.push(OpResult::fail(name, e.to_string()));
                        }
                    }
                }
                if let Some(warning) = &plan.warning {
                    results.push(OpResult::ok(name, warning.clone()));
                }
                if let Err(e) = apply_sync_standby(
                    &master_host,
                    &master,
                    &ctx.config.default_db,
                    &plan.value,
                )
                .await
                {
                    results.push(OpResult::fail(name, e.to_string()));
                }
            }
        }
    }

    let mut updated = row.clone();
    updated.in_cluster = false;
    match txn.update_in_place(&updated) {
        Ok(()) => {
            txn.commit();
            info!("node \"{name}\" removed from the cluster");
            results.push(OpResult::ok(name, "node removed from the cluster"));
        }
        Err(e) => {
            txn.abort();
            results.push(OpResult::fail(name, e.to_string()));
        }
    }
    results
}

/// The append verb: optionally creates the row from the given attributes,
/// then joins it to the running cluster.
pub async fn append(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> Vec<OpResult> {
    if !attrs.is_empty() {
        let exists = {
            let txn = ctx.catalog.begin().await;
            let exists = txn.select_by_name(name).is_some();
            txn.abort();
            exists
        };
        if !exists {
            let created = add_node(ctx, name, attrs).await;
            if !created.success {
                return vec![created];
            }
        }
    }

    match append_node(
        &ctx.catalog,
        name,
        &ctx.config.default_db,
        &ctx.config.manager_address,
    )
    .await
    {
        Ok(diagnostics) if diagnostics.is_empty() => {
            vec![OpResult::ok(name, "node appended to the cluster")]
        }
        Ok(diagnostics) => {
            vec![OpResult::ok(
                name,
                format!("node appended to the cluster ({})", diagnostics.join("; ")),
            )]
        }
        Err(BerylMgrError::NodeNotFound(_)) => {
            vec![OpResult::fail(
                name,
                "node does not exist; pass host=/port=/path=/role= to create it",
            )]
        }
        Err(e) => vec![OpResult::fail(name, e.to_string())],
    }
}
