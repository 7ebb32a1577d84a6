// src/core/ops/control.rs

//! Process-control verbs (init, start, stop, restart, clean) and the
//! `flush host` routing reconciler.

use std::str::FromStr;

use tracing::info;

use super::{Attrs, ManagerCtx, OpResult};
use crate::core::agent::{AgentClient, AgentCmd};
use crate::core::catalog::{HostRow, NodePredicate, NodeRole, NodeRow, ShutdownMode};
use crate::core::errors::BerylMgrError;
use crate::core::pgclient::PgClient;

async fn node_and_host(
    ctx: &ManagerCtx,
    name: &str,
) -> Result<(NodeRow, HostRow), BerylMgrError> {
    let txn = ctx.catalog.begin().await;
    let row = txn
        .select_by_name(name)
        .ok_or_else(|| BerylMgrError::NodeNotFound(name.to_string()))?;
    let host = txn.host_of(&row)?;
    txn.abort();
    Ok((row, host))
}

pub async fn init_node(ctx: &ManagerCtx, name: &str) -> OpResult {
    let (row, host) = match node_and_host(ctx, name).await {
        Ok(pair) => pair,
        Err(e) => return OpResult::fail(name, e.to_string()),
    };
    if row.inited {
        return OpResult::fail(name, "node is already initialized");
    }
    let port = row.port.to_string();
    let result = async {
        let mut agent = AgentClient::connect_host(&host).await?;
        let exists = agent.run(AgentCmd::CheckDirExist, &[&row.path]).await?;
        if exists.as_ref() == b"t" {
            return Err(BerylMgrError::RemoteCommandFailed(format!(
                "data directory {} already exists",
                row.path
            )));
        }
        agent
            .run(AgentCmd::init(row.role.family()), &[&row.path, &port])
            .await
    }
    .await;
    match result {
        Ok(_) => {
            let mut txn = ctx.catalog.begin().await;
            if let Some(mut fresh) = txn.select_by_name(name) {
                fresh.inited = true;
                if txn.update_in_place(&fresh).is_ok() {
                    txn.commit();
                    return OpResult::ok(name, "node initialized");
                }
            }
            txn.abort();
            OpResult::fail(name, "node initialized but the catalog update failed")
        }
        Err(e) => OpResult::fail(name, e.to_string()),
    }
}

pub async fn start_node(ctx: &ManagerCtx, name: &str) -> OpResult {
    run_lifecycle(ctx, name, |family| AgentCmd::start(family), None).await
}

pub async fn stop_node(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> OpResult {
    run_lifecycle(ctx, name, |family| AgentCmd::stop(family), shutdown_mode(attrs)).await
}

pub async fn restart_node(ctx: &ManagerCtx, name: &str, attrs: &Attrs) -> OpResult {
    run_lifecycle(ctx, name, |family| AgentCmd::restart(family), shutdown_mode(attrs)).await
}

fn shutdown_mode(attrs: &Attrs) -> Option<ShutdownMode> {
    Some(
        attrs
            .get("mode")
            .and_then(|m| ShutdownMode::from_str(m).ok())
            .unwrap_or(ShutdownMode::Fast),
    )
}

async fn run_lifecycle(
    ctx: &ManagerCtx,
    name: &str,
    cmd: impl Fn(crate::core::catalog::NodeFamily) -> AgentCmd,
    mode: Option<ShutdownMode>,
) -> OpResult {
    let (row, host) = match node_and_host(ctx, name).await {
        Ok(pair) => pair,
        Err(e) => return OpResult::fail(name, e.to_string()),
    };
    let result = async {
        let mut agent = AgentClient::connect_host(&host).await?;
        let mode_str;
        let mut args: Vec<&str> = vec![&row.path];
        if let Some(mode) = mode {
            mode_str = mode.to_string();
            args.push(&mode_str);
        }
        agent.run(cmd(row.role.family()), &args).await
    }
    .await;
    match result {
        Ok(_) => OpResult::ok(name, "done"),
        Err(e) => OpResult::fail(name, e.to_string()),
    }
}

/// Wipes the data directory of a node that has left the cluster and clears
/// its `inited` flag, making the row eligible for a fresh init or drop.
pub async fn clean_node(ctx: &ManagerCtx, name: &str) -> OpResult {
    let (row, host) = match node_and_host(ctx, name).await {
        Ok(pair) => pair,
        Err(e) => return OpResult::fail(name, e.to_string()),
    };
    if row.in_cluster {
        return OpResult::fail(name, "node is in the cluster; remove it first");
    }
    let result = async {
        let mut agent = AgentClient::connect_host(&host).await?;
        agent
            .run(AgentCmd::clean_dir(row.role.family()), &[&row.path])
            .await
    }
    .await;
    match result {
        Ok(_) => {
            let mut txn = ctx.catalog.begin().await;
            if let Some(mut fresh) = txn.select_by_name(name) {
                fresh.inited = false;
                if txn.update_in_place(&fresh).is_ok() {
                    txn.commit();
                    return OpResult::ok(name, "data directory cleaned");
                }
            }
            txn.abort();
            OpResult::fail(name, "directory cleaned but the catalog update failed")
        }
        Err(e) => OpResult::fail(name, e.to_string()),
    }
}

pub async fn clean_all(ctx: &ManagerCtx) -> Vec<OpResult> {
    let (nodes, _) = ctx.catalog.snapshot().await;
    let mut results = Vec::new();
    for node in nodes.into_iter().filter(|n| !n.in_cluster && n.inited) {
        results.push(clean_node(ctx, &node.name).await);
    }
    if results.is_empty() {
        results.push(OpResult::ok("clean", "nothing to clean"));
    }
    results
}

/// Reconciles every in-cluster coordinator's routing table against the
/// catalog: entries for unknown nodes are dropped, missing masters are
/// created, mismatched addresses are re-pointed. This is the repair path
/// after a partial routing failure during a switch.
pub async fn flush_host(ctx: &ManagerCtx) -> Vec<OpResult> {
    let txn = ctx.catalog.begin().await;
    let coordinators: Vec<(NodeRow, HostRow)> = txn
        .select_where(&NodePredicate {
            role: Some(NodeRole::CoordMaster),
            in_cluster: Some(true),
            ..NodePredicate::default()
        })
        .into_iter()
        .filter_map(|c| txn.host_of(&c).ok().map(|h| (c, h)))
        .collect();

    // The desired routing table: every in-cluster coordinator and datanode
    // master, addressed as the catalog records them.
    let mut desired: Vec<(NodeRow, HostRow, &'static str)> = Vec::new();
    for (role, kind) in [
        (NodeRole::DatanodeMaster, "datanode"),
        (NodeRole::CoordMaster, "coordinator"),
    ] {
        for node in txn.select_where(&NodePredicate {
            role: Some(role),
            in_cluster: Some(true),
            ..NodePredicate::default()
        }) {
            if let Ok(host) = txn.host_of(&node) {
                desired.push((node, host, kind));
            }
        }
    }
    txn.abort();

    let mut results = Vec::new();
    for (coord, host) in &coordinators {
        match reconcile_coordinator(coord, host, &desired, &ctx.config.default_db).await {
            Ok(changes) if changes == 0 => {
                results.push(OpResult::ok(&coord.name, "routing table is consistent"));
            }
            Ok(changes) => {
                info!("flush: {changes} routing change(s) on \"{}\"", coord.name);
                results.push(OpResult::ok(
                    &coord.name,
                    format!("routing table reconciled ({changes} change(s))"),
                ));
            }
            Err(e) => results.push(OpResult::fail(&coord.name, e.to_string())),
        }
    }
    if results.is_empty() {
        results.push(OpResult::ok("flush", "no in-cluster coordinator"));
    }
    results
}

async fn reconcile_coordinator(
    coord: &NodeRow,
    host: &HostRow,
    desired: &[(NodeRow, HostRow, &'static str)],
    default_db: &str,
) -> Result<usize, BerylMgrError> {
    let mut conn = PgClient::connect(&host.address, coord.port, &host.os_user, default_db).await?;
    let current = conn
        .simple_query("SELECT node_name, node_host, node_port FROM pgxc_node;")
        .await?;

    let mut changes = 0;
    for (node, node_host, kind) in desired {
        let entry = current.iter().find(|r| {
            r.first().and_then(|v| v.as_deref()) == Some(node.name.as_str())
        });
        match entry {
            None => {
                conn.execute(&format!(
                    "CREATE NODE \"{}\" WITH (TYPE='{kind}', HOST='{}', PORT={});",
                    node.name, node_host.address, node.port
                ))
                .await?;
                changes += 1;
            }
            Some(row) => {
                let address = row.get(1).and_then(|v| v.as_deref()).unwrap_or("");
                let port = row.get(2).and_then(|v| v.as_deref()).unwrap_or("");
                if address != node_host.address || port != node.port.to_string() {
                    conn.execute(&format!(
                        "ALTER NODE \"{}\" WITH (HOST='{}', PORT={});",
                        node.name, node_host.address, node.port
                    ))
                    .await?;
                    changes += 1;
                }
            }
        }
    }
    for row in &current {
        let entry_name = row.first().and_then(|v| v.as_deref()).unwrap_or("");
        if !entry_name.is_empty() && !desired.iter().any(|(n, _, _)| n.name == entry_name) {
            conn.execute(&format!("DROP NODE \"{entry_name}\";")).await?;
            changes += 1;
        }
    }
    if changes > 0 {
        conn.execute("SELECT pgxc_pool_reload();").await?;
    }
    conn.close().await;
    Ok(changes)
}
