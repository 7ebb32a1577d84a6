// src/core/ops/view.rs

//! Read-only views: catalog listings and the live monitor.

use super::{ManagerCtx, OpResult};
use crate::core::probe::{PingStatus, ping_node};

pub async fn list_nodes(ctx: &ManagerCtx) -> Vec<OpResult> {
    let (nodes, _) = ctx.catalog.snapshot().await;
    if nodes.is_empty() {
        return vec![OpResult::ok("nodes", "catalog is empty")];
    }
    nodes
        .into_iter()
        .map(|n| {
            OpResult::ok(
                &n.name,
                format!(
                    "role={} host={} port={} sync={} master={} inited={} in_cluster={} cure={}",
                    n.role,
                    n.host,
                    n.port,
                    n.sync_state,
                    n.master_id.map_or_else(|| "-".to_string(), |m| m.to_string()),
                    n.inited,
                    n.in_cluster,
                    n.cure_status,
                ),
            )
        })
        .collect()
}

pub async fn list_hosts(ctx: &ManagerCtx) -> Vec<OpResult> {
    let (_, hosts) = ctx.catalog.snapshot().await;
    if hosts.is_empty() {
        return vec![OpResult::ok("hosts", "no hosts registered")];
    }
    hosts
        .into_iter()
        .map(|h| {
            OpResult::ok(
                &h.name,
                format!(
                    "address={} agent_port={} user={}",
                    h.address, h.agent_port, h.os_user
                ),
            )
        })
        .collect()
}

/// Probes every in-cluster node and reports its serving status.
pub async fn monitor(ctx: &ManagerCtx) -> Vec<OpResult> {
    let (nodes, hosts) = ctx.catalog.snapshot().await;
    let mut results = Vec::new();
    for node in nodes.into_iter().filter(|n| n.in_cluster) {
        let Some(host) = hosts.iter().find(|h| h.id == node.host) else {
            results.push(OpResult::fail(&node.name, "host row is missing"));
            continue;
        };
        let status = ping_node(&host.address, node.port, &host.os_user).await;
        let running = status == PingStatus::Ok;
        let description = format!("{} {:?}", node.role, status);
        results.push(OpResult {
            name: node.name,
            success: running,
            description,
        });
    }
    if results.is_empty() {
        results.push(OpResult::ok("monitor", "no in-cluster node"));
    }
    results
}
