// src/core/switcher/engine.rs

//! The failover procedures: old-master classification, promotion-candidate
//! ranking, and the switch itself. Everything here runs inside one catalog
//! transaction per row; the transaction is the only rollback point, and
//! the catalog flip after a confirmed promotion is the single
//! catalog-visible commit boundary. Failures after that boundary are
//! collected into diagnostics instead of aborting.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::agent::{AgentClient, AgentCmd, CommandPayload, ConfEdit};
use crate::core::catalog::{
    Catalog, CatalogTxn, CureStatus, HostRow, NodeFamily, NodePredicate, NodeRole, NodeRow,
    ShutdownMode, SyncState,
};
use crate::core::errors::BerylMgrError;
use crate::core::lock::ClusterLock;
use crate::core::pgclient::PgClient;
use crate::core::probe::{PingStatus, ping_agent, ping_node_retry};
use crate::core::routing::{RoutingReport, alter_node_on_coordinators};
use crate::core::standby::{VERIFY_ATTEMPTS, VERIFY_BACKOFF, apply_sync_standby, plan_sync_standby};
use crate::core::wal::WalLsn;

/// Attempts used when classifying the old master.
const CLASSIFY_PING_ATTEMPTS: usize = 10;

/// Bounded spin waiting for a promoted node to leave recovery mode.
const PROMOTE_WAIT_ATTEMPTS: usize = 30;
const PROMOTE_WAIT_BACKOFF: Duration = Duration::from_secs(1);

/// Knobs a switch procedure runs under.
#[derive(Debug, Clone)]
pub struct SwitchSettings {
    /// Accept data loss: fall through sync and potential slaves to async
    /// ones, and accept candidates whose serving port is down as long as
    /// their agent answers.
    pub force_switch: bool,
    /// The additional operator token required to promote a candidate whose
    /// agent does not answer either.
    pub force_confirm: bool,
    pub default_db: String,
    /// The manager's own address, pushed into coordinator HBA rules by the
    /// cluster lock when needed.
    pub manager_address: String,
}

/// What a completed (or deliberately skipped) switch looked like.
#[derive(Debug, Clone, Default)]
pub struct SwitchOutcome {
    /// False when the procedure decided no switch was needed.
    pub switched: bool,
    pub new_master: Option<String>,
    /// Collected post-boundary failures; non-empty diagnostics downgrade
    /// the verb result to failure-with-diagnostics.
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunningMode {
    Master,
    Recovery,
}

/// One probed slave of the old master.
#[derive(Debug, Clone)]
struct SlaveState {
    row: NodeRow,
    host: HostRow,
    running: bool,
    mode: Option<RunningMode>,
    wal_lsn: WalLsn,
}

/// Classifies and, when warranted, switches one master row. The row must
/// already be fenced (`cure_status = switching`) and is the caller's
/// in-memory copy; any divergence from the stored row aborts the
/// procedure without touching the catalog.
pub async fn check_and_switch(
    catalog: &Catalog,
    node: &NodeRow,
    node_host: &HostRow,
    settings: &SwitchSettings,
) -> Result<SwitchOutcome, BerylMgrError> {
    let family = node.role.family();
    if !node.role.is_master() || family == NodeFamily::Coordinator {
        return Err(BerylMgrError::InvariantViolation(format!(
            "switching is supported for datanode and gtm masters, not {}",
            node.role
        )));
    }

    // Old-master classification: a 10-attempt probe plus an explicit
    // "am I in master mode" question.
    let old_master_state = classify_old_master(node, node_host, &settings.default_db).await;

    let mut txn = catalog.begin().await;
    let result = run_in_txn(&mut txn, node, node_host, old_master_state, settings, family).await;
    match result {
        Ok(outcome) => {
            txn.commit();
            Ok(outcome)
        }
        Err(e) => {
            txn.abort();
            Err(e)
        }
    }
}

/// The old master's observed condition: `Some(lsn)` when it is reachable
/// and running in master mode, `None` otherwise.
async fn classify_old_master(
    node: &NodeRow,
    host: &HostRow,
    default_db: &str,
) -> Option<WalLsn> {
    if ping_node_retry(&host.address, node.port, &host.os_user, CLASSIFY_PING_ATTEMPTS).await
        != PingStatus::Ok
    {
        return None;
    }
    let mut conn = PgClient::connect(&host.address, node.port, &host.os_user, default_db)
        .await
        .ok()?;
    let in_recovery = conn.query_single("SELECT pg_is_in_recovery();").await.ok()??;
    if in_recovery != "f" {
        conn.close().await;
        return None;
    }
    let lsn = conn
        .query_single("SELECT pg_current_wal_lsn();")
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse::<WalLsn>().ok())
        .unwrap_or(WalLsn::ZERO);
    conn.close().await;
    Some(lsn)
}

async fn run_in_txn(
    txn: &mut CatalogTxn,
    node: &NodeRow,
    node_host: &HostRow,
    old_master_state: Option<WalLsn>,
    settings: &SwitchSettings,
    family: NodeFamily,
) -> Result<SwitchOutcome, BerylMgrError> {
    check_catalog_consistent(txn, node)?;

    let (mut running, failed) = gather_slaves(txn, node, settings).await?;
    // The better slave node is in front of the list.
    running.sort_by(|a, b| b.wal_lsn.cmp(&a.wal_lsn).then(a.row.id.cmp(&b.row.id)));

    match old_master_state {
        Some(old_lsn) => {
            // Normal-master-regained: only continue a switch that an earlier
            // run left half-done, i.e. a slave already running in master
            // mode at or beyond the old master's position.
            let continued = choose_candidate(&running, &failed, settings, Some(old_lsn))
                .await
                .filter(|c| {
                    c.mode == Some(RunningMode::Master)
                        && c.wal_lsn >= old_lsn
                        && c.wal_lsn.is_valid()
                });
            match continued {
                Some(candidate) => {
                    info!(
                        "\"{}\": slave \"{}\" is already in master mode at {}, continuing the interrupted switch",
                        node.name, candidate.row.name, candidate.wal_lsn
                    );
                    switch_master(txn, node, node_host, candidate, running, failed, settings, family)
                        .await
                }
                None => {
                    info!("\"{}\": old master back to normal, abort switch", node.name);
                    txn.update_cure_status(node.id, CureStatus::Switching, CureStatus::Normal)?;
                    Ok(SwitchOutcome::default())
                }
            }
        }
        None => {
            let candidate = choose_candidate(&running, &failed, settings, None)
                .await
                .ok_or_else(|| {
                    BerylMgrError::InvariantViolation(format!(
                        "master \"{}\" has no promotable slave",
                        node.name
                    ))
                })?;
            switch_master(txn, node, node_host, candidate, running, failed, settings, family).await
        }
    }
}

/// Re-reads the row and asserts it still matches the in-memory copy the
/// decision was based on. Any mismatch is a `CatalogConflict` aborting the
/// sub-transaction.
fn check_catalog_consistent(txn: &CatalogTxn, mem: &NodeRow) -> Result<(), BerylMgrError> {
    let db = txn.select_by_id(mem.id).ok_or_else(|| {
        BerylMgrError::CatalogConflict(format!("node \"{}\": row no longer exists", mem.name))
    })?;
    if !db.allow_cure {
        return Err(BerylMgrError::CatalogConflict(format!(
            "node \"{}\": cure not allowed",
            db.name
        )));
    }
    if db.role != mem.role {
        return Err(BerylMgrError::CatalogConflict(format!(
            "node \"{}\": role changed to {}",
            db.name, db.role
        )));
    }
    if !matches!(db.cure_status, CureStatus::WaitSwitch | CureStatus::Switching) {
        return Err(BerylMgrError::CatalogConflict(format!(
            "node \"{}\": cure status {} is not my duty",
            db.name, db.cure_status
        )));
    }
    if db.cure_status != mem.cure_status {
        return Err(BerylMgrError::CatalogConflict(format!(
            "node \"{}\": cure status changed from {} to {}",
            db.name, mem.cure_status, db.cure_status
        )));
    }
    if !db.identical_except_cure(mem) {
        return Err(BerylMgrError::CatalogConflict(format!(
            "node \"{}\": data has changed in database",
            db.name
        )));
    }
    Ok(())
}

/// Probes every slave of the old master and splits them into running and
/// failed sets, reading each running slave's mode and WAL position.
async fn gather_slaves(
    txn: &CatalogTxn,
    node: &NodeRow,
    settings: &SwitchSettings,
) -> Result<(Vec<SlaveState>, Vec<SlaveState>), BerylMgrError> {
    let mut running = Vec::new();
    let mut failed = Vec::new();
    for row in txn.slaves_of(node.id) {
        let host = txn.host_of(&row)?;
        let mut state = SlaveState {
            row,
            host,
            running: false,
            mode: None,
            wal_lsn: WalLsn::ZERO,
        };
        if ping_node_retry(&state.host.address, state.row.port, &state.host.os_user, 3).await
            == PingStatus::Ok
        {
            if let Ok(mut conn) = PgClient::connect(
                &state.host.address,
                state.row.port,
                &state.host.os_user,
                &settings.default_db,
            )
            .await
            {
                let in_recovery = conn
                    .query_single("SELECT pg_is_in_recovery();")
                    .await
                    .ok()
                    .flatten();
                state.mode = match in_recovery.as_deref() {
                    Some("f") => Some(RunningMode::Master),
                    Some(_) => Some(RunningMode::Recovery),
                    None => None,
                };
                let lsn_sql = match state.mode {
                    Some(RunningMode::Master) => "SELECT pg_current_wal_lsn();",
                    _ => "SELECT pg_last_wal_replay_lsn();",
                };
                state.wal_lsn = conn
                    .query_single(lsn_sql)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse::<WalLsn>().ok())
                    .unwrap_or(WalLsn::ZERO);
                state.running = state.mode.is_some();
                conn.close().await;
            }
        }
        if state.running {
            running.push(state);
        } else {
            failed.push(state);
        }
    }
    Ok((running, failed))
}

/// Ranks the promotion candidate: sync slaves first, then potential, then
/// (only under force) async; within a tier, highest WAL position wins with
/// the scan order breaking ties. Under force, a candidate whose serving
/// port is down is acceptable if its agent answers; promoting past a dead
/// agent additionally requires the operator's confirm token.
async fn choose_candidate(
    running: &[SlaveState],
    failed: &[SlaveState],
    settings: &SwitchSettings,
    floor: Option<WalLsn>,
) -> Option<SlaveState> {
    let mut tiers = vec![SyncState::Sync, SyncState::Potential];
    if settings.force_switch {
        tiers.push(SyncState::Async);
    }

    for tier in &tiers {
        let best = running
            .iter()
            .filter(|s| s.row.sync_state == *tier)
            .filter(|s| floor.is_none_or(|f| s.wal_lsn >= f))
            .max_by(|a, b| a.wal_lsn.cmp(&b.wal_lsn).then(b.row.id.cmp(&a.row.id)));
        if let Some(best) = best {
            return Some(best.clone());
        }
    }

    if !settings.force_switch {
        return None;
    }

    for tier in &tiers {
        for slave in failed.iter().filter(|s| s.row.sync_state == *tier) {
            if ping_agent(&slave.host.address, slave.host.agent_port).await == PingStatus::Ok {
                warn!(
                    "force switch: accepting \"{}\" whose serving port is down but whose agent answers",
                    slave.row.name
                );
                return Some(slave.clone());
            }
            if settings.force_confirm {
                warn!(
                    "force switch confirmed by operator: accepting \"{}\" with agent unreachable",
                    slave.row.name
                );
                return Some(slave.clone());
            }
        }
    }
    None
}

/// The master-failed procedure proper, also entered by the
/// normal-master-regained path when it finds a half-promoted slave.
#[allow(clippy::too_many_arguments)]
async fn switch_master(
    txn: &mut CatalogTxn,
    old: &NodeRow,
    old_host: &HostRow,
    candidate: SlaveState,
    running: Vec<SlaveState>,
    failed: Vec<SlaveState>,
    settings: &SwitchSettings,
    family: NodeFamily,
) -> Result<SwitchOutcome, BerylMgrError> {
    let coordinators = in_cluster_coordinators(txn)?;
    let mut diagnostics: Vec<String> = Vec::new();
    // Coordinators (or, for GTM, conf targets) already re-pointed, kept so
    // an abort can revert the partial change.
    let mut routed: Vec<(NodeRow, HostRow)> = Vec::new();

    let lock =
        ClusterLock::acquire(&coordinators, &settings.manager_address, &settings.default_db)
            .await?;

    let promoted = promote_and_reconfigure(
        txn,
        old,
        old_host,
        &candidate,
        &running,
        &failed,
        &coordinators,
        settings,
        family,
        &mut diagnostics,
        &mut routed,
    )
    .await;

    match promoted {
        Ok(new_master) => {
            if let Err(e) = lock.release().await {
                diagnostics.push(e.to_string());
            }
            Ok(SwitchOutcome {
                switched: true,
                new_master: Some(new_master.name),
                diagnostics,
            })
        }
        Err(e) => {
            // Undo any coordinator-side partial change before giving the
            // row back to the next tick.
            revert_routing(old, old_host, &routed, settings, family).await;
            if let Err(release_err) = lock.release().await {
                warn!("cluster unlock after failed switch: {release_err}");
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn promote_and_reconfigure(
    txn: &mut CatalogTxn,
    old: &NodeRow,
    old_host: &HostRow,
    candidate: &SlaveState,
    running: &[SlaveState],
    failed: &[SlaveState],
    coordinators: &[(NodeRow, HostRow)],
    settings: &SwitchSettings,
    family: NodeFamily,
    diagnostics: &mut Vec<String>,
    routed: &mut Vec<(NodeRow, HostRow)>,
) -> Result<NodeRow, BerylMgrError> {
    // Step 5: stop the old master, immediate mode. We already decided it is
    // dead; errors here are informational.
    match AgentClient::connect_host(old_host).await {
        Ok(mut agent) => {
            if let Err(e) = agent
                .run(
                    AgentCmd::stop(family),
                    &[&old.path, &ShutdownMode::Immediate.to_string()],
                )
                .await
            {
                info!("stopping old master \"{}\": {e}", old.name);
            }
        }
        Err(e) => info!("stopping old master \"{}\": {e}", old.name),
    }

    // Step 6: promote the candidate, unless an earlier run already did.
    if candidate.mode != Some(RunningMode::Master) {
        let mut agent = AgentClient::connect_host(&candidate.host).await?;
        agent
            .run(AgentCmd::promote(family), &[&candidate.row.path])
            .await?;
    }

    // Step 7: wait until the new master answers in non-recovery mode.
    wait_until_master_mode(&candidate.row, &candidate.host, &settings.default_db).await?;

    // Step 8: re-point routing (or, for GTM, the agtm address of every
    // dependent node). Partial failures downgrade the result but do not
    // abort: the promotion itself has succeeded.
    match family {
        NodeFamily::Datanode => {
            let report = alter_node_on_coordinators(
                coordinators,
                &settings.default_db,
                &old.name,
                &candidate.host.address,
                candidate.row.port,
            )
            .await;
            note_routing(report, coordinators, diagnostics, routed);
        }
        NodeFamily::Gtm => {
            let targets = gtm_refresh_targets(txn, coordinators)?;
            for (target, target_host) in &targets {
                match refresh_gtm_address(
                    target,
                    target_host,
                    &candidate.host.address,
                    candidate.row.port,
                    &settings.default_db,
                )
                .await
                {
                    Ok(()) => routed.push((target.clone(), target_host.clone())),
                    Err(e) => diagnostics
                        .push(format!("gtm address refresh failed on {}: {e}", target.name)),
                }
            }
            for (coord, coord_host) in coordinators {
                if let Err(e) = reload_pool(coord, coord_host, &settings.default_db).await {
                    diagnostics.push(format!("pool reload failed on {}: {e}", coord.name));
                }
            }
        }
        NodeFamily::Coordinator => unreachable!("coordinator masters are not switched"),
    }

    // Step 9: rewrite the synchronous-standby list on the new master from
    // the surviving slave set.
    let survivors: Vec<NodeRow> = running
        .iter()
        .chain(failed.iter())
        .filter(|s| s.row.id != candidate.row.id)
        .map(|s| s.row.clone())
        .collect();
    let plan = plan_sync_standby(&survivors, None, None);
    for notice in &plan.notices {
        info!("\"{}\": {notice}", old.name);
    }
    if let Some(warning) = &plan.warning {
        warn!("\"{}\": {warning}", old.name);
        diagnostics.push(warning.clone());
    }

    apply_sync_standby(&candidate.host, &candidate.row, &settings.default_db, &plan.value)
        .await?;

    // Step 10: the commit boundary. Delete the old master row and flip the
    // chosen slave into its place. Everything before this point can be
    // retried; everything after it only accumulates diagnostics.
    txn.delete(old.id)?;
    let mut new_master = candidate.row.clone();
    new_master.role = NodeRole::master_of(family);
    new_master.sync_state = SyncState::None;
    new_master.master_id = None;
    new_master.cure_status = CureStatus::Normal;
    txn.update_in_place(&new_master)?;

    // Step 11: re-point every surviving slave at the new master. Failed
    // slaves get the catalog update only; their hosts are down.
    for slave in running.iter().filter(|s| s.row.id != candidate.row.id) {
        let mut row = slave.row.clone();
        row.master_id = Some(new_master.id);
        if plan.upgrades.contains(&row.id) {
            row.sync_state = SyncState::Sync;
        }
        txn.update_in_place(&row)?;
        if let Err(e) = repoint_slave(slave, &new_master, &candidate.host, family).await {
            diagnostics.push(format!("slave \"{}\" not reconfigured: {e}", slave.row.name));
        }
    }
    for slave in failed.iter().filter(|s| s.row.id != candidate.row.id) {
        let mut row = slave.row.clone();
        row.master_id = Some(new_master.id);
        if plan.upgrades.contains(&row.id) {
            row.sync_state = SyncState::Sync;
        }
        txn.update_in_place(&row)?;
        diagnostics.push(format!(
            "slave \"{}\" kept but not restarted: host unreachable",
            slave.row.name
        ));
    }

    let has_live_sync = running
        .iter()
        .filter(|s| s.row.id != candidate.row.id)
        .any(|s| s.row.sync_state == SyncState::Sync || plan.upgrades.contains(&s.row.id));
    if !has_live_sync {
        let warning = format!(
            "cluster has no live synchronous replica after switching \"{}\"",
            old.name
        );
        warn!("{warning}");
        diagnostics.push(warning);
    }

    Ok(new_master)
}

fn note_routing(
    report: RoutingReport,
    coordinators: &[(NodeRow, HostRow)],
    diagnostics: &mut Vec<String>,
    routed: &mut Vec<(NodeRow, HostRow)>,
) {
    for name in &report.succeeded {
        if let Some(pair) = coordinators.iter().find(|(c, _)| &c.name == name) {
            routed.push(pair.clone());
        }
    }
    for failure in &report.failures {
        diagnostics.push(failure.to_string());
    }
}

/// Re-points already-updated coordinators (or GTM conf targets) back at the
/// old master after an abort, so a half-switched cluster is not left
/// routing to an unpromoted slave.
async fn revert_routing(
    old: &NodeRow,
    old_host: &HostRow,
    routed: &[(NodeRow, HostRow)],
    settings: &SwitchSettings,
    family: NodeFamily,
) {
    if routed.is_empty() {
        return;
    }
    warn!(
        "reverting partial routing change on {} node(s) back to \"{}\"",
        routed.len(),
        old.name
    );
    match family {
        NodeFamily::Datanode => {
            let report = alter_node_on_coordinators(
                routed,
                &settings.default_db,
                &old.name,
                &old_host.address,
                old.port,
            )
            .await;
            for failure in report.failures {
                warn!("revert: {failure}");
            }
        }
        NodeFamily::Gtm => {
            for (target, target_host) in routed {
                if let Err(e) = refresh_gtm_address(
                    target,
                    target_host,
                    &old_host.address,
                    old.port,
                    &settings.default_db,
                )
                .await
                {
                    warn!("revert of gtm address on {}: {e}", target.name);
                }
            }
        }
        NodeFamily::Coordinator => {}
    }
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

/// GTM failover touches every in-cluster coordinator and datanode, master
/// and slave alike.
fn gtm_refresh_targets(
    txn: &CatalogTxn,
    coordinators: &[(NodeRow, HostRow)],
) -> Result<Vec<(NodeRow, HostRow)>, BerylMgrError> {
    let mut targets: Vec<(NodeRow, HostRow)> = coordinators.to_vec();
    for role in [NodeRole::DatanodeMaster, NodeRole::DatanodeSlave] {
        for row in txn.select_where(&NodePredicate {
            role: Some(role),
            in_cluster: Some(true),
            ..NodePredicate::default()
        }) {
            let host = txn.host_of(&row)?;
            targets.push((row, host));
        }
    }
    Ok(targets)
}

/// Rewrites `agtm_host`/`agtm_port` on one node and verifies the reload
/// took effect through `SHOW`, with the standard bounded retry.
async fn refresh_gtm_address(
    node: &NodeRow,
    host: &HostRow,
    gtm_address: &str,
    gtm_port: u16,
    default_db: &str,
) -> Result<(), BerylMgrError> {
    let mut agent = AgentClient::connect_host(host).await?;
    let edit = ConfEdit::new(format!("{}/postgresql.conf", node.path))
        .set("agtm_host", gtm_address)
        .set("agtm_port", gtm_port.to_string());
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshPostgresReload)
                .blob(&edit.payload())
                .into_msg(),
        )
        .await?;

    for attempt in 1..=VERIFY_ATTEMPTS {
        let hosts = agent
            .get_sql_strings(&host.os_user, node.port, default_db, "SHOW agtm_host")
            .await?;
        let ports = agent
            .get_sql_strings(&host.os_user, node.port, default_db, "SHOW agtm_port")
            .await?;
        if hosts.first().map(String::as_str) == Some(gtm_address)
            && ports.first().map(String::as_str) == Some(&gtm_port.to_string())
        {
            return Ok(());
        }
        if attempt < VERIFY_ATTEMPTS {
            sleep(VERIFY_BACKOFF).await;
        }
    }
    Err(BerylMgrError::RemoteCommandFailed(format!(
        "node \"{}\" did not pick up the new gtm address",
        node.name
    )))
}

async fn reload_pool(
    coord: &NodeRow,
    host: &HostRow,
    default_db: &str,
) -> Result<(), BerylMgrError> {
    let mut conn =
        PgClient::connect(&host.address, coord.port, &host.os_user, default_db).await?;
    let result = conn.execute("SELECT pgxc_pool_reload();").await;
    conn.close().await;
    result
}

/// Bounded spin on `pg_is_in_recovery()` until the promoted node reports
/// master mode.
async fn wait_until_master_mode(
    node: &NodeRow,
    host: &HostRow,
    default_db: &str,
) -> Result<(), BerylMgrError> {
    for attempt in 1..=PROMOTE_WAIT_ATTEMPTS {
        if let Ok(mut conn) =
            PgClient::connect(&host.address, node.port, &host.os_user, default_db).await
        {
            let answer = conn.query_single("SELECT pg_is_in_recovery();").await;
            conn.close().await;
            if let Ok(Some(v)) = answer {
                if v == "f" {
                    return Ok(());
                }
            }
        }
        if attempt < PROMOTE_WAIT_ATTEMPTS {
            sleep(PROMOTE_WAIT_BACKOFF).await;
        }
    }
    Err(BerylMgrError::RemoteCommandFailed(format!(
        "promoted node \"{}\" did not leave recovery mode",
        node.name
    )))
}

/// Rewrites a surviving slave's recovery configuration to follow the new
/// master and restarts it.
async fn repoint_slave(
    slave: &SlaveState,
    new_master: &NodeRow,
    new_master_host: &HostRow,
    family: NodeFamily,
) -> Result<(), BerylMgrError> {
    let mut agent = AgentClient::connect_host(&slave.host).await?;
    let conninfo = format!(
        "host={} port={} user={} application_name={}",
        new_master_host.address, new_master.port, slave.host.os_user, slave.row.name
    );
    let edit = ConfEdit::new(format!("{}/recovery.conf", slave.row.path))
        .set("standby_mode", "on")
        .set("primary_conninfo", conninfo)
        .set("recovery_target_timeline", "latest");
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshRecovery)
                .blob(&edit.payload())
                .into_msg(),
        )
        .await?;
    agent
        .run(
            AgentCmd::restart(family),
            &[&slave.row.path, &ShutdownMode::Smart.to_string()],
        )
        .await?;
    Ok(())
}
