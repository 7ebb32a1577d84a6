// src/core/ops/failover.rs

//! The manual failover verb. It runs the same procedure as the switcher,
//! in its own worker, fencing the row through the same cure-status CAS so
//! a concurrent switcher tick loses or wins cleanly.

use tracing::info;

use super::{ManagerCtx, OpResult};
use crate::core::catalog::{CureStatus, NodeFamily, NodeRole};
use crate::core::errors::BerylMgrError;
use crate::core::switcher::{SwitchSettings, check_and_switch};

pub async fn failover(
    ctx: &ManagerCtx,
    kind: &str,
    name: &str,
    force: bool,
    confirm: bool,
) -> Vec<OpResult> {
    let family = match kind {
        "datanode" => NodeFamily::Datanode,
        "gtm" => NodeFamily::Gtm,
        other => {
            return vec![OpResult::fail(
                name,
                format!("failover supports datanode and gtm, not \"{other}\""),
            )];
        }
    };

    // Fence the row. A row a doctor (or a previous run) already moved along
    // the lifecycle is picked up where it stands.
    let mut txn = ctx.catalog.begin().await;
    let Some(mut row) = txn.select_by_name(name) else {
        txn.abort();
        return vec![OpResult::fail(name, "node does not exist")];
    };
    if row.role != NodeRole::master_of(family) {
        txn.abort();
        return vec![OpResult::fail(
            name,
            format!("node is {}, expected {}", row.role, NodeRole::master_of(family)),
        )];
    }
    if !row.allow_cure {
        txn.abort();
        return vec![OpResult::fail(name, "cure is not allowed on this node")];
    }
    let host = match txn.host_of(&row) {
        Ok(h) => h,
        Err(e) => {
            txn.abort();
            return vec![OpResult::fail(name, e.to_string())];
        }
    };
    let fence = match row.cure_status {
        CureStatus::Normal => txn
            .update_cure_status(row.id, CureStatus::Normal, CureStatus::WaitSwitch)
            .and_then(|()| {
                txn.update_cure_status(row.id, CureStatus::WaitSwitch, CureStatus::Switching)
            }),
        CureStatus::WaitSwitch => {
            txn.update_cure_status(row.id, CureStatus::WaitSwitch, CureStatus::Switching)
        }
        CureStatus::Switching => Ok(()),
        other => Err(BerylMgrError::CatalogConflict(format!(
            "node \"{name}\" is busy: cure status {other}"
        ))),
    };
    if let Err(e) = fence {
        txn.abort();
        return vec![OpResult::fail(name, e.to_string())];
    }
    row.cure_status = CureStatus::Switching;
    txn.commit();

    let settings = SwitchSettings {
        force_switch: force || ctx.config.switcher.force_switch,
        force_confirm: confirm || ctx.config.switcher.force_confirm,
        default_db: ctx.config.default_db.clone(),
        manager_address: ctx.config.manager_address.clone(),
    };

    match check_and_switch(&ctx.catalog, &row, &host, &settings).await {
        Ok(outcome) if !outcome.switched => {
            info!("failover \"{name}\": old master is running normally");
            vec![OpResult::ok(
                name,
                "old master is running normally; no switch performed",
            )]
        }
        Ok(outcome) => {
            let new_master = outcome.new_master.unwrap_or_else(|| "?".to_string());
            if outcome.diagnostics.is_empty() {
                vec![OpResult::ok(name, format!("promoted \"{new_master}\""))]
            } else {
                // The catalog committed; residual failures go back to the
                // operator, who reconciles with `flush host`.
                vec![OpResult::fail(
                    name,
                    format!(
                        "promoted \"{new_master}\" with diagnostics: {}",
                        outcome.diagnostics.join("; ")
                    ),
                )]
            }
        }
        Err(e) => vec![OpResult::fail(name, e.to_string())],
    }
}
