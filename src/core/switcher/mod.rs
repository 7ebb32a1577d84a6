// src/core/switcher/mod.rs

//! The switcher: a single background worker that watches the catalog for
//! master rows a doctor has flagged (`cure_status = wait-switch`), fences
//! them, classifies the old master, and drives the failover procedure.
//!
//! The worker is one cooperative loop. A wake-up signal triggers a reread
//! of its working set; if the set changed, a tagged reset error is thrown
//! to the top of the loop, which drops all in-memory rows and rescans.
//! A termination signal finishes the current iteration and exits.

pub mod engine;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::catalog::{Catalog, CureStatus, HostRow, NodeRow};
use crate::core::errors::BerylMgrError;

pub use engine::{SwitchOutcome, SwitchSettings, check_and_switch};

/// The background worker driving automatic failover.
pub struct SwitcherWorker {
    catalog: Catalog,
    settings: SwitchSettings,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    wakeup: Arc<Notify>,
}

impl SwitcherWorker {
    pub fn new(
        catalog: Catalog,
        settings: SwitchSettings,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            catalog,
            settings,
            interval,
            shutdown,
            wakeup,
        }
    }

    /// The outermost loop: catches the tagged reset and starts over with a
    /// fresh working set.
    pub async fn run(mut self) {
        info!(
            "switcher started: interval {:?}, force_switch {}",
            self.interval, self.settings.force_switch
        );
        loop {
            match self.run_until_reset().await {
                Err(BerylMgrError::SwitcherReset) => {
                    info!("switcher reset: dropping in-memory rows and rescanning");
                }
                Ok(()) => break,
                Err(e) => {
                    warn!("switcher loop error: {e}");
                }
            }
        }
        info!("switcher stopped");
    }

    async fn run_until_reset(&mut self) -> Result<(), BerylMgrError> {
        let mut working_set = self.scan_working_set().await;
        loop {
            for row in &working_set {
                if *self.shutdown.borrow() {
                    return Ok(());
                }
                self.process_row(row).await;
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = self.wakeup.notified() => {
                    // Configuration reread: if the working set changed under
                    // us, reset instead of acting on stale rows.
                    let fresh = self.scan_working_set().await;
                    if fresh != working_set {
                        return Err(BerylMgrError::SwitcherReset);
                    }
                }
                _ = self.shutdown.changed() => return Ok(()),
            }
            if *self.shutdown.borrow() {
                return Ok(());
            }
            working_set = self.scan_working_set().await;
        }
    }

    /// Rows the switcher is responsible for: masters flagged wait-switch,
    /// plus switching rows left behind by an interrupted run.
    async fn scan_working_set(&self) -> Vec<NodeRow> {
        let txn = self.catalog.begin().await;
        let rows: Vec<NodeRow> = txn
            .select_where(&Default::default())
            .into_iter()
            .filter(|n| n.role.is_master() && n.allow_cure)
            .filter(|n| {
                matches!(
                    n.cure_status,
                    CureStatus::WaitSwitch | CureStatus::Switching
                )
            })
            .collect();
        txn.abort();
        rows
    }

    async fn process_row(&self, row: &NodeRow) {
        let fenced = match self.fence_row(row).await {
            Ok(Some(fenced)) => fenced,
            Ok(None) => return,
            Err(BerylMgrError::CatalogConflict(reason)) => {
                // Another worker owns the row; skip without side effects.
                debug!("\"{}\": {reason}", row.name);
                return;
            }
            Err(e) => {
                warn!("fencing \"{}\": {e}", row.name);
                return;
            }
        };

        match check_and_switch(&self.catalog, &fenced.0, &fenced.1, &self.settings).await {
            Ok(outcome) if outcome.switched => {
                if outcome.diagnostics.is_empty() {
                    info!(
                        "\"{}\" switched to \"{}\"",
                        row.name,
                        outcome.new_master.as_deref().unwrap_or("?")
                    );
                } else {
                    warn!(
                        "\"{}\" switched to \"{}\" with diagnostics: {}",
                        row.name,
                        outcome.new_master.as_deref().unwrap_or("?"),
                        outcome.diagnostics.join("; ")
                    );
                }
            }
            Ok(_) => {}
            Err(BerylMgrError::CatalogConflict(reason)) => {
                debug!("\"{}\": {reason}", row.name);
            }
            Err(e) => {
                // The row stays fenced; the next tick retries.
                warn!("switch of \"{}\" pending: {e}", row.name);
            }
        }
    }

    /// Fences one row with the wait-switch to switching CAS and returns the
    /// in-memory copy the engine will work from, together with its host.
    async fn fence_row(
        &self,
        row: &NodeRow,
    ) -> Result<Option<(NodeRow, HostRow)>, BerylMgrError> {
        let mut txn = self.catalog.begin().await;
        let Some(mut current) = txn.select_by_id(row.id) else {
            txn.abort();
            return Ok(None);
        };
        if !current.allow_cure || !current.role.is_master() {
            txn.abort();
            return Ok(None);
        }
        let host = txn.host_of(&current)?;
        match current.cure_status {
            CureStatus::WaitSwitch => {
                txn.update_cure_status(row.id, CureStatus::WaitSwitch, CureStatus::Switching)?;
                current.cure_status = CureStatus::Switching;
                txn.commit();
                Ok(Some((current, host)))
            }
            // An interrupted run left the fence in place; resume it.
            CureStatus::Switching => {
                txn.abort();
                Ok(Some((current, host)))
            }
            _ => {
                txn.abort();
                Ok(None)
            }
        }
    }
}
