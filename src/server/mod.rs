// src/server/mod.rs

//! The manager daemon: wires the catalog, the switcher worker, the admin
//! listener, and signal handling together.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{error, info};

mod listener;

pub use listener::run_listener;

use crate::config::Config;
use crate::core::catalog::Catalog;
use crate::core::ops::ManagerCtx;
use crate::core::switcher::{SwitchSettings, SwitcherWorker};

/// The main daemon loop. Returns only when every task has stopped.
pub async fn run(config: Config) -> Result<()> {
    // A unique run id, logged so operators can correlate manager restarts
    // with catalog changes.
    let mut run_id_bytes = [0u8; 20];
    getrandom::fill(&mut run_id_bytes).map_err(|e| anyhow!("failed to seed run id: {e}"))?;
    let run_id = hex::encode(run_id_bytes);
    info!("manager run id: {run_id}");

    let config = Arc::new(config);
    let catalog = Catalog::new();
    let ctx = ManagerCtx {
        catalog: catalog.clone(),
        config: config.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let wakeup = Arc::new(Notify::new());

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let switcher = SwitcherWorker::new(
        catalog.clone(),
        SwitchSettings {
            force_switch: config.switcher.force_switch,
            force_confirm: config.switcher.force_confirm,
            default_db: config.default_db.clone(),
            manager_address: config.manager_address.clone(),
        },
        config.switcher.switch_interval,
        shutdown_rx.clone(),
        wakeup.clone(),
    );
    tasks.spawn(async move {
        switcher.run().await;
        Ok(())
    });

    tasks.spawn(run_listener(
        config.host.clone(),
        config.port,
        ctx,
        shutdown_rx.clone(),
    ));

    // SIGTERM finishes the current iteration everywhere and exits; SIGHUP
    // wakes the switcher for a configuration reread.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let wakeup_for_signals = wakeup.clone();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("termination signal received, shutting down");
                    let _ = shutdown_tx.send(true);
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("wake-up signal received, rereading configuration");
                    wakeup_for_signals.notify_waiters();
                }
            }
        }
    });

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {
                info!("a manager task completed; shutting down the rest");
                break;
            }
            Ok(Err(e)) => {
                error!("a manager task failed: {e}");
                break;
            }
            Err(e) => {
                error!("a manager task panicked: {e}");
                break;
            }
        }
    }
    tasks.shutdown().await;
    Ok(())
}
