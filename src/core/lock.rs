// src/core/lock.rs

//! The cluster lock: a cluster-wide pause of new DDL, obtained by calling
//! `pg_pause_cluster()` on any live coordinator, so that a routing-table
//! edit is atomic with respect to user transactions. Acquisition may have
//! to open the coordinator's HBA rules for the manager's own address; any
//! line added that way is removed again on release, on every exit path.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::core::agent::{AgentClient, AgentCmd, CommandPayload, HbaLine};
use crate::core::catalog::{HostRow, NodeFamily, NodeRow};
use crate::core::errors::BerylMgrError;
use crate::core::pgclient::PgClient;
use crate::core::probe::{PingStatus, ping_node};

/// Bounded retry of `pg_pause_cluster()`: attempts and back-off. The
/// original retried certain error codes indefinitely; this implementation
/// bounds the retry and surfaces the timeout to the operator.
pub const PAUSE_ATTEMPTS: usize = 15;
pub const PAUSE_BACKOFF: Duration = Duration::from_millis(100);

/// Mask bits of the trust rule pushed for the manager's address.
pub const MANAGER_HBA_MASK_BITS: u16 = 31;

/// A held cluster lock. Must be consumed by [`ClusterLock::release`];
/// dropping it unreleased is a bug and is logged as such.
#[derive(Debug)]
pub struct ClusterLock {
    conn: PgClient,
    coordinator: NodeRow,
    host: HostRow,
    default_db: String,
    /// The trust rule added during acquisition, if the coordinator would
    /// not accept the manager's connection. Removed on release.
    added_hba: Option<HbaLine>,
    released: bool,
}

impl ClusterLock {
    /// Walks the given in-cluster coordinators, picks the first that
    /// probes `Ok`, connects, and pauses the cluster. If the coordinator
    /// rejects the manager's connection, a single `host … trust` rule for
    /// `manager_address` is pushed through the coordinator's agent, the
    /// rules are reloaded, and the connection is retried once.
    pub async fn acquire(
        coordinators: &[(NodeRow, HostRow)],
        manager_address: &str,
        default_db: &str,
    ) -> Result<ClusterLock, BerylMgrError> {
        let mut last_error =
            BerylMgrError::InvariantViolation("no in-cluster coordinator is reachable".to_string());

        for (coord, host) in coordinators {
            // A rejecting coordinator is still a candidate: rejection is
            // exactly what the HBA push below repairs.
            if !matches!(
                ping_node(&host.address, coord.port, &host.os_user).await,
                PingStatus::Ok | PingStatus::Reject
            ) {
                continue;
            }

            let mut added_hba = None;
            let conn = match PgClient::connect(
                &host.address,
                coord.port,
                &host.os_user,
                default_db,
            )
            .await
            {
                Ok(conn) => conn,
                Err(BerylMgrError::ConnectionRejected(reason)) => {
                    info!(
                        "coordinator \"{}\" rejected the manager ({reason}); opening HBA",
                        coord.name
                    );
                    let line = HbaLine::trust(
                        default_db,
                        &host.os_user,
                        manager_address,
                        MANAGER_HBA_MASK_BITS,
                    );
                    match push_hba_line(coord, host, &line).await {
                        Ok(()) => added_hba = Some(line),
                        Err(e) => {
                            last_error = e;
                            continue;
                        }
                    }
                    match PgClient::connect(&host.address, coord.port, &host.os_user, default_db)
                        .await
                    {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Do not leave the rule behind when the retry
                            // still fails.
                            if let Some(added) = added_hba.take() {
                                if let Err(cleanup) = remove_hba_line(coord, host, &added).await {
                                    warn!(
                                        "failed to remove trust rule from \"{}\": {cleanup}",
                                        coord.name
                                    );
                                }
                            }
                            last_error = e;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            let mut lock = ClusterLock {
                conn,
                coordinator: coord.clone(),
                host: host.clone(),
                default_db: default_db.to_string(),
                added_hba,
                released: false,
            };
            match lock.pause().await {
                Ok(()) => {
                    info!("cluster paused via coordinator \"{}\"", coord.name);
                    return Ok(lock);
                }
                Err(e) => {
                    // The trust rule must not outlive the attempt.
                    lock.cleanup_hba().await;
                    lock.released = true;
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn pause(&mut self) -> Result<(), BerylMgrError> {
        let mut last = None;
        for attempt in 1..=PAUSE_ATTEMPTS {
            match self.conn.execute("SELECT pg_pause_cluster();").await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt < PAUSE_ATTEMPTS {
                        sleep(PAUSE_BACKOFF).await;
                    }
                    last = Some(e);
                }
            }
        }
        Err(BerylMgrError::RemoteCommandFailed(format!(
            "pg_pause_cluster on \"{}\" failed after {PAUSE_ATTEMPTS} attempts: {}",
            self.coordinator.name,
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Unpauses the cluster and removes any trust rule added during
    /// acquisition. The rule removal happens even when the unpause fails.
    pub async fn release(mut self) -> Result<(), BerylMgrError> {
        self.released = true;
        let unpause = self.conn.execute("SELECT pg_unpause_cluster();").await;
        self.cleanup_hba().await;
        match unpause {
            Ok(()) => {
                info!("cluster unpaused via coordinator \"{}\"", self.coordinator.name);
                Ok(())
            }
            Err(e) => Err(BerylMgrError::RemoteCommandFailed(format!(
                "pg_unpause_cluster on \"{}\" failed: {e}",
                self.coordinator.name
            ))),
        }
    }

    async fn cleanup_hba(&mut self) {
        if let Some(line) = self.added_hba.take() {
            if let Err(e) = remove_hba_line(&self.coordinator, &self.host, &line).await {
                warn!(
                    "failed to remove trust rule from \"{}\": {e}",
                    self.coordinator.name
                );
            }
        }
    }

    pub fn coordinator_name(&self) -> &str {
        &self.coordinator.name
    }

    /// The paused coordinator's connection, for callers that want to reuse
    /// it while the lock is held.
    pub fn default_db(&self) -> &str {
        &self.default_db
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if !self.released {
            error!(
                "cluster lock on \"{}\" dropped without release; the cluster may be left paused",
                self.coordinator.name
            );
        }
    }
}

async fn push_hba_line(
    coord: &NodeRow,
    host: &HostRow,
    line: &HbaLine,
) -> Result<(), BerylMgrError> {
    let mut agent = AgentClient::connect_host(host).await?;
    let payload = HbaLine::payload_for(
        &format!("{}/pg_hba.conf", coord.path),
        std::slice::from_ref(line),
    );
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfRefreshHba)
                .blob(&payload)
                .into_msg(),
        )
        .await?;
    agent
        .run(
            AgentCmd::reload(NodeFamily::Coordinator),
            &[&coord.path],
        )
        .await?;
    Ok(())
}

async fn remove_hba_line(
    coord: &NodeRow,
    host: &HostRow,
    line: &HbaLine,
) -> Result<(), BerylMgrError> {
    let mut agent = AgentClient::connect_host(host).await?;
    let payload = HbaLine::payload_for(
        &format!("{}/pg_hba.conf", coord.path),
        std::slice::from_ref(line),
    );
    agent
        .run_payload(
            CommandPayload::new(AgentCmd::ConfDeleteHbaLine)
                .blob(&payload)
                .into_msg(),
        )
        .await?;
    agent
        .run(
            AgentCmd::reload(NodeFamily::Coordinator),
            &[&coord.path],
        )
        .await?;
    Ok(())
}
