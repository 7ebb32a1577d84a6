// src/core/standby.rs

//! The synchronous-standby list editor, shared by the switcher and the
//! append engine. Planning is a pure function over catalog rows so the
//! emitted parameter string is canonical: the same set of slaves always
//! produces the same string regardless of scan order.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::agent::{AgentClient, AgentCmd, CommandPayload, ConfEdit};
use crate::core::catalog::{HostRow, NodeId, NodeRow, SyncState};
use crate::core::errors::BerylMgrError;

/// Verification attempts after a reload and the back-off between them.
pub const VERIFY_ATTEMPTS: usize = 15;
pub const VERIFY_BACKOFF: Duration = Duration::from_millis(100);

/// The outcome of planning a master's `synchronous_standby_names` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncListPlan {
    /// The parameter value to broadcast; empty when no eligible slave
    /// remains.
    pub value: String,
    /// Rows whose `sync_state` must be flipped to `sync` in the same
    /// catalog transaction that ships the parameter.
    pub upgrades: Vec<NodeId>,
    /// Operator-visible notices (silent upgrades, etc.).
    pub notices: Vec<String>,
    /// Set when the cluster is left without any synchronous replica.
    pub warning: Option<String>,
}

/// Computes the canonical list for a master given its slave rows.
///
/// `exclude` drops one slave from consideration (the promotion candidate,
/// or a node being removed). `newly_added` includes one slave that is not
/// yet flagged in-cluster (the append flow rewrites the master's list
/// before flipping the new row's membership).
pub fn plan_sync_standby(
    slaves: &[NodeRow],
    exclude: Option<NodeId>,
    newly_added: Option<NodeId>,
) -> SyncListPlan {
    let mut members: Vec<&NodeRow> = slaves
        .iter()
        .filter(|s| Some(s.id) != exclude)
        .filter(|s| s.in_cluster || Some(s.id) == newly_added)
        .collect();
    members.sort_by_key(|s| s.id);

    let any_slave = !members.is_empty();
    let mut sync_members: Vec<&NodeRow> = Vec::new();
    let mut potential_members: Vec<&NodeRow> = Vec::new();
    for slave in &members {
        match slave.sync_state {
            SyncState::Sync => sync_members.push(slave),
            SyncState::Potential => potential_members.push(slave),
            // Async slaves never appear in the list.
            SyncState::Async | SyncState::None => {}
        }
    }

    let mut upgrades = Vec::new();
    let mut notices = Vec::new();
    let mut warning = None;

    if sync_members.is_empty() && !potential_members.is_empty() {
        // Prefer the slave being added when it is the reason we are here,
        // otherwise an in-cluster potential, tie-broken by scan order.
        let chosen_index = newly_added
            .and_then(|id| potential_members.iter().position(|s| s.id == id))
            .or_else(|| potential_members.iter().position(|s| s.in_cluster))
            .unwrap_or(0);
        let chosen = potential_members.remove(chosen_index);
        if Some(chosen.id) == newly_added {
            notices.push(format!(
                "slave \"{}\" upgraded from potential to sync: the master had no synchronous standby",
                chosen.name
            ));
        } else {
            notices.push(format!(
                "potential slave \"{}\" promoted to sync to keep a synchronous standby",
                chosen.name
            ));
        }
        upgrades.push(chosen.id);
        sync_members.push(chosen);
    }

    if sync_members.is_empty() {
        warning = Some(if any_slave {
            "master has no synchronous replica: all remaining slaves are async".to_string()
        } else {
            "master is left without any slave".to_string()
        });
        return SyncListPlan {
            value: String::new(),
            upgrades,
            notices,
            warning,
        };
    }

    let mut names: Vec<&str> = Vec::with_capacity(sync_members.len() + potential_members.len());
    let mut sync_names: Vec<&str> = sync_members.iter().map(|s| s.name.as_str()).collect();
    sync_names.sort_unstable();
    let mut potential_names: Vec<&str> =
        potential_members.iter().map(|s| s.name.as_str()).collect();
    potential_names.sort_unstable();
    names.extend(sync_names);
    names.extend(potential_names);

    SyncListPlan {
        value: format!("{} ({})", sync_members.len(), names.join(", ")),
        upgrades,
        notices,
        warning,
    }
}

/// Ships a planned list to the running master through its host agent and
/// verifies the reload took effect, retrying the verification up to
/// 15 times with a 100 ms back-off.
pub async fn apply_sync_standby(
    host: &HostRow,
    master: &NodeRow,
    default_db: &str,
    value: &str,
) -> Result<(), BerylMgrError> {
    let mut agent = AgentClient::connect_host(host).await?;

    let edit = ConfEdit::new(format!("{}/postgresql.conf", master.path))
        .set("synchronous_standby_names", value);
    let payload = CommandPayload::new(AgentCmd::ConfRefreshPostgresReload)
        .blob(&edit.payload())
        .into_msg();
    agent.run_payload(payload).await?;

    for attempt in 1..=VERIFY_ATTEMPTS {
        let values = agent
            .get_sql_strings(
                &host.os_user,
                master.port,
                default_db,
                "SHOW synchronous_standby_names",
            )
            .await?;
        let current = values.first().map(String::as_str).unwrap_or("");
        if current.trim() == value {
            info!(
                "synchronous_standby_names on \"{}\" is now \"{}\"",
                master.name, value
            );
            return Ok(());
        }
        if attempt < VERIFY_ATTEMPTS {
            sleep(VERIFY_BACKOFF).await;
        } else {
            warn!(
                "synchronous_standby_names on \"{}\" still reads \"{}\" after reload",
                master.name, current
            );
        }
    }
    Err(BerylMgrError::RemoteCommandFailed(format!(
        "node \"{}\" did not pick up synchronous_standby_names = \"{}\"",
        master.name, value
    )))
}
