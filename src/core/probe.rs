// src/core/probe.rs

//! Liveness checks of a node's serving port: a TCP connect with the
//! mandatory 2 s timeout followed by a protocol-level ping.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::core::agent::{AgentClient, AgentCmd};
use crate::core::errors::BerylMgrError;
use crate::core::pgclient::PgClient;

/// The outcome of probing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// The node accepted a connection and served the handshake.
    Ok,
    /// The node is up but refused to serve us (authentication demand,
    /// HBA rejection, or still starting up).
    Reject,
    /// Nothing answered within the timeout.
    NoResponse,
    /// The probe target was malformed; no connection was attempted.
    NoAttempt,
    /// The host agent is unreachable.
    AgentDown,
}

/// Attempts per probe call and the back-off between them.
pub const PING_ATTEMPTS: usize = 3;
pub const PING_BACKOFF: Duration = Duration::from_millis(100);

/// Probes the node's serving port, up to `attempts` tries with a 100 ms
/// back-off. A rejection is definitive and returned immediately; only
/// no-response is retried.
pub async fn ping_node_retry(
    address: &str,
    port: u16,
    user: &str,
    attempts: usize,
) -> PingStatus {
    if address.is_empty() || port == 0 {
        return PingStatus::NoAttempt;
    }
    let mut status = PingStatus::NoResponse;
    for attempt in 0..attempts {
        if attempt > 0 {
            sleep(PING_BACKOFF).await;
        }
        // The default database of a bare ping is the user's own, matching
        // the connection-string defaulting of the node binaries.
        match PgClient::connect(address, port, user, user).await {
            Ok(client) => {
                client.close().await;
                return PingStatus::Ok;
            }
            Err(BerylMgrError::ConnectionRejected(reason)) => {
                debug!("ping {address}:{port} rejected: {reason}");
                return PingStatus::Reject;
            }
            Err(e) => {
                debug!("ping {address}:{port} attempt {}: {e}", attempt + 1);
                status = PingStatus::NoResponse;
            }
        }
    }
    status
}

/// The standard three-attempt probe.
pub async fn ping_node(address: &str, port: u16, user: &str) -> PingStatus {
    ping_node_retry(address, port, user, PING_ATTEMPTS).await
}

/// Probes the host agent itself.
pub async fn ping_agent(address: &str, agent_port: u16) -> PingStatus {
    match AgentClient::connect(address, agent_port).await {
        Ok(mut client) => match client.run(AgentCmd::AgentPing, &[]).await {
            Ok(_) => PingStatus::Ok,
            Err(_) => PingStatus::AgentDown,
        },
        Err(_) => PingStatus::AgentDown,
    }
}

/// Polls the node until it answers `Ok` or the budget is exhausted. Used
/// by append to confirm a freshly started replica is serving.
pub async fn wait_node_ok(address: &str, port: u16, user: &str, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if ping_node(address, port, user).await == PingStatus::Ok {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_secs(1)).await;
    }
}
