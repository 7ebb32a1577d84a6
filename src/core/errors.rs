// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the manager.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum BerylMgrError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// TCP refused or timed out while talking to a node's serving port.
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// The per-host agent is unreachable.
    #[error("Agent down: {0}")]
    AgentDown(String),

    /// A node answered the connection attempt but refused to serve us.
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    /// The agent (or a node) executed our command and reported failure.
    /// The text is captured verbatim into diagnostics; non-retriable.
    #[error("Remote command failed: {0}")]
    RemoteCommandFailed(String),

    /// An unexpected message type on the wire. Fatal to the current
    /// operation; the connection is dropped.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// An optimistic cure-status CAS lost, or the memory/DB consistency
    /// check found a mismatch. The sub-transaction aborts and the row is
    /// left for the next tick.
    #[error("Catalog conflict: {0}")]
    CatalogConflict(String),

    /// The catalog would be left in a state that breaks a structural
    /// invariant. Surfaced to the operator, never auto-recovered.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Host not found for node {0}")]
    HostNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The switcher's working set changed under it; the outermost loop
    /// catches this, drops all in-memory rows and rescans.
    #[error("Switcher reset requested")]
    SwitcherReset,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BerylMgrError {
    /// Whether the caller may retry the operation with back-off. Only
    /// network-level failures qualify; everything else is either permanent
    /// or must go back through the catalog.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BerylMgrError::TransientNetwork(_)
                | BerylMgrError::AgentDown(_)
                | BerylMgrError::Io(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BerylMgrError {
    fn clone(&self) -> Self {
        match self {
            BerylMgrError::Io(e) => BerylMgrError::Io(Arc::clone(e)),
            BerylMgrError::IncompleteData => BerylMgrError::IncompleteData,
            BerylMgrError::TransientNetwork(s) => BerylMgrError::TransientNetwork(s.clone()),
            BerylMgrError::AgentDown(s) => BerylMgrError::AgentDown(s.clone()),
            BerylMgrError::ConnectionRejected(s) => BerylMgrError::ConnectionRejected(s.clone()),
            BerylMgrError::RemoteCommandFailed(s) => BerylMgrError::RemoteCommandFailed(s.clone()),
            BerylMgrError::ProtocolViolation(s) => BerylMgrError::ProtocolViolation(s.clone()),
            BerylMgrError::CatalogConflict(s) => BerylMgrError::CatalogConflict(s.clone()),
            BerylMgrError::InvariantViolation(s) => BerylMgrError::InvariantViolation(s.clone()),
            BerylMgrError::NodeNotFound(s) => BerylMgrError::NodeNotFound(s.clone()),
            BerylMgrError::HostNotFound(s) => BerylMgrError::HostNotFound(s.clone()),
            BerylMgrError::InvalidRequest(s) => BerylMgrError::InvalidRequest(s.clone()),
            BerylMgrError::SwitcherReset => BerylMgrError::SwitcherReset,
            BerylMgrError::Internal(s) => BerylMgrError::Internal(s.clone()),
        }
    }
}

impl PartialEq for BerylMgrError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BerylMgrError::Io(e1), BerylMgrError::Io(e2)) => e1.to_string() == e2.to_string(),
            (BerylMgrError::TransientNetwork(s1), BerylMgrError::TransientNetwork(s2)) => s1 == s2,
            (BerylMgrError::AgentDown(s1), BerylMgrError::AgentDown(s2)) => s1 == s2,
            (BerylMgrError::ConnectionRejected(s1), BerylMgrError::ConnectionRejected(s2)) => {
                s1 == s2
            }
            (BerylMgrError::RemoteCommandFailed(s1), BerylMgrError::RemoteCommandFailed(s2)) => {
                s1 == s2
            }
            (BerylMgrError::ProtocolViolation(s1), BerylMgrError::ProtocolViolation(s2)) => {
                s1 == s2
            }
            (BerylMgrError::CatalogConflict(s1), BerylMgrError::CatalogConflict(s2)) => s1 == s2,
            (BerylMgrError::InvariantViolation(s1), BerylMgrError::InvariantViolation(s2)) => {
                s1 == s2
            }
            (BerylMgrError::NodeNotFound(s1), BerylMgrError::NodeNotFound(s2)) => s1 == s2,
            (BerylMgrError::HostNotFound(s1), BerylMgrError::HostNotFound(s2)) => s1 == s2,
            (BerylMgrError::InvalidRequest(s1), BerylMgrError::InvalidRequest(s2)) => s1 == s2,
            (BerylMgrError::Internal(s1), BerylMgrError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BerylMgrError {
    fn from(e: std::io::Error) -> Self {
        BerylMgrError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for BerylMgrError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        BerylMgrError::ProtocolViolation(format!("invalid UTF-8 in payload: {e}"))
    }
}

impl From<std::str::Utf8Error> for BerylMgrError {
    fn from(e: std::str::Utf8Error) -> Self {
        BerylMgrError::ProtocolViolation(format!("invalid UTF-8 in payload: {e}"))
    }
}
