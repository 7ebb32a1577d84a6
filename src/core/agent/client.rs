// src/core/agent/client.rs

//! The RPC client against a per-host agent: one connection per operation,
//! one command per round-trip, no retries. Retrying is the caller's
//! responsibility.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::command::{AgentCmd, CommandPayload};
use super::msg::{
    AGENT_MSG_ERROR, AGENT_MSG_IDLE, AGENT_MSG_NOTICE, AGENT_MSG_RESULT, AgentMsg, AgentMsgCodec,
    split_result_values,
};
use crate::core::catalog::HostRow;
use crate::core::errors::BerylMgrError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// A connection to one host agent.
#[derive(Debug)]
pub struct AgentClient {
    framed: Framed<TcpStream, AgentMsgCodec>,
    peer: String,
}

impl AgentClient {
    /// Connects to `address:agent_port` with the mandatory 2 s timeout.
    /// Refusal or timeout is `AgentDown`.
    pub async fn connect(address: &str, agent_port: u16) -> Result<Self, BerylMgrError> {
        let peer = format!("{address}:{agent_port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer))
            .await
            .map_err(|_| BerylMgrError::AgentDown(format!("{peer}: connect timeout")))?
            .map_err(|e| BerylMgrError::AgentDown(format!("{peer}: {e}")))?;
        Ok(Self {
            framed: Framed::new(stream, AgentMsgCodec),
            peer,
        })
    }

    /// Convenience constructor from a catalog host row.
    pub async fn connect_host(host: &HostRow) -> Result<Self, BerylMgrError> {
        Self::connect(&host.address, host.agent_port).await
    }

    /// Sends one command frame and drives the reply loop: `NOTICE` is
    /// logged and reading continues, `RESULT` data is captured and reading
    /// continues, `IDLE` terminates with success, `ERROR` terminates with
    /// the agent's failure text. Any other frame type is a protocol
    /// violation and the connection is dropped with it.
    pub async fn run_payload(&mut self, msg: AgentMsg) -> Result<bytes::Bytes, BerylMgrError> {
        self.framed.send(msg).await?;

        let mut result = bytes::Bytes::new();
        let mut saw_result = false;
        loop {
            let reply = tokio::time::timeout(REPLY_TIMEOUT, self.framed.next())
                .await
                .map_err(|_| {
                    BerylMgrError::TransientNetwork(format!("{}: reply timeout", self.peer))
                })?;
            let reply: AgentMsg = match reply {
                Some(r) => r?,
                None if saw_result => return Ok(result),
                None => {
                    return Err(BerylMgrError::TransientNetwork(format!(
                        "{}: connection closed before reply completed",
                        self.peer
                    )));
                }
            };
            match reply.msg_type {
                AGENT_MSG_IDLE => return Ok(result),
                AGENT_MSG_RESULT => {
                    debug!("agent {} result: {} bytes", self.peer, reply.payload.len());
                    result = reply.payload;
                    saw_result = true;
                }
                AGENT_MSG_NOTICE => {
                    info!("agent {}: {}", self.peer, reply.text());
                }
                AGENT_MSG_ERROR => {
                    return Err(BerylMgrError::RemoteCommandFailed(reply.text()));
                }
                other => {
                    return Err(BerylMgrError::ProtocolViolation(format!(
                        "{}: unexpected message type {:#04x}",
                        self.peer, other
                    )));
                }
            }
        }
    }

    /// Runs a command whose payload is plain argument strings.
    pub async fn run(
        &mut self,
        cmd: AgentCmd,
        args: &[&str],
    ) -> Result<bytes::Bytes, BerylMgrError> {
        let payload = CommandPayload::new(cmd).args(args.iter().copied());
        self.run_payload(payload.into_msg()).await
    }

    /// `GET_SQL_STRINGS`: run a read-only SQL statement on the host through
    /// its local node and stream the result values back, NUL-separated.
    pub async fn get_sql_strings(
        &mut self,
        user: &str,
        port: u16,
        database: &str,
        sql: &str,
    ) -> Result<Vec<String>, BerylMgrError> {
        let port = port.to_string();
        let result = self
            .run(AgentCmd::GetSqlStrings, &[user, &port, database, sql])
            .await?;
        Ok(split_result_values(&result))
    }
}
