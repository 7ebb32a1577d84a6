// src/core/pgclient.rs

//! A deliberately small PostgreSQL v3 frontend, used for every direct
//! manager-to-node SQL interaction: cluster pause/unpause, routing-table
//! DDL, recovery-mode and WAL position reads. It speaks the startup packet
//! and the simple query protocol, and understands trust authentication
//! only. A node that demands a password is reported as a rejection, which
//! the cluster lock answers by installing an HBA trust rule.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::core::errors::BerylMgrError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

const PROTOCOL_VERSION_3: u32 = 196_608; // 3 << 16

/// One result row: column values in order, `None` for SQL NULL.
pub type Row = Vec<Option<String>>;

/// An authenticated connection to one node.
#[derive(Debug)]
pub struct PgClient {
    stream: TcpStream,
    buf: BytesMut,
    peer: String,
}

impl PgClient {
    /// Connects and completes the startup handshake. Refusal and timeout
    /// map to `TransientNetwork`; a node that answers but will not serve us
    /// (authentication demand, HBA rejection, still starting up) maps to
    /// `ConnectionRejected`.
    pub async fn connect(
        address: &str,
        port: u16,
        user: &str,
        database: &str,
    ) -> Result<Self, BerylMgrError> {
        let peer = format!("{address}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer))
            .await
            .map_err(|_| BerylMgrError::TransientNetwork(format!("{peer}: connect timeout")))?
            .map_err(|e| BerylMgrError::TransientNetwork(format!("{peer}: {e}")))?;

        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            peer,
        };
        client.send_startup(user, database).await?;

        loop {
            let (msg_type, body) = client.read_message().await?;
            match msg_type {
                b'R' => {
                    if body.len() < 4 {
                        return Err(BerylMgrError::ProtocolViolation(format!(
                            "{}: short authentication message",
                            client.peer
                        )));
                    }
                    let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    if code != 0 {
                        return Err(BerylMgrError::ConnectionRejected(format!(
                            "{}: authentication method {code} demanded",
                            client.peer
                        )));
                    }
                }
                b'E' => {
                    return Err(BerylMgrError::ConnectionRejected(format!(
                        "{}: {}",
                        client.peer,
                        error_message(&body)
                    )));
                }
                // Parameter status, backend key data, notices.
                b'S' | b'K' | b'N' => {}
                b'Z' => return Ok(client),
                other => {
                    return Err(BerylMgrError::ProtocolViolation(format!(
                        "{}: unexpected startup message {:#04x}",
                        client.peer, other
                    )));
                }
            }
        }
    }

    /// Runs one statement through the simple query protocol and collects
    /// every data row. A backend `ERROR` is surfaced as
    /// `RemoteCommandFailed` after the protocol reaches ready-for-query.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>, BerylMgrError> {
        debug!("pg {}: {}", self.peer, sql);
        let mut msg = BytesMut::with_capacity(sql.len() + 6);
        msg.put_u8(b'Q');
        msg.put_u32((4 + sql.len() + 1) as u32);
        msg.extend_from_slice(sql.as_bytes());
        msg.put_u8(0);
        self.stream.write_all(&msg).await?;

        let mut rows = Vec::new();
        let mut error: Option<String> = None;
        loop {
            let (msg_type, body) = self.read_message().await?;
            match msg_type {
                b'D' => rows.push(parse_data_row(&body)?),
                b'E' => error = Some(error_message(&body)),
                // Row descriptions, command completions, notices, empty
                // query and parameter status responses carry nothing we
                // keep.
                b'T' | b'C' | b'N' | b'I' | b'S' => {}
                b'Z' => break,
                other => {
                    return Err(BerylMgrError::ProtocolViolation(format!(
                        "{}: unexpected query response {:#04x}",
                        self.peer, other
                    )));
                }
            }
        }
        match error {
            Some(text) => Err(BerylMgrError::RemoteCommandFailed(format!(
                "{}: {text}",
                self.peer
            ))),
            None => Ok(rows),
        }
    }

    /// First column of the first row, for `SELECT f()` style probes.
    pub async fn query_single(&mut self, sql: &str) -> Result<Option<String>, BerylMgrError> {
        let rows = self.simple_query(sql).await?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()).flatten())
    }

    /// Runs a statement for its side effect only.
    pub async fn execute(&mut self, sql: &str) -> Result<(), BerylMgrError> {
        self.simple_query(sql).await.map(|_| ())
    }

    /// Sends the terminate message and drops the connection. Best effort.
    pub async fn close(mut self) {
        let msg: [u8; 5] = [b'X', 0, 0, 0, 4];
        let _ = self.stream.write_all(&msg).await;
    }

    async fn send_startup(&mut self, user: &str, database: &str) -> Result<(), BerylMgrError> {
        let mut params = BytesMut::new();
        for (key, value) in [("user", user), ("database", database)] {
            params.extend_from_slice(key.as_bytes());
            params.put_u8(0);
            params.extend_from_slice(value.as_bytes());
            params.put_u8(0);
        }
        params.put_u8(0);

        let mut msg = BytesMut::with_capacity(8 + params.len());
        msg.put_u32((8 + params.len()) as u32);
        msg.put_u32(PROTOCOL_VERSION_3);
        msg.extend_from_slice(&params);
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    /// Reads one backend message: `[type: u8][len: u32 BE incl. itself]`.
    async fn read_message(&mut self) -> Result<(u8, BytesMut), BerylMgrError> {
        loop {
            if self.buf.len() >= 5 {
                let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                    as usize;
                if len < 4 {
                    return Err(BerylMgrError::ProtocolViolation(format!(
                        "{}: backend frame declares length {len}",
                        self.peer
                    )));
                }
                if self.buf.len() >= 1 + len {
                    let msg_type = self.buf.get_u8();
                    self.buf.advance(4);
                    let body = self.buf.split_to(len - 4);
                    return Ok((msg_type, body));
                }
            }
            let read = tokio::time::timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| {
                    BerylMgrError::TransientNetwork(format!("{}: read timeout", self.peer))
                })??;
            if read == 0 {
                return Err(BerylMgrError::TransientNetwork(format!(
                    "{}: connection closed",
                    self.peer
                )));
            }
        }
    }
}

fn parse_data_row(body: &[u8]) -> Result<Row, BerylMgrError> {
    let mut cursor = body;
    if cursor.len() < 2 {
        return Err(BerylMgrError::IncompleteData);
    }
    let column_count = cursor.get_u16() as usize;
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if cursor.len() < 4 {
            return Err(BerylMgrError::IncompleteData);
        }
        let value_len = cursor.get_i32();
        if value_len < 0 {
            row.push(None);
            continue;
        }
        let value_len = value_len as usize;
        if cursor.len() < value_len {
            return Err(BerylMgrError::IncompleteData);
        }
        row.push(Some(
            String::from_utf8_lossy(&cursor[..value_len]).to_string(),
        ));
        cursor.advance(value_len);
    }
    Ok(row)
}

/// Extracts the human-readable message field from an `ErrorResponse` body
/// (a sequence of `[field-tag][cstring]` pairs terminated by a NUL).
fn error_message(body: &[u8]) -> String {
    let mut cursor = body;
    while !cursor.is_empty() && cursor[0] != 0 {
        let tag = cursor[0];
        cursor = &cursor[1..];
        let end = cursor.iter().position(|b| *b == 0).unwrap_or(cursor.len());
        if tag == b'M' {
            return String::from_utf8_lossy(&cursor[..end]).to_string();
        }
        cursor = &cursor[(end + 1).min(cursor.len())..];
    }
    "unspecified backend error".to_string()
}
