// src/core/agent/msg.rs

//! Frame-level encoding of the agent wire protocol. The framing is
//! byte-exact for interop with the deployed agent binary:
//! `[length: u32 little-endian][type: u8][payload: length bytes]` where
//! `length` counts the payload only. Tokens inside a payload are
//! NUL-terminated.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::BerylMgrError;

/// Client -> agent: a command to execute.
pub const AGENT_MSG_COMMAND: u8 = b'C';
/// Agent -> client: end of reply.
pub const AGENT_MSG_IDLE: u8 = b'Z';
/// Agent -> client: the command failed; payload is the error text.
pub const AGENT_MSG_ERROR: u8 = b'E';
/// Agent -> client: informational log text; reading continues.
pub const AGENT_MSG_NOTICE: u8 = b'N';
/// Agent -> client: command-specific success data.
pub const AGENT_MSG_RESULT: u8 = b'R';

/// Frames above this payload size are treated as a protocol violation.
const MAX_AGENT_PAYLOAD: usize = 64 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 5;

/// A single frame on the agent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMsg {
    pub msg_type: u8,
    pub payload: Bytes,
}

impl AgentMsg {
    pub fn new(msg_type: u8, payload: Bytes) -> Self {
        Self { msg_type, payload }
    }

    /// The payload as lossy UTF-8, for error and notice text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// `tokio_util::codec` implementation for `AgentMsg` framing.
#[derive(Debug, Default)]
pub struct AgentMsgCodec;

impl Encoder<AgentMsg> for AgentMsgCodec {
    type Error = BerylMgrError;

    fn encode(&mut self, item: AgentMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_AGENT_PAYLOAD {
            return Err(BerylMgrError::ProtocolViolation(format!(
                "outgoing agent payload of {} bytes exceeds the frame limit",
                item.payload.len()
            )));
        }
        dst.reserve(FRAME_HEADER_LEN + item.payload.len());
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_u8(item.msg_type);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for AgentMsgCodec {
    type Item = AgentMsg;
    type Error = BerylMgrError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;
        if payload_len > MAX_AGENT_PAYLOAD {
            return Err(BerylMgrError::ProtocolViolation(format!(
                "incoming agent frame declares {payload_len} bytes"
            )));
        }
        if src.len() < FRAME_HEADER_LEN + payload_len {
            // Wait for the rest of the frame.
            src.reserve(FRAME_HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let msg_type = src.get_u8();
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(AgentMsg { msg_type, payload }))
    }
}

/// Splits a `RESULT` payload of NUL-separated values, as produced by
/// `GET_SQL_STRINGS`. A trailing NUL does not produce an empty value.
pub fn split_result_values(payload: &[u8]) -> Vec<String> {
    let mut values: Vec<String> = payload
        .split(|b| *b == 0)
        .map(|v| String::from_utf8_lossy(v).to_string())
        .collect();
    if values.last().is_some_and(|v| v.is_empty()) {
        values.pop();
    }
    values
}
