// src/core/agent/mod.rs

//! The agent RPC layer: the single mechanism the core uses to touch remote
//! processes. Each managed host runs one long-lived agent on its
//! `agent_port`; everything the manager does to a process (init, start,
//! stop, promote, config rewrites, basebackups) travels over this
//! message-oriented protocol.

pub mod client;
pub mod command;
pub mod msg;

pub use client::AgentClient;
pub use command::{AgentCmd, CommandPayload, ConfEdit, HbaConnType, HbaLine};
pub use msg::{AgentMsg, AgentMsgCodec, split_result_values};
