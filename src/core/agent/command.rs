// src/core/agent/command.rs

//! The agent command set and payload builders. A command payload is one
//! command-code byte, then zero-terminated argument strings, then an
//! optional binary blob (used by the config-file writers).

use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::Display;

use super::msg::{AGENT_MSG_COMMAND, AgentMsg};
use crate::core::catalog::NodeFamily;

/// Command codes, fixed and shared with the agent binary. Lifecycle verbs
/// are keyed by role: coordinator / datanode / gtm variants carry distinct
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum AgentCmd {
    CoordInit = 11,
    CoordStart = 12,
    CoordStop = 13,
    CoordRestart = 14,
    CoordReload = 15,
    CoordPromote = 16,
    CoordCleanDir = 17,

    DnInit = 21,
    DnStart = 22,
    DnStop = 23,
    DnRestart = 24,
    DnReload = 25,
    DnPromote = 26,
    DnCleanDir = 27,

    GtmInit = 31,
    GtmStart = 32,
    GtmStop = 33,
    GtmRestart = 34,
    GtmReload = 35,
    GtmPromote = 36,
    GtmCleanDir = 37,

    AgentPing = 50,

    ConfRefreshPostgres = 60,
    ConfRefreshPostgresReload = 61,
    ConfRefreshHba = 62,
    ConfDeleteHbaLine = 63,
    ConfRefreshRecovery = 64,

    Basebackup = 70,
    Dumpall = 71,
    PsqlExec = 72,
    CheckDirExist = 73,
    RemovePath = 74,
    GetSqlStrings = 75,
}

impl AgentCmd {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn init(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordInit,
            NodeFamily::Datanode => AgentCmd::DnInit,
            NodeFamily::Gtm => AgentCmd::GtmInit,
        }
    }

    pub fn start(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordStart,
            NodeFamily::Datanode => AgentCmd::DnStart,
            NodeFamily::Gtm => AgentCmd::GtmStart,
        }
    }

    pub fn stop(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordStop,
            NodeFamily::Datanode => AgentCmd::DnStop,
            NodeFamily::Gtm => AgentCmd::GtmStop,
        }
    }

    pub fn restart(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordRestart,
            NodeFamily::Datanode => AgentCmd::DnRestart,
            NodeFamily::Gtm => AgentCmd::GtmRestart,
        }
    }

    pub fn reload(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordReload,
            NodeFamily::Datanode => AgentCmd::DnReload,
            NodeFamily::Gtm => AgentCmd::GtmReload,
        }
    }

    pub fn promote(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordPromote,
            NodeFamily::Datanode => AgentCmd::DnPromote,
            NodeFamily::Gtm => AgentCmd::GtmPromote,
        }
    }

    pub fn clean_dir(family: NodeFamily) -> Self {
        match family {
            NodeFamily::Coordinator => AgentCmd::CoordCleanDir,
            NodeFamily::Datanode => AgentCmd::DnCleanDir,
            NodeFamily::Gtm => AgentCmd::GtmCleanDir,
        }
    }
}

/// Builder for a `COMMAND` payload.
#[derive(Debug)]
pub struct CommandPayload {
    buf: BytesMut,
}

impl CommandPayload {
    pub fn new(cmd: AgentCmd) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u8(cmd.code());
        Self { buf }
    }

    /// Appends one NUL-terminated argument string.
    pub fn arg(mut self, value: &str) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn args<'a>(mut self, values: impl IntoIterator<Item = &'a str>) -> Self {
        for v in values {
            self = self.arg(v);
        }
        self
    }

    /// Appends the trailing binary blob. Must be the last call.
    pub fn blob(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn into_msg(self) -> AgentMsg {
        AgentMsg::new(AGENT_MSG_COMMAND, self.buf.freeze())
    }
}

/// An ordered set of keyed options shipped to a config-file writer command.
/// Serialises to `target-path NUL key1 NUL value1 NUL key2 NUL value2 …`.
#[derive(Debug, Clone)]
pub struct ConfEdit {
    pub path: String,
    pub options: Vec<(String, String)>,
}

impl ConfEdit {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            options: Vec::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(self.path.as_bytes());
        buf.put_u8(0);
        for (key, value) in &self.options {
            buf.extend_from_slice(key.as_bytes());
            buf.put_u8(0);
            buf.extend_from_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

/// HBA connection types accepted by the rules file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HbaConnType {
    #[strum(serialize = "local")]
    Local,
    #[strum(serialize = "host")]
    Host,
    #[strum(serialize = "hostssl")]
    HostSsl,
    #[strum(serialize = "hostnossl")]
    HostNoSsl,
}

/// One host-based-access rule, shipped as the fixed tuple
/// `type NUL database NUL user NUL address NUL mask-bits NUL auth-method NUL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaLine {
    pub conn_type: HbaConnType,
    pub database: String,
    pub user: String,
    pub address: String,
    pub mask_bits: u16,
    pub auth_method: String,
}

impl HbaLine {
    /// A `host … trust` rule for a single client address.
    pub fn trust(database: &str, user: &str, address: &str, mask_bits: u16) -> Self {
        Self {
            conn_type: HbaConnType::Host,
            database: database.to_string(),
            user: user.to_string(),
            address: address.to_string(),
            mask_bits,
            auth_method: "trust".to_string(),
        }
    }

    fn append_tokens(&self, buf: &mut BytesMut) {
        for token in [
            self.conn_type.to_string().as_str(),
            &self.database,
            &self.user,
            &self.address,
            &self.mask_bits.to_string(),
            &self.auth_method,
        ] {
            buf.extend_from_slice(token.as_bytes());
            buf.put_u8(0);
        }
    }

    /// Serialises a rules-file edit: the target path, then the repeated
    /// fixed tuples.
    pub fn payload_for(path: &str, lines: &[HbaLine]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(path.as_bytes());
        buf.put_u8(0);
        for line in lines {
            line.append_tokens(&mut buf);
        }
        buf.freeze()
    }
}
