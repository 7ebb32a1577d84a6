// tests/common/mod.rs

//! Shared test harness: a scriptable in-process cluster. `MockPgNode`
//! speaks the backend side of the startup + simple-query protocol;
//! `MockAgent` speaks the agent framing. Both mutate one `ClusterSim`
//! so that, e.g., an agent-driven promotion becomes visible to the next
//! SQL probe, the way a real fleet behaves.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One simulated node process.
#[derive(Debug, Clone, Default)]
pub struct SimNode {
    pub path: String,
    pub port: u16,
    pub in_recovery: bool,
    pub wal_lsn: String,
    /// Configuration parameters as the running process reports them.
    pub params: HashMap<String, String>,
    /// Every statement executed over the SQL channel.
    pub sql_log: Vec<String>,
    /// Startup attempts are rejected with an HBA error until an agent
    /// pushes a rule.
    pub reject_connections: bool,
    /// `pg_pause_cluster()` fails while set.
    pub fail_pause: bool,
    /// HBA tuples currently installed by agents.
    pub hba_lines: Vec<Vec<String>>,
    /// The coordinator's routing table: entry name -> (host, port).
    pub routing: HashMap<String, (String, u16)>,
}

/// Shared state of the simulated cluster, keyed by node name.
#[derive(Debug, Default)]
pub struct ClusterSim {
    nodes: Mutex<HashMap<String, SimNode>>,
    /// Every agent command received: (command code, NUL-split tokens).
    pub agent_log: Mutex<Vec<(u8, Vec<String>)>>,
}

impl ClusterSim {
    pub fn register(&self, name: &str, path: &str, in_recovery: bool, wal_lsn: &str) {
        let node = SimNode {
            path: path.to_string(),
            in_recovery,
            wal_lsn: wal_lsn.to_string(),
            ..SimNode::default()
        };
        self.nodes.lock().insert(name.to_string(), node);
    }

    pub fn with_node<R>(&self, name: &str, f: impl FnOnce(&mut SimNode) -> R) -> Option<R> {
        self.nodes.lock().get_mut(name).map(f)
    }

    pub fn node(&self, name: &str) -> Option<SimNode> {
        self.nodes.lock().get(name).cloned()
    }

    fn with_node_by_path<R>(&self, path: &str, f: impl FnOnce(&mut SimNode) -> R) -> Option<R> {
        self.nodes
            .lock()
            .values_mut()
            .find(|n| n.path == path)
            .map(f)
    }

    fn with_node_by_port<R>(&self, port: u16, f: impl FnOnce(&mut SimNode) -> R) -> Option<R> {
        self.nodes
            .lock()
            .values_mut()
            .find(|n| n.port == port)
            .map(f)
    }

    pub fn commands_with_code(&self, code: u8) -> Vec<Vec<String>> {
        self.agent_log
            .lock()
            .iter()
            .filter(|(c, _)| *c == code)
            .map(|(_, tokens)| tokens.clone())
            .collect()
    }
}

/// Allocates a port nothing is listening on.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// --- MockPgNode -----------------------------------------------------------

pub struct MockPgNode;

impl MockPgNode {
    /// Binds an ephemeral port, records it on the sim node, and serves
    /// connections until the test ends.
    pub async fn spawn(sim: Arc<ClusterSim>, name: &str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self::serve(sim, name, listener, port)
    }

    /// Serves on a specific port (to bring up a node whose catalog row was
    /// written before the process existed).
    pub async fn spawn_on(sim: Arc<ClusterSim>, name: &str, port: u16) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::serve(sim, name, listener, port)
    }

    fn serve(sim: Arc<ClusterSim>, name: &str, listener: TcpListener, port: u16) -> u16 {
        sim.with_node(name, |n| n.port = port);
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let sim = sim.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let _ = handle_pg_connection(socket, sim, name).await;
                });
            }
        });
        port
    }
}

async fn handle_pg_connection(
    mut socket: TcpStream,
    sim: Arc<ClusterSim>,
    name: String,
) -> std::io::Result<()> {
    // Startup packet: [len incl. itself BE][protocol][params].
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len.saturating_sub(4)];
    socket.read_exact(&mut body).await?;

    if sim.node(&name).map(|n| n.reject_connections).unwrap_or(true) {
        let mut out = BytesMut::new();
        push_error(&mut out, "no pg_hba.conf entry for host");
        socket.write_all(&out).await?;
        return Ok(());
    }

    let mut out = BytesMut::new();
    // AuthenticationOk.
    out.put_u8(b'R');
    out.put_u32(8);
    out.put_u32(0);
    push_ready(&mut out);
    socket.write_all(&out).await?;

    loop {
        let mut type_buf = [0u8; 1];
        if socket.read_exact(&mut type_buf).await.is_err() {
            return Ok(());
        }
        socket.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len.saturating_sub(4)];
        socket.read_exact(&mut body).await?;

        match type_buf[0] {
            b'Q' => {
                let sql = String::from_utf8_lossy(&body)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                let mut out = BytesMut::new();
                answer_query(&sim, &name, &sql, &mut out);
                socket.write_all(&out).await?;
            }
            b'X' => return Ok(()),
            _ => return Ok(()),
        }
    }
}

fn answer_query(sim: &ClusterSim, name: &str, sql: &str, out: &mut BytesMut) {
    sim.with_node(name, |n| n.sql_log.push(sql.to_string()));
    let node = sim.node(name).unwrap_or_default();
    let upper = sql.to_uppercase();

    if sql.contains("pg_is_in_recovery") {
        push_row(out, &[if node.in_recovery { "t" } else { "f" }]);
        push_complete(out, "SELECT 1");
    } else if sql.contains("pg_current_wal_lsn") || sql.contains("pg_last_wal_replay_lsn") {
        push_row(out, &[&node.wal_lsn]);
        push_complete(out, "SELECT 1");
    } else if sql.contains("pg_pause_cluster") {
        if node.fail_pause {
            push_error(out, "cluster cannot be paused");
            push_ready(out);
            return;
        }
        push_row(out, &["t"]);
        push_complete(out, "SELECT 1");
    } else if sql.contains("pg_unpause_cluster") || sql.contains("pgxc_pool_reload") {
        push_row(out, &["t"]);
        push_complete(out, "SELECT 1");
    } else if sql.contains("FROM pgxc_node") {
        let mut entries: Vec<(String, (String, u16))> =
            node.routing.clone().into_iter().collect();
        entries.sort();
        for (entry, (host, port)) in entries {
            push_row(out, &[&entry, &host, &port.to_string()]);
        }
        push_complete(out, "SELECT");
    } else if upper.starts_with("ALTER NODE") || upper.starts_with("CREATE NODE") {
        match parse_node_ddl(sql) {
            Some((entry, host, port)) => {
                sim.with_node(name, |n| {
                    let slot = n.routing.entry(entry).or_default();
                    if let Some(host) = host {
                        slot.0 = host;
                    }
                    if let Some(port) = port {
                        slot.1 = port;
                    }
                });
                push_complete(out, "ALTER NODE");
            }
            None => push_error(out, "malformed node DDL"),
        }
    } else if upper.starts_with("DROP NODE") {
        if let Some(entry) = between_quotes(sql) {
            sim.with_node(name, |n| n.routing.remove(&entry));
        }
        push_complete(out, "DROP NODE");
    } else {
        push_complete(out, "OK");
    }
    push_ready(out);
}

fn between_quotes(sql: &str) -> Option<String> {
    let start = sql.find('"')? + 1;
    let end = start + sql[start..].find('"')?;
    Some(sql[start..end].to_string())
}

fn parse_node_ddl(sql: &str) -> Option<(String, Option<String>, Option<u16>)> {
    let entry = between_quotes(sql)?;
    let host = sql.find("HOST='").map(|i| {
        let rest = &sql[i + 6..];
        rest[..rest.find('\'').unwrap_or(rest.len())].to_string()
    });
    let port = sql.find("PORT=").and_then(|i| {
        sql[i + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok()
    });
    Some((entry, host, port))
}

fn push_row(out: &mut BytesMut, values: &[&str]) {
    let body_len: usize = 2 + values.iter().map(|v| 4 + v.len()).sum::<usize>();
    out.put_u8(b'D');
    out.put_u32((4 + body_len) as u32);
    out.put_u16(values.len() as u16);
    for v in values {
        out.put_i32(v.len() as i32);
        out.extend_from_slice(v.as_bytes());
    }
}

fn push_complete(out: &mut BytesMut, tag: &str) {
    out.put_u8(b'C');
    out.put_u32((4 + tag.len() + 1) as u32);
    out.extend_from_slice(tag.as_bytes());
    out.put_u8(0);
}

fn push_ready(out: &mut BytesMut) {
    out.put_u8(b'Z');
    out.put_u32(5);
    out.put_u8(b'I');
}

fn push_error(out: &mut BytesMut, message: &str) {
    let body_len = (1 + 5 + 1) + (1 + message.len() + 1) + 1;
    out.put_u8(b'E');
    out.put_u32((4 + body_len) as u32);
    out.put_u8(b'S');
    out.extend_from_slice(b"ERROR");
    out.put_u8(0);
    out.put_u8(b'M');
    out.extend_from_slice(message.as_bytes());
    out.put_u8(0);
    out.put_u8(0);
}

// --- MockAgent ------------------------------------------------------------

// Command codes mirrored from the agent wire contract.
pub const CMD_DN_STOP: u8 = 23;
pub const CMD_DN_RESTART: u8 = 24;
pub const CMD_DN_PROMOTE: u8 = 26;
pub const CMD_GTM_PROMOTE: u8 = 36;
pub const CMD_AGENT_PING: u8 = 50;
pub const CMD_CONF_REFRESH_POSTGRES: u8 = 60;
pub const CMD_CONF_REFRESH_POSTGRES_RELOAD: u8 = 61;
pub const CMD_CONF_REFRESH_HBA: u8 = 62;
pub const CMD_CONF_DELETE_HBA_LINE: u8 = 63;
pub const CMD_CONF_REFRESH_RECOVERY: u8 = 64;
pub const CMD_BASEBACKUP: u8 = 70;
pub const CMD_GET_SQL_STRINGS: u8 = 75;

const MSG_IDLE: u8 = b'Z';
const MSG_ERROR: u8 = b'E';
const MSG_RESULT: u8 = b'R';

pub struct MockAgent;

impl MockAgent {
    /// Binds an ephemeral agent port and serves commands against the sim.
    pub async fn spawn(sim: Arc<ClusterSim>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let sim = sim.clone();
                tokio::spawn(async move {
                    let _ = handle_agent_connection(socket, sim).await;
                });
            }
        });
        port
    }
}

async fn handle_agent_connection(
    mut socket: TcpStream,
    sim: Arc<ClusterSim>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if socket.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut type_buf = [0u8; 1];
        socket.read_exact(&mut type_buf).await?;
        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await?;

        if type_buf[0] != b'C' || payload.is_empty() {
            write_agent_msg(&mut socket, MSG_ERROR, b"malformed command").await?;
            continue;
        }
        let code = payload[0];
        let tokens: Vec<String> = payload[1..]
            .split(|b| *b == 0)
            .filter(|t| !t.is_empty())
            .map(|t| String::from_utf8_lossy(t).to_string())
            .collect();
        sim.agent_log.lock().push((code, tokens.clone()));

        match code {
            CMD_AGENT_PING => {
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_DN_PROMOTE | CMD_GTM_PROMOTE => {
                let path = tokens.first().cloned().unwrap_or_default();
                sim.with_node_by_path(&path, |n| n.in_recovery = false);
                write_agent_msg(&mut socket, MSG_RESULT, b"promoted").await?;
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_CONF_REFRESH_POSTGRES | CMD_CONF_REFRESH_POSTGRES_RELOAD => {
                let target = tokens.first().cloned().unwrap_or_default();
                let dir = dirname(&target);
                let options: Vec<(String, String)> = tokens[1..]
                    .chunks(2)
                    .filter(|c| c.len() == 2)
                    .map(|c| (c[0].clone(), c[1].clone()))
                    .collect();
                // Conf writers may ship an empty value, which the token
                // splitter above dropped; re-parse preserving empties.
                let options = if options.len() * 2 != tokens.len() - 1 {
                    reparse_options(&payload[1..])
                } else {
                    options
                };
                sim.with_node_by_path(&dir, |n| {
                    for (k, v) in options {
                        n.params.insert(k, v);
                    }
                });
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_CONF_REFRESH_RECOVERY => {
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_CONF_REFRESH_HBA => {
                let target = tokens.first().cloned().unwrap_or_default();
                let dir = dirname(&target);
                let tuples: Vec<Vec<String>> =
                    tokens[1..].chunks(6).map(|c| c.to_vec()).collect();
                sim.with_node_by_path(&dir, |n| {
                    for tuple in tuples {
                        n.hba_lines.push(tuple);
                    }
                    n.reject_connections = false;
                });
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_CONF_DELETE_HBA_LINE => {
                let target = tokens.first().cloned().unwrap_or_default();
                let dir = dirname(&target);
                let tuples: Vec<Vec<String>> =
                    tokens[1..].chunks(6).map(|c| c.to_vec()).collect();
                sim.with_node_by_path(&dir, |n| {
                    n.hba_lines.retain(|line| !tuples.contains(line));
                });
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            CMD_GET_SQL_STRINGS => {
                // Args: user, port, database, sql.
                let port: u16 = tokens.get(1).and_then(|p| p.parse().ok()).unwrap_or(0);
                let sql = tokens.get(3).cloned().unwrap_or_default();
                let value = sim
                    .with_node_by_port(port, |n| {
                        if let Some(param) = sql.strip_prefix("SHOW ") {
                            n.params.get(param.trim()).cloned().unwrap_or_default()
                        } else {
                            String::new()
                        }
                    })
                    .unwrap_or_default();
                let mut payload = BytesMut::new();
                payload.extend_from_slice(value.as_bytes());
                payload.put_u8(0);
                write_agent_msg(&mut socket, MSG_RESULT, &payload).await?;
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
            _ => {
                // Lifecycle verbs, basebackups, dumps: recorded, succeed.
                write_agent_msg(&mut socket, MSG_IDLE, b"").await?;
            }
        }
    }
}

/// Options re-parse that keeps empty values, for payloads like
/// `synchronous_standby_names NUL NUL`.
fn reparse_options(payload: &[u8]) -> Vec<(String, String)> {
    let tokens: Vec<String> = payload
        .split(|b| *b == 0)
        .map(|t| String::from_utf8_lossy(t).to_string())
        .collect();
    // tokens: [target, k1, v1, ..., trailing-empty]
    tokens[1..]
        .chunks(2)
        .filter(|c| c.len() == 2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect()
}

fn dirname(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_else(|| path.to_string())
}

async fn write_agent_msg(
    socket: &mut TcpStream,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut out = BytesMut::with_capacity(5 + payload.len());
    out.put_u32_le(payload.len() as u32);
    out.put_u8(msg_type);
    out.extend_from_slice(payload);
    socket.write_all(&out).await
}
