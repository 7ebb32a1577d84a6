// src/core/ops/mod.rs

//! The administrative verb surface. Every verb handler returns a stream of
//! `(name, success, description)` tuples; a verb as a whole failed when any
//! row reports `success = false`.

pub mod control;
pub mod failover;
pub mod node;
pub mod view;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::core::catalog::Catalog;

/// One row of a verb's result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub name: String,
    pub success: bool,
    pub description: String,
}

impl OpResult {
    pub fn ok(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            description: description.into(),
        }
    }

    pub fn fail(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            description: description.into(),
        }
    }
}

/// Worker-scoped state passed explicitly through every handler; there is no
/// module-level mutable state.
#[derive(Clone)]
pub struct ManagerCtx {
    pub catalog: Catalog,
    pub config: Arc<Config>,
}

/// Key=value attributes following a verb's positional words.
pub type Attrs = HashMap<String, String>;

fn parse_attrs(tokens: &[&str]) -> Attrs {
    tokens
        .iter()
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parses one administrative line and dispatches it. Unknown verbs produce
/// a single failed row.
pub async fn dispatch(ctx: &ManagerCtx, line: &str) -> Vec<OpResult> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let flags: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !t.contains('='))
        .collect();
    let attrs = parse_attrs(&tokens);

    match flags.as_slice() {
        ["add", "host", name, ..] => vec![node::add_host(ctx, name, &attrs).await],
        ["add", "node", name, ..] => vec![node::add_node(ctx, name, &attrs).await],
        ["alter", "node", name, ..] => vec![node::alter_node(ctx, name, &attrs).await],
        ["drop", "node", name] => vec![node::drop_node(ctx, name).await],
        ["remove", "node", name] => node::remove_node(ctx, name).await,
        ["init", "node", name] => vec![control::init_node(ctx, name).await],
        ["start", "node", name] => vec![control::start_node(ctx, name).await],
        ["stop", "node", name, ..] => vec![control::stop_node(ctx, name, &attrs).await],
        ["restart", "node", name, ..] => vec![control::restart_node(ctx, name, &attrs).await],
        ["append", kind, name, ..] => {
            // The role rides as a positional word: `append dn-slave dn1p …`.
            let mut attrs = attrs.clone();
            attrs.insert("role".to_string(), kind.to_string());
            node::append(ctx, name, &attrs).await
        }
        ["append", name] => node::append(ctx, name, &attrs).await,
        ["failover", kind, name, rest @ ..] => {
            let force = rest.contains(&"force");
            let confirm = rest.contains(&"confirm");
            failover::failover(ctx, kind, name, force, confirm).await
        }
        ["clean", "all"] => control::clean_all(ctx).await,
        ["clean", "node", name] => vec![control::clean_node(ctx, name).await],
        ["flush", "host"] => control::flush_host(ctx).await,
        ["list", "nodes"] => view::list_nodes(ctx).await,
        ["list", "hosts"] => view::list_hosts(ctx).await,
        ["monitor", ..] => view::monitor(ctx).await,
        _ => vec![OpResult::fail(
            line.trim(),
            "unrecognized administrative verb",
        )],
    }
}
