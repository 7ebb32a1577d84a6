// src/server/listener.rs

//! The administrative TCP listener: one verb per line in, one
//! tab-separated `(name, success, description)` row per result out,
//! terminated by a lone `.` line. Each connection is served by its own
//! task; each verb runs as its own cooperative worker.

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

use crate::core::ops::{self, ManagerCtx};

/// Binds and serves the admin listener until shutdown is signalled.
pub async fn run_listener(
    host: String,
    port: u16,
    ctx: ManagerCtx,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("admin listener on {host}:{port}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            info!("admin connection from {addr}");
                            if let Err(e) = handle_connection(socket, ctx).await {
                                warn!("admin connection {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("admin accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, ctx: ManagerCtx) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if line.trim() == "quit" {
            break;
        }
        let results = ops::dispatch(&ctx, &line).await;
        for row in results {
            framed
                .send(format!("{}\t{}\t{}", row.name, row.success, row.description))
                .await?;
        }
        framed.send(".".to_string()).await?;
    }
    Ok(())
}
