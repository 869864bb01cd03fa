//! Admin commands: pool control, reload and shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{info, warn};

use crate::app::server::{begin_shutdown, ShutdownMode};
use crate::config::{get_config, reload_config};
use crate::errors::Error;
use crate::messages::{command_complete, error_response, write_all_flush};
use crate::pool::{get_all_pools, ConnectionPool};

/// How often the blocking console commands poll for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

async fn command_ok<T>(stream: &mut T, tag: &str) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put(command_complete(tag));
    res.put_u8(b'Z');
    res.put_i32(5);
    res.put_u8(b'I');
    write_all_flush(stream, &res).await
}

/// Pools selected by an optional database argument.
fn select_pools(database: Option<&str>) -> Vec<ConnectionPool> {
    get_all_pools()
        .iter()
        .filter(|(id, _)| match database {
            Some(database) => id.db == database,
            None => true,
        })
        .map(|(_, pool)| pool.clone())
        .collect()
}

/// Reload the configuration file without restarting the process.
pub async fn reload<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    info!("Reloading config on console request");
    reload_config().await?;
    get_config().show();
    command_ok(stream, "RELOAD").await
}

/// PAUSE [db]: stop handing out servers; returns once nothing is
/// linked.
pub async fn pause<T>(stream: &mut T, database: Option<String>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let pools = select_pools(database.as_deref());
    if pools.is_empty() {
        return error_response(stream, "no such database", "08P01").await;
    }

    for pool in &pools {
        info!("Pausing pool {}", pool.identifier());
        pool.pause();
    }

    // The command completes when every linked server has been
    // released.
    loop {
        let busy: usize = pools.iter().map(|p| p.active_server_count()).sum();
        if busy == 0 {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    command_ok(stream, "PAUSE").await
}

/// RESUME [db].
pub async fn resume<T>(stream: &mut T, database: Option<String>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let pools = select_pools(database.as_deref());
    if pools.is_empty() {
        return error_response(stream, "no such database", "08P01").await;
    }
    for pool in &pools {
        info!("Resuming pool {}", pool.identifier());
        pool.resume();
    }
    command_ok(stream, "RESUME").await
}

/// RECONNECT [db]: close current server connections as they are
/// released; idle ones right away.
pub async fn reconnect<T>(stream: &mut T, database: Option<String>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let pools = select_pools(database.as_deref());
    if pools.is_empty() {
        return error_response(stream, "no such database", "08P01").await;
    }
    for pool in &pools {
        info!("Reconnecting pool {}", pool.identifier());
        pool.reconnect();
    }
    command_ok(stream, "RECONNECT").await
}

/// SUSPEND: pause everything until buffers drain, bounded by
/// suspend_timeout.
pub async fn suspend<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let pools = select_pools(None);
    for pool in &pools {
        pool.pause();
    }

    let deadline = get_config().general.suspend_timeout.as_std();
    let started = crate::utils::clock::now();
    loop {
        let busy: usize = pools.iter().map(|p| p.active_server_count()).sum();
        if busy == 0 {
            break;
        }
        if started.elapsed() >= deadline {
            warn!("SUSPEND timed out with {busy} servers still linked");
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    command_ok(stream, "SUSPEND").await
}

/// KILL db: drop the database's pools entirely.
pub async fn kill<T>(stream: &mut T, database: Option<String>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let database = match database {
        Some(database) => database,
        None => return error_response(stream, "KILL requires a database name", "08P01").await,
    };

    let pools = select_pools(Some(&database));
    if pools.is_empty() {
        return error_response(stream, "no such database", "08P01").await;
    }
    for pool in &pools {
        warn!("Killing pool {}", pool.identifier());
        pool.kill();
    }
    command_ok(stream, "KILL").await
}

/// WAIT_CLOSE [db]: returns once the selected pools hold no server
/// connections.
pub async fn wait_close<T>(stream: &mut T, database: Option<String>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let pools = select_pools(database.as_deref());
    if pools.is_empty() {
        return error_response(stream, "no such database", "08P01").await;
    }

    for pool in &pools {
        pool.flags.wait_close.store(true, Ordering::Relaxed);
    }

    loop {
        let open: usize = pools.iter().map(|p| p.connected_server_count()).sum();
        if open == 0 {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    command_ok(stream, "WAIT_CLOSE").await
}

/// SHUTDOWN [WAIT_FOR_SERVERS | WAIT_FOR_CLIENTS].
pub async fn shutdown<T>(stream: &mut T, mode: Option<&str>) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mode = match mode {
        None => ShutdownMode::Immediate,
        Some("WAIT_FOR_SERVERS") => ShutdownMode::WaitForServers,
        Some("WAIT_FOR_CLIENTS") => ShutdownMode::WaitForClients,
        Some(other) => {
            return error_response(
                stream,
                &format!("unknown SHUTDOWN mode {other:?}"),
                "08P01",
            )
            .await
        }
    };

    warn!("Shutdown requested from console: {mode:?}");
    begin_shutdown(mode);
    command_ok(stream, "SHUTDOWN").await
}
