//! Administration console, served under the pseudo-databases
//! `pgwarden` / `pgbouncer`.

mod commands;
mod show;

use bytes::{Buf, BytesMut};
use log::{debug, error};

use crate::errors::Error;
use crate::messages::error_response;

use commands::{kill, pause, reconnect, reload, resume, shutdown, suspend, wait_close};
use show::{
    show_clients, show_config, show_databases, show_fds, show_help, show_lists, show_pools,
    show_prepared_statements, show_servers, show_stats, show_users, show_version,
};

/// Handle one admin query.
pub async fn handle_admin<T>(stream: &mut T, mut query: BytesMut) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let code = query.get_u8() as char;

    if code != 'Q' {
        return Err(Error::ProtocolSyncError(format!(
            "expected a simple query on the admin console, got '{code}'"
        )));
    }

    let len = query.get_i32() as usize;
    let query = String::from_utf8_lossy(&query[..len - 5]).to_string();

    debug!("Admin query: {query}");

    let query_parts: Vec<&str> = query.trim_end_matches(';').split_whitespace().collect();
    if query_parts.is_empty() {
        return error_response(stream, "Unsupported query against the admin database", "58000")
            .await;
    }

    let command = query_parts[0].to_ascii_uppercase();
    let argument = query_parts.get(1).map(|s| s.to_string());

    match command.as_str() {
        "RELOAD" => reload(stream).await,
        "PAUSE" => pause(stream, argument).await,
        "RESUME" => resume(stream, argument).await,
        "RECONNECT" => reconnect(stream, argument).await,
        "SUSPEND" => suspend(stream).await,
        "KILL" => kill(stream, argument).await,
        "WAIT_CLOSE" => wait_close(stream, argument).await,
        "SHUTDOWN" => {
            let mode = argument.map(|m| m.to_ascii_uppercase());
            shutdown(stream, mode.as_deref()).await
        }
        "SHOW" => {
            if query_parts.len() != 2 {
                error!("unsupported admin subcommand for SHOW: {query_parts:?}");
                return error_response(
                    stream,
                    "Unsupported query against the admin database, \
                     use SHOW HELP for a list of supported commands",
                    "58000",
                )
                .await;
            }
            match query_parts[1].to_ascii_uppercase().as_str() {
                "HELP" => show_help(stream).await,
                "CONFIG" => show_config(stream).await,
                "DATABASES" => show_databases(stream).await,
                "LISTS" => show_lists(stream).await,
                "POOLS" => show_pools(stream).await,
                "CLIENTS" => show_clients(stream).await,
                "SERVERS" => show_servers(stream).await,
                "STATS" => show_stats(stream).await,
                "USERS" => show_users(stream).await,
                "VERSION" => show_version(stream).await,
                "FDS" => show_fds(stream).await,
                "PREPARED_STATEMENTS" => show_prepared_statements(stream).await,
                other => {
                    error!("unsupported admin subcommand for SHOW: {other}");
                    error_response(
                        stream,
                        "Unsupported SHOW query against the admin database",
                        "58000",
                    )
                    .await
                }
            }
        }
        other => {
            error!("unsupported admin command: {other}");
            error_response(stream, "Unsupported query against the admin database", "58000").await
        }
    }
}
