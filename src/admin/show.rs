//! SHOW commands of the admin console.

use bytes::{BufMut, BytesMut};

use crate::app::server::LISTENER_FDS;
use crate::config::get_config;
use crate::errors::Error;
use crate::messages::{command_complete, data_row, row_description, write_all_flush, DataType};
use crate::pool::{get_all_pools, ServerState};
use crate::stats::{CLIENT_REGISTRY, SERVER_REGISTRY};

/// Assemble rows + CommandComplete + ReadyForQuery and flush.
async fn send_rows<T>(
    stream: &mut T,
    columns: &[(&str, DataType)],
    rows: Vec<Vec<String>>,
) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put(row_description(columns));
    let count = rows.len();
    for row in rows {
        res.put(data_row(&row));
    }
    res.put(command_complete(&format!("SHOW {count}")));
    res.put_u8(b'Z');
    res.put_i32(5);
    res.put_u8(b'I');
    write_all_flush(stream, &res).await
}

pub async fn show_help<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let commands = [
        "SHOW HELP|CONFIG|DATABASES|POOLS|CLIENTS|SERVERS|STATS|LISTS|USERS|VERSION|FDS",
        "SHOW PREPARED_STATEMENTS",
        "PAUSE [<db>]",
        "RESUME [<db>]",
        "RECONNECT [<db>]",
        "KILL <db>",
        "SUSPEND",
        "SHUTDOWN [WAIT_FOR_SERVERS|WAIT_FOR_CLIENTS]",
        "WAIT_CLOSE [<db>]",
        "RELOAD",
    ];
    let rows = commands.iter().map(|c| vec![c.to_string()]).collect();
    send_rows(stream, &[("command", DataType::Text)], rows).await
}

pub async fn show_version<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    send_rows(
        stream,
        &[("version", DataType::Text)],
        vec![vec![format!("pg_warden {}", crate::config::VERSION)]],
    )
    .await
}

pub async fn show_config<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let general = &config.general;

    let entries: Vec<(&str, String)> = vec![
        ("host", general.host.clone()),
        ("port", general.port.to_string()),
        ("so_reuseport", general.so_reuseport.to_string()),
        ("pool_mode", general.pool_mode.to_string()),
        ("max_client_conn", general.max_client_conn.to_string()),
        ("default_pool_size", general.default_pool_size.to_string()),
        ("min_pool_size", general.min_pool_size.to_string()),
        ("reserve_pool_size", general.reserve_pool_size.to_string()),
        (
            "reserve_pool_timeout",
            general.reserve_pool_timeout.to_string(),
        ),
        ("max_db_connections", general.max_db_connections.to_string()),
        (
            "max_user_connections",
            general.max_user_connections.to_string(),
        ),
        (
            "max_db_client_connections",
            general.max_db_client_connections.to_string(),
        ),
        (
            "max_user_client_connections",
            general.max_user_client_connections.to_string(),
        ),
        ("server_lifetime", general.server_lifetime.to_string()),
        (
            "server_idle_timeout",
            general.server_idle_timeout.to_string(),
        ),
        ("server_reset_query", general.server_reset_query.clone()),
        (
            "server_reset_query_always",
            general.server_reset_query_always.to_string(),
        ),
        ("server_check_query", general.server_check_query.clone()),
        ("server_check_delay", general.server_check_delay.to_string()),
        ("server_fast_close", general.server_fast_close.to_string()),
        (
            "server_connect_timeout",
            general.server_connect_timeout.to_string(),
        ),
        ("server_login_retry", general.server_login_retry.to_string()),
        ("query_timeout", general.query_timeout.to_string()),
        ("query_wait_timeout", general.query_wait_timeout.to_string()),
        (
            "cancel_wait_timeout",
            general.cancel_wait_timeout.to_string(),
        ),
        ("client_idle_timeout", general.client_idle_timeout.to_string()),
        (
            "client_login_timeout",
            general.client_login_timeout.to_string(),
        ),
        (
            "idle_transaction_timeout",
            general.idle_transaction_timeout.to_string(),
        ),
        (
            "transaction_timeout",
            general.transaction_timeout.to_string(),
        ),
        ("suspend_timeout", general.suspend_timeout.to_string()),
        (
            "max_prepared_statements",
            general.max_prepared_statements.to_string(),
        ),
        (
            "prepared_statements_cache_size",
            general.prepared_statements_cache_size.to_string(),
        ),
        ("max_packet_size", general.max_packet_size.to_string()),
        ("stats_period", general.stats_period.to_string()),
        ("worker_threads", general.worker_threads.to_string()),
    ];

    let rows = entries
        .into_iter()
        .map(|(key, value)| vec![key.to_string(), value])
        .collect();

    send_rows(
        stream,
        &[("key", DataType::Text), ("value", DataType::Text)],
        rows,
    )
    .await
}

pub async fn show_databases<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let mut rows = Vec::new();

    for (name, database) in &config.databases {
        rows.push(vec![
            name.clone(),
            database.host.clone(),
            database.port.to_string(),
            database.dbname.clone().unwrap_or_else(|| name.clone()),
            database
                .pool_mode
                .map(|m| m.to_string())
                .unwrap_or_else(|| config.general.pool_mode.to_string()),
            database
                .pool_size
                .unwrap_or(config.general.default_pool_size)
                .to_string(),
            database
                .min_pool_size
                .unwrap_or(config.general.min_pool_size)
                .to_string(),
            database
                .reserve_pool_size
                .unwrap_or(config.general.reserve_pool_size)
                .to_string(),
            database
                .max_db_connections
                .unwrap_or(config.general.max_db_connections)
                .to_string(),
        ]);
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("name", DataType::Text),
            ("host", DataType::Text),
            ("port", DataType::Int4),
            ("database", DataType::Text),
            ("pool_mode", DataType::Text),
            ("pool_size", DataType::Int4),
            ("min_pool_size", DataType::Int4),
            ("reserve_pool", DataType::Int4),
            ("max_connections", DataType::Int4),
        ],
        rows,
    )
    .await
}

pub async fn show_users<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let mut rows = Vec::new();
    for (name, database) in &config.databases {
        for user in &database.users {
            rows.push(vec![
                user.username.clone(),
                name.clone(),
                user.pool_mode
                    .or(database.pool_mode)
                    .unwrap_or(config.general.pool_mode)
                    .to_string(),
            ]);
        }
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("name", DataType::Text),
            ("database", DataType::Text),
            ("pool_mode", DataType::Text),
        ],
        rows,
    )
    .await
}

pub async fn show_pools<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut rows = Vec::new();

    for (id, pool) in get_all_pools().iter() {
        let (counts, cl_active, cl_waiting, cl_waiting_cancel, cl_active_cancel, maxwait_us) =
            pool.with_inner(|inner| {
                let counts: Vec<usize> = [
                    ServerState::Active,
                    ServerState::ActiveCancel,
                    ServerState::BeingCanceled,
                    ServerState::Idle,
                    ServerState::Used,
                    ServerState::Tested,
                    ServerState::Login,
                ]
                .iter()
                .map(|state| inner.list_count(*state))
                .collect();
                (
                    counts,
                    inner.clients.active.len(),
                    inner.waiting_client_count(),
                    inner.clients.waiting_cancel.len(),
                    inner.clients.active_cancel.len(),
                    inner
                        .oldest_wait()
                        .map(|at| at.elapsed().as_micros() as u64)
                        .unwrap_or(0),
                )
            });

        let mut row = vec![
            id.db.clone(),
            id.user.clone(),
            cl_active.to_string(),
            cl_waiting.to_string(),
            cl_active_cancel.to_string(),
            cl_waiting_cancel.to_string(),
        ];
        row.extend(counts.iter().map(|c| c.to_string()));
        row.push((maxwait_us / 1_000_000).to_string());
        row.push((maxwait_us % 1_000_000).to_string());
        row.push(pool.settings.pool_mode.to_string());
        rows.push(row);
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("database", DataType::Text),
            ("user", DataType::Text),
            ("cl_active", DataType::Int4),
            ("cl_waiting", DataType::Int4),
            ("cl_active_cancel_req", DataType::Int4),
            ("cl_waiting_cancel_req", DataType::Int4),
            ("sv_active", DataType::Int4),
            ("sv_active_cancel", DataType::Int4),
            ("sv_being_canceled", DataType::Int4),
            ("sv_idle", DataType::Int4),
            ("sv_used", DataType::Int4),
            ("sv_tested", DataType::Int4),
            ("sv_login", DataType::Int4),
            ("maxwait", DataType::Int4),
            ("maxwait_us", DataType::Int4),
            ("pool_mode", DataType::Text),
        ],
        rows,
    )
    .await
}

pub async fn show_clients<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut rows = Vec::new();
    for entry in CLIENT_REGISTRY.iter() {
        let stats = entry.value();
        rows.push(vec![
            stats.process_id().to_string(),
            stats.pool_name.clone(),
            stats.username.clone(),
            stats.application_name.clone(),
            stats.state().as_str().to_string(),
            stats.addr.clone(),
            (stats.connect_time.elapsed().as_secs()).to_string(),
            stats
                .transaction_count
                .load(std::sync::atomic::Ordering::Relaxed)
                .to_string(),
            stats
                .query_count
                .load(std::sync::atomic::Ordering::Relaxed)
                .to_string(),
            stats
                .max_wait_time
                .load(std::sync::atomic::Ordering::Relaxed)
                .to_string(),
        ]);
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("id", DataType::Int4),
            ("database", DataType::Text),
            ("user", DataType::Text),
            ("application_name", DataType::Text),
            ("state", DataType::Text),
            ("addr", DataType::Text),
            ("connect_age_s", DataType::Int4),
            ("xact_count", DataType::Numeric),
            ("query_count", DataType::Numeric),
            ("max_wait_us", DataType::Numeric),
        ],
        rows,
    )
    .await
}

pub async fn show_servers<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut rows = Vec::new();
    for entry in SERVER_REGISTRY.iter() {
        let stats = entry.value();
        rows.push(vec![
            stats.backend_pid().to_string(),
            stats.pool_name.clone(),
            stats.username.clone(),
            stats.host.clone(),
            stats.port.to_string(),
            stats.state().as_str().to_string(),
            stats.application_name.lock().clone(),
            stats.connect_time.elapsed().as_secs().to_string(),
            stats
                .transaction_count
                .load(std::sync::atomic::Ordering::Relaxed)
                .to_string(),
            stats
                .query_count
                .load(std::sync::atomic::Ordering::Relaxed)
                .to_string(),
        ]);
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("backend_pid", DataType::Int4),
            ("database", DataType::Text),
            ("user", DataType::Text),
            ("host", DataType::Text),
            ("port", DataType::Int4),
            ("state", DataType::Text),
            ("application_name", DataType::Text),
            ("connect_age_s", DataType::Int4),
            ("xact_count", DataType::Numeric),
            ("query_count", DataType::Numeric),
        ],
        rows,
    )
    .await
}

pub async fn show_stats<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let period_secs = get_config().general.stats_period.as_secs().max(1);
    let mut rows = Vec::new();

    for (id, pool) in get_all_pools().iter() {
        let totals = pool.stats.totals();
        let period = pool.stats.last_period();
        rows.push(vec![
            id.db.clone(),
            id.user.clone(),
            totals.server_assignment_count.to_string(),
            totals.xact_count.to_string(),
            totals.query_count.to_string(),
            totals.bytes_received.to_string(),
            totals.bytes_sent.to_string(),
            totals.xact_time.to_string(),
            totals.query_time.to_string(),
            totals.wait_time.to_string(),
            totals.ps_client_parse_count.to_string(),
            totals.ps_server_parse_count.to_string(),
            totals.ps_bind_count.to_string(),
            (period.xact_count / period_secs).to_string(),
            (period.query_count / period_secs).to_string(),
        ]);
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("database", DataType::Text),
            ("user", DataType::Text),
            ("total_server_assignment_count", DataType::Numeric),
            ("total_xact_count", DataType::Numeric),
            ("total_query_count", DataType::Numeric),
            ("total_received", DataType::Numeric),
            ("total_sent", DataType::Numeric),
            ("total_xact_time", DataType::Numeric),
            ("total_query_time", DataType::Numeric),
            ("total_wait_time", DataType::Numeric),
            ("total_client_parse_count", DataType::Numeric),
            ("total_server_parse_count", DataType::Numeric),
            ("total_bind_count", DataType::Numeric),
            ("avg_xact_count", DataType::Numeric),
            ("avg_query_count", DataType::Numeric),
        ],
        rows,
    )
    .await
}

pub async fn show_lists<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let pools = get_all_pools();

    let user_count: usize = config.databases.values().map(|d| d.users.len()).sum();
    let mut used_servers = 0;
    let mut free_servers = 0;
    let mut login_servers = 0;
    let mut cancel_servers = 0;
    let mut waiting_clients = 0;
    let mut active_clients = 0;
    for (_, pool) in pools.iter() {
        pool.with_inner(|inner| {
            used_servers += inner.list_count(ServerState::Active);
            free_servers += inner.list_count(ServerState::Idle)
                + inner.list_count(ServerState::Used)
                + inner.list_count(ServerState::Tested);
            login_servers += inner.list_count(ServerState::Login);
            cancel_servers += inner.list_count(ServerState::ActiveCancel)
                + inner.list_count(ServerState::BeingCanceled);
            waiting_clients += inner.waiting_client_count();
            active_clients += inner.clients.active.len();
        });
    }

    let rows = vec![
        vec!["databases".to_string(), config.databases.len().to_string()],
        vec!["users".to_string(), user_count.to_string()],
        vec!["pools".to_string(), pools.len().to_string()],
        vec!["used_clients".to_string(), active_clients.to_string()],
        vec!["waiting_clients".to_string(), waiting_clients.to_string()],
        vec!["used_servers".to_string(), used_servers.to_string()],
        vec!["free_servers".to_string(), free_servers.to_string()],
        vec!["login_servers".to_string(), login_servers.to_string()],
        vec!["cancel_servers".to_string(), cancel_servers.to_string()],
    ];

    send_rows(
        stream,
        &[("list", DataType::Text), ("items", DataType::Int4)],
        rows,
    )
    .await
}

pub async fn show_fds<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let rows = LISTENER_FDS
        .lock()
        .iter()
        .map(|fd| vec![fd.to_string(), "listener".to_string()])
        .collect();

    send_rows(
        stream,
        &[("fd", DataType::Int4), ("task", DataType::Text)],
        rows,
    )
    .await
}

pub async fn show_prepared_statements<T>(stream: &mut T) -> Result<(), Error>
where
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut rows = Vec::new();
    for (id, pool) in get_all_pools().iter() {
        if let Some(cache) = pool.prepared_statement_cache.as_ref() {
            for (query_id, parse) in cache.entries() {
                let mut query = parse.query.to_string();
                if query.len() > 128 {
                    query.truncate(128);
                    query.push_str("...");
                }
                rows.push(vec![
                    id.db.clone(),
                    id.user.clone(),
                    parse.name.clone(),
                    format!("{query_id:x}"),
                    query,
                ]);
            }
        }
    }
    rows.sort();

    send_rows(
        stream,
        &[
            ("database", DataType::Text),
            ("user", DataType::Text),
            ("name", DataType::Text),
            ("query_id", DataType::Text),
            ("query", DataType::Text),
        ],
        rows,
    )
    .await
}
