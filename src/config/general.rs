//! General configuration settings for the connection pooler.

use serde_derive::{Deserialize, Serialize};

use super::{Duration, PoolMode};

/// General configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    /// Shard accepting across worker listeners with SO_REUSEPORT.
    #[serde(default)] // false
    pub so_reuseport: bool,

    #[serde(default = "General::default_pool_mode")]
    pub pool_mode: PoolMode,

    /// Total client connections accepted at one time.
    #[serde(default = "General::default_max_client_conn")]
    pub max_client_conn: u64,

    #[serde(default = "General::default_default_pool_size")]
    pub default_pool_size: u32,

    #[serde(default)] // 0
    pub min_pool_size: u32,

    /// Extra servers allowed once a client has waited past
    /// `reserve_pool_timeout`.
    #[serde(default)] // 0
    pub reserve_pool_size: u32,

    #[serde(default = "General::default_reserve_pool_timeout")]
    pub reserve_pool_timeout: Duration,

    /// Server connection caps across all pools of one database / user.
    /// Zero means unlimited.
    #[serde(default)]
    pub max_db_connections: u32,
    #[serde(default)]
    pub max_user_connections: u32,

    /// Client connection caps per database / user. Zero means unlimited.
    #[serde(default)]
    pub max_db_client_connections: u32,
    #[serde(default)]
    pub max_user_client_connections: u32,

    #[serde(default = "General::default_server_lifetime")]
    pub server_lifetime: Duration,

    #[serde(default = "General::default_server_idle_timeout")]
    pub server_idle_timeout: Duration,

    #[serde(default = "General::default_server_reset_query")]
    pub server_reset_query: String,

    /// Run the reset query in session mode too.
    #[serde(default)] // false
    pub server_reset_query_always: bool,

    #[serde(default = "General::default_server_check_query")]
    pub server_check_query: String,

    #[serde(default = "General::default_server_check_delay")]
    pub server_check_delay: Duration,

    /// Close a released server immediately during shutdown instead of
    /// waiting for it to become idle.
    #[serde(default)] // false
    pub server_fast_close: bool,

    #[serde(default = "General::default_server_connect_timeout")]
    pub server_connect_timeout: Duration,

    /// Back-off after a failed server connect before trying again.
    #[serde(default = "General::default_server_login_retry")]
    pub server_login_retry: Duration,

    /// Zero disables.
    #[serde(default)]
    pub query_timeout: Duration,

    #[serde(default = "General::default_query_wait_timeout")]
    pub query_wait_timeout: Duration,

    #[serde(default = "General::default_cancel_wait_timeout")]
    pub cancel_wait_timeout: Duration,

    /// Zero disables.
    #[serde(default)]
    pub client_idle_timeout: Duration,

    #[serde(default = "General::default_client_login_timeout")]
    pub client_login_timeout: Duration,

    /// Zero disables.
    #[serde(default)]
    pub idle_transaction_timeout: Duration,

    /// Zero disables.
    #[serde(default)]
    pub transaction_timeout: Duration,

    #[serde(default = "General::default_suspend_timeout")]
    pub suspend_timeout: Duration,

    #[serde(default = "General::default_max_prepared_statements")]
    pub max_prepared_statements: usize,

    /// Capacity of the pool-wide interned statement table. Distinct
    /// from `max_prepared_statements`, which caps each individual
    /// server's cache.
    #[serde(default = "General::default_prepared_statements_cache_size")]
    pub prepared_statements_cache_size: usize,

    /// Zero means the built-in hard limit.
    #[serde(default)]
    pub max_packet_size: u32,

    #[serde(default = "General::default_tcp_keepalives_idle")]
    pub tcp_keepalives_idle: u64,
    #[serde(default = "General::default_tcp_keepalives_count")]
    pub tcp_keepalives_count: u32,
    #[serde(default = "General::default_tcp_keepalives_interval")]
    pub tcp_keepalives_interval: u64,
    #[serde(default)] // 0 seconds
    pub tcp_so_linger: u64,
    #[serde(default = "General::default_tcp_no_delay")]
    pub tcp_no_delay: bool,
    #[serde(default)] // 0 = max_client_conn
    pub backlog: u32,

    #[serde(default = "General::default_true")]
    pub log_client_connections: bool,

    #[serde(default = "General::default_true")]
    pub log_client_disconnections: bool,

    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(default = "General::default_stats_period")]
    pub stats_period: Duration,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    /// Ping query answered locally, e.g. `;`.
    #[serde(default = "General::default_pooler_check_query")]
    pub pooler_check_query: String,

    pub admin_username: String,
    pub admin_password: String,

    pub syslog_prog_name: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_port() -> u16 {
        6432
    }

    pub fn default_pool_mode() -> PoolMode {
        PoolMode::Transaction
    }

    pub fn default_max_client_conn() -> u64 {
        100
    }

    pub fn default_default_pool_size() -> u32 {
        20
    }

    pub fn default_reserve_pool_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn default_server_lifetime() -> Duration {
        Duration::from_secs(3600)
    }

    pub fn default_server_idle_timeout() -> Duration {
        Duration::from_secs(600)
    }

    pub fn default_server_reset_query() -> String {
        "DISCARD ALL".into()
    }

    pub fn default_server_check_query() -> String {
        "select 1".into()
    }

    pub fn default_server_check_delay() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_server_connect_timeout() -> Duration {
        Duration::from_secs(15)
    }

    pub fn default_server_login_retry() -> Duration {
        Duration::from_secs(15)
    }

    pub fn default_query_wait_timeout() -> Duration {
        Duration::from_secs(120)
    }

    pub fn default_cancel_wait_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn default_client_login_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_suspend_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn default_max_prepared_statements() -> usize {
        200
    }

    pub fn default_prepared_statements_cache_size() -> usize {
        8 * 1024
    }

    // These keepalive defaults should detect a dead connection within
    // tens of seconds. Tokio defaults to disabled keepalives, which
    // keeps dead connections around indefinitely and can exhaust the
    // server pool permanently.
    pub fn default_tcp_keepalives_idle() -> u64 {
        5
    }

    pub fn default_tcp_keepalives_count() -> u32 {
        5
    }

    pub fn default_tcp_keepalives_interval() -> u64 {
        5
    }

    pub fn default_tcp_no_delay() -> bool {
        true
    }

    pub fn default_true() -> bool {
        true
    }

    pub fn default_shutdown_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn default_stats_period() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_worker_threads() -> usize {
        4
    }

    pub fn default_pooler_check_query() -> String {
        ";".into()
    }

    /// Complete wire bytes of the health-check query, for cheap
    /// comparison against incoming Query messages.
    pub fn pooler_check_query_request_bytes(&self) -> Vec<u8> {
        use bytes::{BufMut, BytesMut};
        let mut buf = BytesMut::with_capacity(self.pooler_check_query.len() + 6);
        buf.put_u8(b'Q');
        buf.put_i32(self.pooler_check_query.len() as i32 + 4 + 1);
        buf.put_slice(self.pooler_check_query.as_bytes());
        buf.put_u8(0);
        buf.to_vec()
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: Self::default_host(),
            port: Self::default_port(),
            so_reuseport: false,
            pool_mode: Self::default_pool_mode(),
            max_client_conn: Self::default_max_client_conn(),
            default_pool_size: Self::default_default_pool_size(),
            min_pool_size: 0,
            reserve_pool_size: 0,
            reserve_pool_timeout: Self::default_reserve_pool_timeout(),
            max_db_connections: 0,
            max_user_connections: 0,
            max_db_client_connections: 0,
            max_user_client_connections: 0,
            server_lifetime: Self::default_server_lifetime(),
            server_idle_timeout: Self::default_server_idle_timeout(),
            server_reset_query: Self::default_server_reset_query(),
            server_reset_query_always: false,
            server_check_query: Self::default_server_check_query(),
            server_check_delay: Self::default_server_check_delay(),
            server_fast_close: false,
            server_connect_timeout: Self::default_server_connect_timeout(),
            server_login_retry: Self::default_server_login_retry(),
            query_timeout: Duration::default(),
            query_wait_timeout: Self::default_query_wait_timeout(),
            cancel_wait_timeout: Self::default_cancel_wait_timeout(),
            client_idle_timeout: Duration::default(),
            client_login_timeout: Self::default_client_login_timeout(),
            idle_transaction_timeout: Duration::default(),
            transaction_timeout: Duration::default(),
            suspend_timeout: Self::default_suspend_timeout(),
            max_prepared_statements: Self::default_max_prepared_statements(),
            prepared_statements_cache_size: Self::default_prepared_statements_cache_size(),
            max_packet_size: 0,
            tcp_keepalives_idle: Self::default_tcp_keepalives_idle(),
            tcp_keepalives_count: Self::default_tcp_keepalives_count(),
            tcp_keepalives_interval: Self::default_tcp_keepalives_interval(),
            tcp_so_linger: 0,
            tcp_no_delay: Self::default_tcp_no_delay(),
            backlog: 0,
            log_client_connections: true,
            log_client_disconnections: true,
            shutdown_timeout: Self::default_shutdown_timeout(),
            stats_period: Self::default_stats_period(),
            worker_threads: Self::default_worker_threads(),
            pooler_check_query: Self::default_pooler_check_query(),
            admin_username: String::from("admin"),
            admin_password: String::from("admin"),
            syslog_prog_name: None,
        }
    }
}
