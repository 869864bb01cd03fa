//! Connection pools. One pool per (database, user) pair, owning the
//! per-state server lists and the queue of clients contending for
//! them.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::{get_config, Address, Config, Database, General, LoadBalanceHosts, PoolMode, User};
use crate::errors::Error;
use crate::server::{PreparedStatementCache, Server, ServerParameters};
use crate::stats::{PoolStats, ServerStats};
use crate::utils::clock;

mod inner;
pub mod janitor;

pub use inner::{PoolInner, ServerEntry, ServerState};

pub type ProcessId = i32;
pub type SecretKey = i32;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAITER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Where a cancel request must be forwarded, recorded when a client is
/// linked to a server.
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub backend_pid: i32,
    pub backend_key: i32,
    pub host: String,
    pub port: u16,
    pub pool_id: PoolIdentifier,
    pub server_id: u64,
}

/// Maps (client process_id, client secret_key) to the server backing
/// it, for query cancellation.
pub static CLIENT_SERVER_MAP: Lazy<DashMap<(ProcessId, SecretKey), CancelTarget>> =
    Lazy::new(DashMap::new);

#[allow(clippy::too_many_arguments)]
pub fn claim_server(
    client_process_id: i32,
    client_secret_key: i32,
    backend_pid: i32,
    backend_key: i32,
    host: &str,
    port: u16,
    pool_id: PoolIdentifier,
    server_id: u64,
) {
    CLIENT_SERVER_MAP.insert(
        (client_process_id, client_secret_key),
        CancelTarget {
            backend_pid,
            backend_key,
            host: host.to_string(),
            port,
            pool_id,
            server_id,
        },
    );
}

pub fn release_claim(client_process_id: i32, client_secret_key: i32) {
    CLIENT_SERVER_MAP.remove(&(client_process_id, client_secret_key));
}

pub fn lookup_claim(client_process_id: i32, client_secret_key: i32) -> Option<CancelTarget> {
    CLIENT_SERVER_MAP
        .get(&(client_process_id, client_secret_key))
        .map(|entry| entry.value().clone())
}

/// An identifier for a pool.
#[derive(Hash, Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolIdentifier {
    /// The name of the database clients want to connect to.
    pub db: String,

    /// The username the client connects with. Each user gets its own
    /// pool.
    pub user: String,
}

impl PoolIdentifier {
    pub fn new(db: &str, user: &str) -> PoolIdentifier {
        PoolIdentifier {
            db: db.to_string(),
            user: user.to_string(),
        }
    }
}

impl Display for PoolIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

// ---------------------------------------------------------------------
// Cross-pool runtime counters for database- and user-level caps.
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub server_connections: AtomicU32,
    pub client_connections: AtomicU32,
}

/// Counters per database name (across all its per-user pools).
pub static DB_COUNTERS: Lazy<DashMap<String, Arc<RuntimeCounters>>> = Lazy::new(DashMap::new);
/// Counters per user name (across all databases).
pub static USER_COUNTERS: Lazy<DashMap<String, Arc<RuntimeCounters>>> = Lazy::new(DashMap::new);

pub fn db_counters(db: &str) -> Arc<RuntimeCounters> {
    DB_COUNTERS
        .entry(db.to_string())
        .or_default()
        .value()
        .clone()
}

pub fn user_counters(user: &str) -> Arc<RuntimeCounters> {
    USER_COUNTERS
        .entry(user.to_string())
        .or_default()
        .value()
        .clone()
}

/// Check the per-database and per-user client connection caps at
/// accept time. On success the counts are incremented; the returned
/// guard decrements them again on drop.
pub fn admit_client(pool_name: &str, username: &str) -> Result<ClientAdmission, Error> {
    let config = get_config();
    let db_cap = config
        .databases
        .get(pool_name)
        .and_then(|d| d.max_db_client_connections)
        .unwrap_or(config.general.max_db_client_connections);
    let user_cap = config
        .databases
        .get(pool_name)
        .and_then(|d| d.users.iter().find(|u| u.username == username))
        .and_then(|u| u.max_user_client_connections)
        .unwrap_or(config.general.max_user_client_connections);

    let db = db_counters(pool_name);
    let user = user_counters(username);

    let db_now = db.client_connections.fetch_add(1, Ordering::SeqCst) + 1;
    if db_cap > 0 && db_now > db_cap {
        db.client_connections.fetch_sub(1, Ordering::SeqCst);
        return Err(Error::AdmissionError(format!(
            "database {pool_name:?} has too many client connections (max_db_client_connections)"
        )));
    }

    let user_now = user.client_connections.fetch_add(1, Ordering::SeqCst) + 1;
    if user_cap > 0 && user_now > user_cap {
        db.client_connections.fetch_sub(1, Ordering::SeqCst);
        user.client_connections.fetch_sub(1, Ordering::SeqCst);
        return Err(Error::AdmissionError(format!(
            "user {username:?} has too many client connections (max_user_client_connections)"
        )));
    }

    Ok(ClientAdmission { db, user })
}

pub struct ClientAdmission {
    db: Arc<RuntimeCounters>,
    user: Arc<RuntimeCounters>,
}

impl Drop for ClientAdmission {
    fn drop(&mut self) {
        self.db.client_connections.fetch_sub(1, Ordering::SeqCst);
        self.user.client_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------
// Pool settings.
// ---------------------------------------------------------------------

/// Settings resolved from (General, Database, User) at pool creation.
/// Immutable for the pool's lifetime; RELOAD recreates the pool when
/// anything here changes.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub pool_mode: PoolMode,
    pub user: User,
    pub db: String,

    /// Database name on the server.
    pub server_database: String,
    pub hosts: Vec<String>,
    pub port: u16,
    pub load_balance_hosts: LoadBalanceHosts,

    pub pool_size: u32,
    pub min_pool_size: u32,
    pub reserve_pool_size: u32,
    pub reserve_pool_timeout: crate::config::Duration,

    pub max_db_connections: u32,
    pub max_user_connections: u32,

    pub server_lifetime: crate::config::Duration,
    pub server_idle_timeout: crate::config::Duration,
    pub server_reset_query: String,
    pub server_reset_query_always: bool,
    pub server_check_query: String,
    pub server_check_delay: crate::config::Duration,
    pub server_fast_close: bool,
    pub server_connect_timeout: crate::config::Duration,
    pub server_login_retry: crate::config::Duration,

    pub query_timeout: crate::config::Duration,
    pub query_wait_timeout: crate::config::Duration,
    pub cancel_wait_timeout: crate::config::Duration,
    pub client_idle_timeout: crate::config::Duration,
    pub idle_transaction_timeout: crate::config::Duration,
    pub transaction_timeout: crate::config::Duration,

    pub connect_query: Option<String>,
    pub max_prepared_statements: usize,
}

impl PoolSettings {
    fn from_config(pool_name: &str, database: &Database, user: &User, general: &General) -> Self {
        PoolSettings {
            pool_mode: user
                .pool_mode
                .or(database.pool_mode)
                .unwrap_or(general.pool_mode),
            user: user.clone(),
            db: pool_name.to_string(),
            server_database: database
                .dbname
                .clone()
                .unwrap_or_else(|| pool_name.to_string()),
            hosts: database.hosts(),
            port: database.port,
            load_balance_hosts: database.load_balance_hosts,
            pool_size: user
                .pool_size
                .or(database.pool_size)
                .unwrap_or(general.default_pool_size),
            min_pool_size: user
                .min_pool_size
                .or(database.min_pool_size)
                .unwrap_or(general.min_pool_size),
            reserve_pool_size: database
                .reserve_pool_size
                .unwrap_or(general.reserve_pool_size),
            reserve_pool_timeout: general.reserve_pool_timeout,
            max_db_connections: database
                .max_db_connections
                .unwrap_or(general.max_db_connections),
            max_user_connections: user
                .max_user_connections
                .unwrap_or(general.max_user_connections),
            server_lifetime: user
                .server_lifetime
                .or(database.server_lifetime)
                .unwrap_or(general.server_lifetime),
            server_idle_timeout: general.server_idle_timeout,
            server_reset_query: general.server_reset_query.clone(),
            server_reset_query_always: general.server_reset_query_always,
            server_check_query: general.server_check_query.clone(),
            server_check_delay: general.server_check_delay,
            server_fast_close: general.server_fast_close,
            server_connect_timeout: general.server_connect_timeout,
            server_login_retry: general.server_login_retry,
            query_timeout: user.query_timeout.unwrap_or(general.query_timeout),
            query_wait_timeout: general.query_wait_timeout,
            cancel_wait_timeout: general.cancel_wait_timeout,
            client_idle_timeout: user
                .client_idle_timeout
                .unwrap_or(general.client_idle_timeout),
            idle_transaction_timeout: user
                .idle_transaction_timeout
                .unwrap_or(general.idle_transaction_timeout),
            transaction_timeout: user
                .transaction_timeout
                .unwrap_or(general.transaction_timeout),
            connect_query: database.connect_query.clone(),
            max_prepared_statements: general.max_prepared_statements,
        }
    }
}

/// Runtime flags toggled by the admin console.
#[derive(Debug, Default)]
pub struct PoolFlags {
    pub paused: AtomicBool,
    pub wait_close: AtomicBool,
    pub dead: AtomicBool,
}

// ---------------------------------------------------------------------
// The pool.
// ---------------------------------------------------------------------

/// The globally accessible connection pool for one (database, user)
/// pair. Clones share state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
    pub settings: Arc<PoolSettings>,
    pub stats: Arc<PoolStats>,
    pub flags: Arc<PoolFlags>,

    /// Compared on RELOAD to decide whether the pool must be
    /// recreated.
    pub config_hash: u64,

    /// Shared statement definitions for all clients of this pool.
    pub prepared_statement_cache: Option<Arc<PreparedStatementCache>>,

    /// Parameters sent to clients on startup, captured from the first
    /// server connection.
    original_server_parameters: Arc<tokio::sync::Mutex<ServerParameters>>,
}

/// A checked-out server connection. Returned to the pool with
/// [`ConnectionPool::release`]; dropping it without releasing destroys
/// the connection (crash-safe default).
pub struct ServerLease {
    pool: ConnectionPool,
    pub id: u64,
    server: Option<Server>,
}

impl ServerLease {
    pub fn server(&mut self) -> &mut Server {
        self.server.as_mut().expect("lease already consumed")
    }

    fn take(mut self) -> (u64, Server) {
        let server = self.server.take().expect("lease already consumed");
        (self.id, server)
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            warn!("Server lease dropped without release, destroying connection");
            self.pool.destroy_server(self.id, server);
        }
    }
}

impl ConnectionPool {
    fn new(
        settings: PoolSettings,
        config_hash: u64,
        prepared_statement_cache: Option<Arc<PreparedStatementCache>>,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(Mutex::new(PoolInner::new())),
            settings: Arc::new(settings),
            stats: Arc::new(PoolStats::new()),
            flags: Arc::new(PoolFlags::default()),
            config_hash,
            prepared_statement_cache,
            original_server_parameters: Arc::new(tokio::sync::Mutex::new(ServerParameters::new())),
        }
    }

    pub fn identifier(&self) -> PoolIdentifier {
        PoolIdentifier::new(&self.settings.db, &self.settings.user.username)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.flags.dead.load(Ordering::Relaxed)
    }

    /// Run a closure under the pool lock. The janitor and console use
    /// this for list inspection.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut PoolInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    // -----------------------------------------------------------------
    // Client membership.
    // -----------------------------------------------------------------

    pub fn register_client(&self, process_id: i32) {
        self.inner.lock().clients.active.insert(process_id);
    }

    pub fn unregister_client(&self, process_id: i32) {
        self.inner.lock().clients.active.remove(&process_id);
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.active.len()
    }

    // -----------------------------------------------------------------
    // Assignment.
    // -----------------------------------------------------------------

    /// Get a server connection for the client, waiting if the pool is
    /// at capacity. Enforces `query_wait_timeout` and unlocks the
    /// reserve pool after `reserve_pool_timeout`.
    pub async fn get(&self, client_process_id: i32) -> Result<ServerLease, Error> {
        enum Plan {
            Got(u64, Server, std::time::Duration),
            Launch(u64, Arc<ServerStats>),
            Wait(
                oneshot::Receiver<Result<(u64, Server), Error>>,
                u64,
            ),
        }

        let wait_start = clock::now();
        let settings = self.settings.clone();
        let mut reserve_unlocked = false;

        loop {
            let plan = {
                let mut inner = self.inner.lock();

                if self.is_dead() {
                    return Err(Error::ShuttingDown);
                }

                let idle_age = inner
                    .list(ServerState::Idle)
                    .front()
                    .and_then(|id| inner.entry(*id))
                    .map(|entry| entry.last_used_at.elapsed());

                if !self.is_paused() {
                    if let Some((id, conn)) = inner.pop_idle() {
                        Plan::Got(id, conn, idle_age.unwrap_or_default())
                    } else if self.launch_capacity_left(&inner, reserve_unlocked)
                        && inner.login_allowed(settings.server_login_retry.as_std())
                    {
                        let (id, stats) = self.insert_login_entry(&mut inner)?;
                        Plan::Launch(id, stats)
                    } else {
                        let (tx, rx) = oneshot::channel();
                        let token = NEXT_WAITER_TOKEN.fetch_add(1, Ordering::Relaxed);
                        inner.waiters.push_back(inner::Waiter {
                            token,
                            client_process_id,
                            queued_at: clock::now(),
                            tx,
                        });
                        Plan::Wait(rx, token)
                    }
                } else {
                    // Paused: queue until RESUME hands servers back out.
                    let (tx, rx) = oneshot::channel();
                    let token = NEXT_WAITER_TOKEN.fetch_add(1, Ordering::Relaxed);
                    inner.waiters.push_back(inner::Waiter {
                        token,
                        client_process_id,
                        queued_at: clock::now(),
                        tx,
                    });
                    Plan::Wait(rx, token)
                }
            };

            match plan {
                Plan::Got(id, mut conn, idle_age) => {
                    // A connection that sat idle may be silently dead;
                    // probe it before linking.
                    if !settings.server_check_query.is_empty()
                        && !settings.server_check_delay.is_disabled()
                        && idle_age >= settings.server_check_delay.as_std()
                    {
                        if let Err(err) = conn
                            .small_simple_query(&settings.server_check_query)
                            .await
                        {
                            warn!("Idle server failed the check query: {err}");
                            self.destroy_server(id, conn);
                            continue;
                        }
                    }
                    self.finish_assignment(wait_start);
                    return Ok(ServerLease {
                        pool: self.clone(),
                        id,
                        server: Some(conn),
                    });
                }

                Plan::Launch(id, stats) => {
                    let lease = self.connect_for_client(id, stats).await?;
                    self.finish_assignment(wait_start);
                    return Ok(lease);
                }

                Plan::Wait(rx, token) => {
                    let total = settings.query_wait_timeout.as_std();
                    let elapsed = wait_start.elapsed();
                    if elapsed >= total {
                        self.inner.lock().remove_waiter(token);
                        return Err(Error::AdmissionError(
                            "query_wait_timeout exceeded while waiting for a server".into(),
                        ));
                    }
                    let remaining = total - elapsed;

                    let reserve_available =
                        settings.reserve_pool_size > 0 && !reserve_unlocked && !self.is_paused();
                    let step = if reserve_available {
                        let reserve_in = settings
                            .reserve_pool_timeout
                            .as_std()
                            .saturating_sub(elapsed);
                        remaining.min(reserve_in.max(std::time::Duration::from_millis(1)))
                    } else {
                        remaining
                    };

                    match tokio::time::timeout(step, rx).await {
                        Ok(Ok(Ok((id, conn)))) => {
                            self.finish_assignment(wait_start);
                            return Ok(ServerLease {
                                pool: self.clone(),
                                id,
                                server: Some(conn),
                            });
                        }
                        Ok(Ok(Err(err))) => return Err(err),
                        Ok(Err(_)) => return Err(Error::AllServersDown),
                        Err(_) => {
                            self.inner.lock().remove_waiter(token);
                            if reserve_available
                                && wait_start.elapsed()
                                    >= settings.reserve_pool_timeout.as_std()
                            {
                                // The reserve pool opens up for this
                                // client; retry with the higher cap.
                                reserve_unlocked = true;
                                continue;
                            }
                            return Err(Error::AdmissionError(
                                "query_wait_timeout exceeded while waiting for a server".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn finish_assignment(&self, wait_start: quanta::Instant) {
        let waited = wait_start.elapsed().as_micros() as u64;
        self.stats.server_assignment();
        if waited > 0 {
            self.stats.wait(waited);
        }
    }

    fn launch_capacity_left(&self, inner: &PoolInner, reserve_unlocked: bool) -> bool {
        let settings = &self.settings;
        let cap = settings.pool_size
            + if reserve_unlocked {
                settings.reserve_pool_size
            } else {
                0
            };
        if inner.total_server_count() >= cap as usize {
            return false;
        }

        if settings.max_db_connections > 0 {
            let db = db_counters(&settings.db);
            if db.server_connections.load(Ordering::SeqCst) >= settings.max_db_connections {
                return false;
            }
        }
        if settings.max_user_connections > 0 {
            let user = user_counters(&settings.user.username);
            if user.server_connections.load(Ordering::SeqCst) >= settings.max_user_connections {
                return false;
            }
        }
        true
    }

    /// Allocate an id, a stats record and a Login entry. Counters are
    /// incremented here and decremented in `remove_server_entry`.
    pub(crate) fn insert_login_entry(
        &self,
        inner: &mut PoolInner,
    ) -> Result<(u64, Arc<ServerStats>), Error> {
        let id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed);
        let settings = &self.settings;

        let host_index = inner.next_host_index(
            settings.hosts.len(),
            settings.load_balance_hosts == LoadBalanceHosts::RoundRobin,
        );
        let host = settings.hosts[host_index].clone();

        let stats = Arc::new(ServerStats::new(
            id,
            &settings.db,
            &settings.user.username,
            &host,
            settings.port,
        ));

        db_counters(&settings.db)
            .server_connections
            .fetch_add(1, Ordering::SeqCst);
        user_counters(&settings.user.username)
            .server_connections
            .fetch_add(1, Ordering::SeqCst);

        inner.insert_login(id, stats.clone());
        Ok((id, stats))
    }

    fn remove_server_entry(&self, inner: &mut PoolInner, id: u64) -> Option<Server> {
        // The entry may already be gone (pool killed while the
        // connection was out); the counters were released then.
        if inner.entry(id).is_none() {
            return None;
        }
        let conn = inner.remove(id);
        db_counters(&self.settings.db)
            .server_connections
            .fetch_sub(1, Ordering::SeqCst);
        user_counters(&self.settings.user.username)
            .server_connections
            .fetch_sub(1, Ordering::SeqCst);
        conn
    }

    /// The address a Login entry connects to, derived from its stats
    /// record (which captured the host choice).
    fn address_for(&self, stats: &ServerStats) -> Address {
        Address {
            host: stats.host.clone(),
            port: stats.port,
            database: self.settings.server_database.clone(),
            username: self.settings.user.username.clone(),
            pool_name: self.settings.db.clone(),
        }
    }

    /// Establish the connection for a Login entry and hand it straight
    /// to the requesting client.
    async fn connect_for_client(
        &self,
        id: u64,
        stats: Arc<ServerStats>,
    ) -> Result<ServerLease, Error> {
        match self.establish(id, stats).await {
            Ok(server) => {
                if !self
                    .inner
                    .lock()
                    .try_change_state(id, ServerState::Active)
                {
                    drop(server);
                    return Err(Error::ShuttingDown);
                }
                Ok(ServerLease {
                    pool: self.clone(),
                    id,
                    server: Some(server),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Establish the connection for a Login entry and park it idle (or
    /// hand it to a waiter). Used by the janitor for min_pool_size
    /// refill.
    pub(crate) async fn connect_for_pool(&self, id: u64, stats: Arc<ServerStats>) {
        match self.establish(id, stats).await {
            Ok(server) => self.park_idle(id, server),
            Err(err) => {
                error!("Background server connect failed: {err}");
            }
        }
    }

    async fn establish(&self, id: u64, stats: Arc<ServerStats>) -> Result<Server, Error> {
        let settings = self.settings.clone();
        let address = self.address_for(&stats);

        info!("Creating a new server connection to {address}");

        let connect = Server::startup(id, &address, &settings.user, stats, "pg_warden");
        let result = match tokio::time::timeout(settings.server_connect_timeout.as_std(), connect)
            .await
        {
            Ok(Ok(mut server)) => {
                if let Some(connect_query) = &settings.connect_query {
                    match server.run_connect_query(connect_query).await {
                        Ok(()) => Ok(server),
                        Err(err) => Err(err),
                    }
                } else {
                    Ok(server)
                }
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ServerStartupError(
                "connect timeout".into(),
                crate::errors::ServerIdentifier::new(
                    &settings.user.username,
                    &settings.server_database,
                ),
            )),
        };

        match result {
            Ok(server) => {
                // First successful connect: capture the welcome
                // parameters for future client startups.
                {
                    let mut original = self.original_server_parameters.lock().await;
                    if original.is_empty() {
                        original.set_from_hashmap(&server.server_parameters_as_hashmap(), true);
                    }
                }
                self.inner.lock().clear_connect_failure();
                Ok(server)
            }
            Err(err) => {
                let message = err.to_string();
                error!("Server connect failed for {}: {message}", self.identifier());
                let mut inner = self.inner.lock();
                self.remove_server_entry(&mut inner, id);
                inner.record_connect_failure(&message);
                // Everyone queued on this pool learns about the outage
                // now rather than at their individual timeouts.
                inner.fail_waiters(|| Error::AllServersDown);
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------
    // Release.
    // -----------------------------------------------------------------

    /// Return a checked-out server to the pool. The release path:
    /// close when marked, hold while cancels are in flight, otherwise
    /// reset-query (Tested), bookkeeping (Used), and park or hand off
    /// (Idle).
    pub async fn release(&self, lease: ServerLease) {
        let (id, mut server) = lease.take();
        let settings = self.settings.clone();

        let close_needed = {
            let inner = self.inner.lock();
            inner.entry(id).map(|e| e.close_needed).unwrap_or(true)
        };

        // server_fast_close: during shutdown a released connection is
        // not worth recycling.
        let fast_close = settings.server_fast_close
            && crate::app::server::SHUTDOWN_MODE.load(Ordering::SeqCst)
                != crate::app::server::ShutdownMode::None as u8;

        if server.is_bad() || close_needed || fast_close || self.is_dead() {
            self.destroy_server(id, server);
            return;
        }

        if let Err(err) = server.checkin_cleanup().await {
            warn!("Server cleanup failed at release: {err}");
            self.destroy_server(id, server);
            return;
        }

        // Held until every in-flight cancel aimed at it resolves, so a
        // stale cancel cannot kill the next client's query.
        {
            let mut inner = self.inner.lock();
            if inner
                .entry(id)
                .map(|e| !e.canceling_clients.is_empty())
                .unwrap_or(false)
            {
                inner.change_state(id, ServerState::BeingCanceled);
                inner.park(id, server);
                return;
            }
        }

        let run_reset = !settings.server_reset_query.is_empty()
            && (settings.pool_mode != PoolMode::Session || settings.server_reset_query_always);

        if run_reset {
            if !self.inner.lock().try_change_state(id, ServerState::Tested) {
                drop(server);
                return;
            }
            if let Err(err) = server.run_reset_query(&settings.server_reset_query).await {
                warn!("Reset query failed at release: {err}");
                self.destroy_server(id, server);
                return;
            }
        }

        // Brief bookkeeping stop in Used before the connection becomes
        // assignable again.
        {
            let mut inner = self.inner.lock();
            if !inner.try_change_state(id, ServerState::Used) {
                drop(inner);
                drop(server);
                return;
            }
            if let Some(entry) = inner.entry_mut(id) {
                entry.last_used_at = clock::now();
            }
        }

        self.park_idle(id, server);
    }

    /// Transition a connection to Idle, preferring a direct handoff to
    /// a waiting client (the connection then goes straight back to
    /// Active).
    fn park_idle(&self, id: u64, server: Server) {
        let mut inner = self.inner.lock();

        if self.is_dead() || inner.entry(id).is_none() {
            drop(inner);
            self.destroy_server(id, server);
            return;
        }

        if !self.is_paused() {
            // Handoff keeps the entry in Active state.
            inner.change_state(id, ServerState::Active);
            if let Some(entry) = inner.entry_mut(id) {
                entry.last_used_at = clock::now();
            }
            match inner.hand_to_waiter(id, server) {
                None => return,
                Some(server) => {
                    inner.change_state(id, ServerState::Idle);
                    inner.park(id, server);
                }
            }
        } else {
            inner.change_state(id, ServerState::Idle);
            inner.park(id, server);
        }
    }

    /// Destroy a checked-out connection (entry removal + socket drop).
    pub fn destroy_server(&self, id: u64, server: Server) {
        {
            let mut inner = self.inner.lock();
            self.remove_server_entry(&mut inner, id);
        }
        drop(server);
        self.kick_launcher();
    }

    /// Destroy a parked connection by id. A no-op if the connection
    /// was grabbed by a client in the meantime.
    pub(crate) fn destroy_parked(&self, id: u64) {
        let conn = {
            let mut inner = self.inner.lock();
            match inner.entry(id) {
                Some(entry) if entry.conn.is_some() => self.remove_server_entry(&mut inner, id),
                _ => None,
            }
        };
        drop(conn);
    }

    /// After a destroy, waiting clients may be stranded below
    /// capacity; launch a replacement for the head waiter.
    fn kick_launcher(&self) {
        let needs_launch = {
            let inner = self.inner.lock();
            inner.waiting_client_count() > 0
        };
        if !needs_launch || self.is_paused() || self.is_dead() {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let login = {
                let mut inner = pool.inner.lock();
                if inner.waiting_client_count() == 0
                    || !pool.launch_capacity_left(&inner, false)
                    || !inner.login_allowed(pool.settings.server_login_retry.as_std())
                {
                    None
                } else {
                    pool.insert_login_entry(&mut inner).ok()
                }
            };
            if let Some((id, stats)) = login {
                pool.connect_for_pool(id, stats).await;
            }
        });
    }

    // -----------------------------------------------------------------
    // Cancellation support.
    // -----------------------------------------------------------------

    /// Track an in-flight cancel against a server. Returns false if
    /// the server is already gone.
    pub fn add_canceling_client(&self, server_id: u64, key: (i32, i32)) -> bool {
        let mut inner = self.inner.lock();
        match inner.entry_mut(server_id) {
            Some(entry) => {
                entry.canceling_clients.insert(key);
                inner.clients.active_cancel.insert(key);
                true
            }
            None => false,
        }
    }

    /// A cancel request resolved. If its target sits in BeingCanceled
    /// and no other cancels remain, the server becomes reusable.
    pub fn cancel_resolved(&self, server_id: u64, key: (i32, i32)) {
        let promote = {
            let mut inner = self.inner.lock();
            inner.clients.active_cancel.remove(&key);
            match inner.entry_mut(server_id) {
                Some(entry) => {
                    entry.canceling_clients.remove(&key);
                    entry.canceling_clients.is_empty()
                        && entry.state == ServerState::BeingCanceled
                        && !entry.close_needed
                }
                None => false,
            }
        };

        if promote {
            let parked = {
                let mut inner = self.inner.lock();
                let conn = match inner.entry_mut(server_id) {
                    Some(entry) => entry.conn.take(),
                    None => return,
                };
                // Used bookkeeping, then idle/handoff as usual.
                if conn.is_some() && !inner.try_change_state(server_id, ServerState::Used) {
                    None
                } else {
                    conn
                }
            };
            if let Some(server) = parked {
                self.park_idle(server_id, server);
            }
        }
    }

    /// Register the short-lived connection that carries a
    /// CancelRequest. It occupies a pool slot but never becomes
    /// assignable.
    pub fn insert_cancel_carrier(&self) -> Result<(u64, Arc<ServerStats>), Error> {
        let mut inner = self.inner.lock();
        let (id, stats) = self.insert_login_entry(&mut inner)?;
        inner.change_state(id, ServerState::ActiveCancel);
        Ok((id, stats))
    }

    pub fn remove_cancel_carrier(&self, id: u64) {
        let mut inner = self.inner.lock();
        self.remove_server_entry(&mut inner, id);
    }

    // -----------------------------------------------------------------
    // Console operations.
    // -----------------------------------------------------------------

    /// Stop handing out servers. Completes once no server is linked.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);

        // Kick parked servers toward anyone who queued during the
        // pause.
        loop {
            let mut inner = self.inner.lock();
            if inner.waiting_client_count() == 0 {
                break;
            }
            match inner.pop_idle() {
                Some((id, server)) => match inner.hand_to_waiter(id, server) {
                    None => continue,
                    Some(server) => {
                        inner.change_state(id, ServerState::Idle);
                        inner.park(id, server);
                        break;
                    }
                },
                None => break,
            }
        }
    }

    /// All current server connections are closed when released; idle
    /// ones right away.
    pub fn reconnect(&self) {
        let parked: Vec<u64> = {
            let mut inner = self.inner.lock();
            for id in inner.all_ids() {
                if let Some(entry) = inner.entry_mut(id) {
                    entry.close_needed = true;
                }
            }
            inner
                .list(ServerState::Idle)
                .iter()
                .copied()
                .collect()
        };
        for id in parked {
            self.destroy_parked(id);
        }
    }

    /// Kill the pool: destroy every parked connection, mark the rest
    /// for closing, fail all waiters.
    pub fn kill(&self) {
        self.flags.dead.store(true, Ordering::SeqCst);

        let parked: Vec<u64> = {
            let mut inner = self.inner.lock();
            inner.fail_waiters(|| Error::ShuttingDown);
            for id in inner.all_ids() {
                if let Some(entry) = inner.entry_mut(id) {
                    entry.close_needed = true;
                }
            }
            inner
                .all_ids()
                .into_iter()
                .filter(|id| {
                    inner
                        .entry(*id)
                        .map(|e| e.conn.is_some())
                        .unwrap_or(false)
                })
                .collect()
        };
        for id in parked {
            self.destroy_parked(id);
        }
    }

    pub fn active_server_count(&self) -> usize {
        self.inner.lock().list_count(ServerState::Active)
    }

    pub fn connected_server_count(&self) -> usize {
        self.inner.lock().connected_server_count()
    }

    /// Parameters presented to clients on login. Connects a first
    /// server if none was ever established.
    pub async fn welcome_parameters(&self) -> Result<ServerParameters, Error> {
        {
            let guard = self.original_server_parameters.lock().await;
            if !guard.is_empty() {
                return Ok(guard.clone());
            }
        }

        info!("Fetching startup parameters from {}", self.identifier());
        let lease = self.get(0).await?;
        self.release(lease).await;

        let guard = self.original_server_parameters.lock().await;
        Ok(guard.clone())
    }
}

// ---------------------------------------------------------------------
// Global pool registry.
// ---------------------------------------------------------------------

pub type PoolMap = HashMap<PoolIdentifier, ConnectionPool>;

/// All pools, swapped atomically on RELOAD.
pub static POOLS: Lazy<ArcSwap<PoolMap>> = Lazy::new(|| ArcSwap::from_pointee(HashMap::default()));

/// Pools removed by RELOAD, kept until the janitor confirms they are
/// drained.
pub static RETIRED_POOLS: Lazy<Mutex<Vec<ConnectionPool>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn get_pool(db: &str, user: &str) -> Option<ConnectionPool> {
    (*(*POOLS.load())).get(&PoolIdentifier::new(db, user)).cloned()
}

pub fn get_all_pools() -> Arc<PoolMap> {
    POOLS.load_full()
}

fn general_hash(general: &General) -> u64 {
    // The settings snapshot bakes in General values; hash the ones
    // that matter so RELOAD recreates pools when they change.
    let mut hasher = DefaultHasher::new();
    general.pool_mode.hash(&mut hasher);
    general.default_pool_size.hash(&mut hasher);
    general.min_pool_size.hash(&mut hasher);
    general.reserve_pool_size.hash(&mut hasher);
    general.reserve_pool_timeout.hash(&mut hasher);
    general.max_db_connections.hash(&mut hasher);
    general.max_user_connections.hash(&mut hasher);
    general.server_lifetime.hash(&mut hasher);
    general.server_idle_timeout.hash(&mut hasher);
    general.server_reset_query.hash(&mut hasher);
    general.server_reset_query_always.hash(&mut hasher);
    general.server_check_query.hash(&mut hasher);
    general.server_check_delay.hash(&mut hasher);
    general.server_fast_close.hash(&mut hasher);
    general.server_connect_timeout.hash(&mut hasher);
    general.server_login_retry.hash(&mut hasher);
    general.query_timeout.hash(&mut hasher);
    general.query_wait_timeout.hash(&mut hasher);
    general.cancel_wait_timeout.hash(&mut hasher);
    general.client_idle_timeout.hash(&mut hasher);
    general.idle_transaction_timeout.hash(&mut hasher);
    general.transaction_timeout.hash(&mut hasher);
    general.max_prepared_statements.hash(&mut hasher);
    general.prepared_statements_cache_size.hash(&mut hasher);
    hasher.finish()
}

fn pool_config_hash(database: &Database, user: &User, general: &General) -> u64 {
    let mut hasher = DefaultHasher::new();
    database.hash(&mut hasher);
    user.hash(&mut hasher);
    general_hash(general).hash(&mut hasher);
    hasher.finish()
}

/// Build (or rebuild, on RELOAD) the pool map from the current
/// configuration. Pools whose configuration is unchanged are carried
/// over; removed ones are retired and drained by the janitor.
pub fn rebuild_pools() -> Result<(), Error> {
    let config: Config = get_config();
    let old_pools = get_all_pools();
    let mut new_pools = HashMap::new();

    for (pool_name, database) in &config.databases {
        for user in &database.users {
            let identifier = PoolIdentifier::new(pool_name, &user.username);
            let new_hash = pool_config_hash(database, user, &config.general);

            if let Some(existing) = old_pools.get(&identifier) {
                if existing.config_hash == new_hash {
                    info!("[pool: {identifier}] has not changed");
                    new_pools.insert(identifier, existing.clone());
                    continue;
                }
            }

            info!("Creating new pool {identifier}");
            let settings = PoolSettings::from_config(pool_name, database, user, &config.general);
            // The interner's capacity is its own knob;
            // max_prepared_statements caps the per-server caches.
            let prepared_statement_cache = match settings.max_prepared_statements {
                0 => None,
                _ => Some(Arc::new(PreparedStatementCache::new(
                    config.general.prepared_statements_cache_size,
                ))),
            };
            let pool = ConnectionPool::new(settings, new_hash, prepared_statement_cache);
            new_pools.insert(identifier, pool);
        }
    }

    // Anything not carried over drains and dies.
    let mut retired = RETIRED_POOLS.lock();
    for (identifier, pool) in old_pools.iter() {
        if !new_pools.contains_key(identifier) {
            warn!("Retiring pool {identifier}");
            pool.kill();
            retired.push(pool.clone());
        }
    }

    POOLS.store(Arc::new(new_pools));
    Ok(())
}
