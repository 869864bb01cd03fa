use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::utils::clock;

/// All connected clients, keyed by the pooler-issued process id.
/// Feeds SHOW CLIENTS.
pub static CLIENT_REGISTRY: Lazy<DashMap<i32, Arc<ClientStats>>> = Lazy::new(DashMap::new);

/// Primary activity state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Connected, between queries.
    Idle = 1,
    /// Linked to a server, running a query or transaction.
    Active = 2,
    /// Waiting for a server connection from the pool.
    Waiting = 3,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Active => "active",
            ClientState::Waiting => "waiting",
        }
    }
}

/// Statistics and state for one client connection, shown by
/// SHOW CLIENTS and aggregated into pool stats.
pub struct ClientStats {
    process_id: i32,

    pub application_name: String,
    pub username: String,
    pub pool_name: String,
    pub addr: String,
    pub connect_time: quanta::Instant,

    state: AtomicU8,

    /// Total and worst-case time spent waiting for a server, in
    /// microseconds.
    pub total_wait_time: AtomicU64,
    pub max_wait_time: AtomicU64,

    pub transaction_count: AtomicU64,
    pub query_count: AtomicU64,
    pub error_count: AtomicU64,
}

impl Default for ClientStats {
    fn default() -> Self {
        ClientStats {
            process_id: 0,
            application_name: String::new(),
            username: String::new(),
            pool_name: String::new(),
            addr: String::new(),
            connect_time: clock::now(),
            state: AtomicU8::new(ClientState::Idle as u8),
            total_wait_time: AtomicU64::new(0),
            max_wait_time: AtomicU64::new(0),
            transaction_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }
}

impl ClientStats {
    pub fn new(
        process_id: i32,
        application_name: &str,
        username: &str,
        pool_name: &str,
        addr: &str,
    ) -> Self {
        ClientStats {
            process_id,
            application_name: application_name.to_string(),
            username: username.to_string(),
            pool_name: pool_name.to_string(),
            addr: addr.to_string(),
            connect_time: clock::now(),
            ..Default::default()
        }
    }

    /// Make this client visible to SHOW CLIENTS.
    pub fn register(self: &Arc<Self>) {
        CLIENT_REGISTRY.insert(self.process_id, self.clone());
    }

    pub fn disconnect(&self) {
        CLIENT_REGISTRY.remove(&self.process_id);
    }

    #[inline]
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Relaxed) {
            2 => ClientState::Active,
            3 => ClientState::Waiting,
            _ => ClientState::Idle,
        }
    }

    #[inline]
    pub fn idle(&self) {
        self.state.store(ClientState::Idle as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn active(&self) {
        self.state
            .store(ClientState::Active as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn waiting(&self) {
        self.state
            .store(ClientState::Waiting as u8, Ordering::Relaxed);
    }

    pub fn wait_time(&self, micros: u64) {
        self.total_wait_time.fetch_add(micros, Ordering::Relaxed);
        self.max_wait_time.fetch_max(micros, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction(&self) {
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn query(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}
