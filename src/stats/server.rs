use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::utils::clock;

/// All live server connections, keyed by the pool-assigned server id.
/// Feeds SHOW SERVERS.
pub static SERVER_REGISTRY: Lazy<DashMap<u64, Arc<ServerStats>>> = Lazy::new(DashMap::new);

/// Displayed state of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Login = 1,
    Idle = 2,
    Active = 3,
    Used = 4,
    Tested = 5,
    BeingCanceled = 6,
    ActiveCancel = 7,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Login => "login",
            ServerState::Idle => "idle",
            ServerState::Active => "active",
            ServerState::Used => "used",
            ServerState::Tested => "tested",
            ServerState::BeingCanceled => "being_canceled",
            ServerState::ActiveCancel => "active_cancel",
        }
    }
}

/// Statistics for one server connection.
pub struct ServerStats {
    server_id: u64,

    pub pool_name: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub connect_time: quanta::Instant,

    state: AtomicU8,
    backend_pid: AtomicI32,

    /// Application name of the client currently linked, for display.
    pub application_name: parking_lot::Mutex<String>,

    pub transaction_count: AtomicU64,
    pub query_count: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Cumulative microseconds spent inside queries.
    pub query_time: AtomicU64,
}

impl ServerStats {
    pub fn new(server_id: u64, pool_name: &str, username: &str, host: &str, port: u16) -> Self {
        ServerStats {
            server_id,
            pool_name: pool_name.to_string(),
            username: username.to_string(),
            host: host.to_string(),
            port,
            connect_time: clock::now(),
            state: AtomicU8::new(ServerState::Login as u8),
            backend_pid: AtomicI32::new(0),
            application_name: parking_lot::Mutex::new(String::new()),
            transaction_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            query_time: AtomicU64::new(0),
        }
    }

    pub fn register(self: &Arc<Self>) {
        SERVER_REGISTRY.insert(self.server_id, self.clone());
    }

    pub fn disconnect(&self) {
        SERVER_REGISTRY.remove(&self.server_id);
    }

    #[inline]
    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn update_backend_pid(&self, pid: i32) {
        self.backend_pid.store(pid, Ordering::Relaxed);
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid.load(Ordering::Relaxed)
    }

    pub fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> ServerState {
        match self.state.load(Ordering::Relaxed) {
            1 => ServerState::Login,
            3 => ServerState::Active,
            4 => ServerState::Used,
            5 => ServerState::Tested,
            6 => ServerState::BeingCanceled,
            7 => ServerState::ActiveCancel,
            _ => ServerState::Idle,
        }
    }

    pub fn linked_application(&self, application_name: &str) {
        *self.application_name.lock() = application_name.to_string();
    }

    #[inline]
    pub fn transaction(&self) {
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn query(&self, micros: u64) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.query_time.fetch_add(micros, Ordering::Relaxed);
    }

    #[inline]
    pub fn data_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn data_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
