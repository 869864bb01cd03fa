//! Runtime statistics: per-client, per-server and per-pool counters
//! consumed by the admin console.

pub mod client;
pub mod pool;
pub mod server;

use std::sync::atomic::AtomicU64;

pub use client::{ClientState, ClientStats, CLIENT_REGISTRY};
pub use pool::{PoolStats, StatCounters};
pub use server::{ServerState as ServerStatState, ServerStats, SERVER_REGISTRY};

/// Connections accepted since process start.
pub static TOTAL_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);
/// Cancel connections accepted since process start.
pub static CANCEL_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);
