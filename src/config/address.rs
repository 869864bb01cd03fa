//! Server address and pooling discipline types.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// The release discipline of a pool.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// The server is released when the client disconnects.
    Session,
    /// The server is released when the transaction ends.
    Transaction,
    /// The server is released after every command; multi-statement
    /// transactions are rejected.
    Statement,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::Session => write!(f, "session"),
            PoolMode::Transaction => write!(f, "transaction"),
            PoolMode::Statement => write!(f, "statement"),
        }
    }
}

/// Host selection strategy for a comma-separated host list.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceHosts {
    #[default]
    Disable,
    RoundRobin,
}

/// One concrete server endpoint a pool connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Host name, IP address, or a unix socket directory.
    pub host: String,
    pub port: u16,

    /// Database name on the PostgreSQL server.
    pub database: String,

    /// User the pool logs in as.
    pub username: String,

    /// Name the clients use for this pool.
    pub pool_name: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}
