//! Per-database configuration.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

use super::{Duration, LoadBalanceHosts, PoolMode, User};

/// A database entry from the configuration. One pool is created per
/// (database, user) pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Database {
    /// Pool mode override; the general setting applies when absent.
    pub pool_mode: Option<PoolMode>,

    /// Host, or a comma-separated host list. A leading '/' selects a
    /// unix socket directory.
    #[serde(default = "Database::default_host")]
    pub host: String,

    #[serde(default = "Database::default_port")]
    pub port: u16,

    /// Strategy for picking a host out of a comma-separated list.
    #[serde(default)]
    pub load_balance_hosts: LoadBalanceHosts,

    /// The real name of the database on the server. The pool name is
    /// used when not specified.
    pub dbname: Option<String>,

    /// Per-database size overrides.
    pub pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
    pub reserve_pool_size: Option<u32>,

    /// Server connections across all pools of this database; zero or
    /// absent means unlimited.
    pub max_db_connections: Option<u32>,

    /// Client connections to this database; zero or absent means
    /// unlimited.
    pub max_db_client_connections: Option<u32>,

    pub server_lifetime: Option<Duration>,

    /// Query to run once on every fresh server connection.
    pub connect_query: Option<String>,

    #[serde(default = "Database::default_users", deserialize_with = "super::deserialize_users")]
    pub users: Vec<User>,
    // Note: keep simple fields above `users`; TOML cannot serialize a
    // simple value after a table array within the same section.
}

impl Database {
    pub fn hash_value(&self) -> u64 {
        let mut s = DefaultHasher::new();
        self.hash(&mut s);
        s.finish()
    }

    pub fn default_host() -> String {
        String::from("127.0.0.1")
    }

    pub fn default_port() -> u16 {
        5432
    }

    pub fn default_users() -> Vec<User> {
        Vec::new()
    }

    /// The configured host list, in declaration order.
    pub fn hosts(&self) -> Vec<String> {
        self.host
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.hosts().is_empty() {
            return Err(Error::BadConfig("database host list is empty".to_string()));
        }

        let mut seen_usernames = HashSet::new();
        for user in &self.users {
            if !seen_usernames.insert(&user.username) {
                return Err(Error::BadConfig(format!(
                    "duplicate username '{}' in database users",
                    user.username
                )));
            }
            user.validate()?;
        }

        Ok(())
    }
}

impl Default for Database {
    fn default() -> Database {
        Database {
            pool_mode: None,
            host: Self::default_host(),
            port: Self::default_port(),
            load_balance_hosts: LoadBalanceHosts::default(),
            dbname: None,
            pool_size: None,
            min_pool_size: None,
            reserve_pool_size: None,
            max_db_connections: None,
            max_db_client_connections: None,
            server_lifetime: None,
            connect_query: None,
            users: Vec::new(),
        }
    }
}
