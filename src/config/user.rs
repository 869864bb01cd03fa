//! PostgreSQL user configuration.

use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

use super::{Duration, PoolMode};

/// PostgreSQL user. The `password` is what clients authenticate
/// against (cleartext or an `md5`-prefixed hash); `server_username` /
/// `server_password`, when set, are the credentials the pooler itself
/// presents to the server.
#[derive(Clone, PartialEq, Hash, Eq, Serialize, Deserialize, Debug)]
pub struct User {
    pub username: String,
    pub password: String,

    pub pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
    pub pool_mode: Option<PoolMode>,
    pub server_lifetime: Option<Duration>,

    /// Per-user caps; zero or absent means the global setting applies.
    pub max_user_connections: Option<u32>,
    pub max_user_client_connections: Option<u32>,

    /// Per-user timeout overrides.
    pub query_timeout: Option<Duration>,
    pub transaction_timeout: Option<Duration>,
    pub idle_transaction_timeout: Option<Duration>,
    pub client_idle_timeout: Option<Duration>,

    pub server_username: Option<String>,
    pub server_password: Option<String>,
}

impl Default for User {
    fn default() -> User {
        User {
            username: String::from("postgres"),
            password: String::from(""),
            pool_size: None,
            min_pool_size: None,
            pool_mode: None,
            server_lifetime: None,
            max_user_connections: None,
            max_user_client_connections: None,
            query_timeout: None,
            transaction_timeout: None,
            idle_transaction_timeout: None,
            client_idle_timeout: None,
            server_username: None,
            server_password: None,
        }
    }
}

impl User {
    pub fn validate(&self) -> Result<(), Error> {
        if (self.server_password.is_some() && self.server_username.is_none())
            || (self.server_password.is_none() && self.server_username.is_some())
        {
            return Err(Error::BadConfig(
                "both the server_password and server_username must be specified at the same time"
                    .to_string(),
            ));
        }
        if let (Some(min_pool_size), Some(pool_size)) = (self.min_pool_size, self.pool_size) {
            if min_pool_size > pool_size {
                return Err(Error::BadConfig(format!(
                    "min_pool_size of {} cannot be larger than pool_size of {}",
                    min_pool_size, pool_size
                )));
            }
        };

        Ok(())
    }
}
