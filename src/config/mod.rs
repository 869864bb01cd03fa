//! Configuration: parsing, validation and the globally shared,
//! atomically swapped snapshot.

use arc_swap::ArcSwap;
use log::{error, info};
use once_cell::sync::Lazy;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::Deserializer;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::Error;

mod address;
mod database;
mod duration;
mod general;
mod user;

#[cfg(test)]
mod tests;

pub use address::{Address, LoadBalanceHosts, PoolMode};
pub use database::Database;
pub use duration::Duration;
pub use general::General;
pub use user::User;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// Detect configuration format from file path extension.
    /// Returns Yaml for .yaml/.yml files, Toml for everything else.
    pub fn detect(path: &str) -> Self {
        let path_lower = path.to_lowercase();
        if path_lower.ends_with(".yaml") || path_lower.ends_with(".yml") {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        }
    }
}

/// Custom deserializer for users that supports both formats:
/// - Array format (recommended): `users = [{ username = "u", ... }]`
/// - Map format (legacy TOML): `users.0 = { username = "u", ... }`
pub(crate) fn deserialize_users<'de, D>(deserializer: D) -> Result<Vec<User>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UsersVisitor;

    impl<'de> Visitor<'de> for UsersVisitor {
        type Value = Vec<User>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a sequence of users or a map with numeric string keys")
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Vec<User>, S::Error>
        where
            S: SeqAccess<'de>,
        {
            let mut users = Vec::new();
            while let Some(user) = seq.next_element()? {
                users.push(user);
            }
            Ok(users)
        }

        fn visit_map<M>(self, mut map: M) -> Result<Vec<User>, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut users = Vec::new();
            while let Some((key, user)) = map.next_entry::<String, User>()? {
                if key.parse::<usize>().is_err() {
                    return Err(de::Error::custom(format!(
                        "invalid user key '{key}': expected numeric index or use array format"
                    )));
                }
                users.push(user);
            }
            Ok(users)
        }
    }

    deserializer.deserialize_any(UsersVisitor)
}

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(
        default = "Config::default_path",
        skip_serializing_if = "String::is_empty"
    )]
    pub path: String,

    pub general: General,

    pub databases: HashMap<String, Database>,
}

impl Config {
    pub fn default_path() -> String {
        String::from("pg_warden.toml")
    }

    /// Print current configuration.
    pub fn show(&self) {
        info!("Worker threads: {}", self.general.worker_threads);
        info!("Pool mode: {}", self.general.pool_mode);
        info!("Max client connections: {}", self.general.max_client_conn);
        info!("Default pool size: {}", self.general.default_pool_size);
        info!(
            "Reserve pool: {} (after {})",
            self.general.reserve_pool_size, self.general.reserve_pool_timeout
        );
        info!("Server lifetime: {}", self.general.server_lifetime);
        info!("Server idle timeout: {}", self.general.server_idle_timeout);
        info!("Server reset query: {:?}", self.general.server_reset_query);
        info!("Query wait timeout: {}", self.general.query_wait_timeout);
        info!(
            "Max prepared statements: {}",
            self.general.max_prepared_statements
        );
        info!("SO_REUSEPORT: {}", self.general.so_reuseport);

        for (name, database) in &self.databases {
            info!(
                "[database: {}] Server: {}:{}, mode: {}",
                name,
                database.host,
                database.port,
                database
                    .pool_mode
                    .unwrap_or(self.general.pool_mode)
            );
            for user in &database.users {
                info!(
                    "[database: {}] User {}: pool size {}",
                    name,
                    user.username,
                    user.pool_size.unwrap_or(self.general.default_pool_size)
                );
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.databases.is_empty() {
            return Err(Error::BadConfig(
                "at least one database must be configured".to_string(),
            ));
        }

        for (name, database) in self.databases.iter_mut() {
            database
                .validate()
                .map_err(|err| Error::BadConfig(format!("database {name:?}: {err}")))?;
        }

        if self.general.max_prepared_statements == 0 {
            // Zero disables prepared statement support entirely; still valid.
            info!("Prepared statement support is disabled");
        } else if self.general.prepared_statements_cache_size == 0 {
            return Err(Error::BadConfig(
                "prepared_statements_cache_size must be greater than zero when prepared \
                 statements are enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: Self::default_path(),
            general: General::default(),
            databases: HashMap::default(),
        }
    }
}

/// Get a read-only instance of the configuration from anywhere in the
/// app. ArcSwap makes this cheap and quick.
pub fn get_config() -> Config {
    (*(*CONFIG.load())).clone()
}

/// Install a configuration directly. Used by tests and by `parse`.
pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not open '{path}': {err}")));
        }
    };
    match file.read_to_string(&mut contents).await {
        Ok(_) => (),
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not read config file: {err}"
            )));
        }
    };
    Ok(contents)
}

/// Parse configuration content based on format.
pub fn parse_config_content(contents: &str, format: ConfigFormat) -> Result<Config, Error> {
    match format {
        ConfigFormat::Toml => toml::from_str(contents)
            .map_err(|err| Error::BadConfig(format!("TOML parse error: {err}"))),
        ConfigFormat::Yaml => serde_yaml::from_str(contents)
            .map_err(|err| Error::BadConfig(format!("YAML parse error: {err}"))),
    }
}

/// Parse the configuration file located at the path and install it
/// globally. Supports both TOML (.toml) and YAML (.yaml, .yml); the
/// format is auto-detected from the extension.
pub async fn parse(path: &str) -> Result<(), Error> {
    let contents = load_file(path).await?;
    let mut config = parse_config_content(&contents, ConfigFormat::detect(path))?;

    config.validate()?;
    config.path = path.to_string();

    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Re-read the configuration file and, if anything changed, rebuild the
/// pools. The swap happens atomically; existing sockets keep the
/// snapshot they were born under until they close.
pub async fn reload_config() -> Result<bool, Error> {
    let old_config = get_config();

    match parse(&old_config.path).await {
        Ok(()) => (),
        Err(err) => {
            error!("Config reload error: {err:?}");
            return Err(Error::BadConfig(format!("Config reload error: {err:?}")));
        }
    };

    let new_config = get_config();

    if old_config != new_config {
        info!("Config changed, reloading pools");
        crate::pool::rebuild_pools()?;
        Ok(true)
    } else {
        Ok(false)
    }
}
