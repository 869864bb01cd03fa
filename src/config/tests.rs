use super::*;

const MINIMAL_TOML: &str = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"

[databases.app_db]
host = "127.0.0.1"
port = 5432
users = [
    { username = "app_user", password = "md5abcdef0123456789abcdef0123456789", pool_size = 10 },
]
"#;

#[test]
fn parses_minimal_toml() {
    let mut config = parse_config_content(MINIMAL_TOML, ConfigFormat::Toml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.general.port, General::default_port());
    assert_eq!(config.general.pool_mode, PoolMode::Transaction);

    let database = config.databases.get("app_db").unwrap();
    assert_eq!(database.hosts(), vec!["127.0.0.1"]);
    assert_eq!(database.users.len(), 1);
    assert_eq!(database.users[0].pool_size, Some(10));
}

#[test]
fn parses_yaml() {
    let yaml = r#"
general:
  admin_username: admin
  admin_password: hunter2
  pool_mode: session
  query_wait_timeout: 30s
databases:
  app_db:
    host: "10.0.0.1,10.0.0.2"
    load_balance_hosts: round-robin
    users:
      - username: app_user
        password: secret
"#;
    let mut config = parse_config_content(yaml, ConfigFormat::Yaml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.general.pool_mode, PoolMode::Session);
    assert_eq!(config.general.query_wait_timeout, Duration::from_secs(30));

    let database = config.databases.get("app_db").unwrap();
    assert_eq!(database.hosts(), vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(database.load_balance_hosts, LoadBalanceHosts::RoundRobin);
}

#[test]
fn format_detection() {
    assert_eq!(ConfigFormat::detect("a.yaml"), ConfigFormat::Yaml);
    assert_eq!(ConfigFormat::detect("a.YML"), ConfigFormat::Yaml);
    assert_eq!(ConfigFormat::detect("a.toml"), ConfigFormat::Toml);
    assert_eq!(ConfigFormat::detect("a.conf"), ConfigFormat::Toml);
}

#[test]
fn rejects_empty_databases() {
    let toml = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"

[databases]
"#;
    let mut config = parse_config_content(toml, ConfigFormat::Toml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn rejects_duplicate_users() {
    let toml = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"

[databases.app_db]
users = [
    { username = "u", password = "a" },
    { username = "u", password = "b" },
]
"#;
    let mut config = parse_config_content(toml, ConfigFormat::Toml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn rejects_zero_interner_capacity_with_prepared_statements_on() {
    let toml = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"
max_prepared_statements = 100
prepared_statements_cache_size = 0

[databases.db]
users = [{ username = "u", password = "p" }]
"#;
    let mut config = parse_config_content(toml, ConfigFormat::Toml).unwrap();
    assert!(config.validate().is_err());

    // Disabling prepared statements makes the capacity irrelevant.
    config.general.max_prepared_statements = 0;
    config.validate().unwrap();
}

#[test]
fn rejects_server_password_without_username() {
    let user = User {
        server_password: Some("x".into()),
        ..User::default()
    };
    assert!(user.validate().is_err());
}

#[test]
fn duration_accepts_number_and_string() {
    let toml = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"
server_lifetime = 60000
query_wait_timeout = "45s"

[databases.db]
users = [{ username = "u", password = "p" }]
"#;
    let config = parse_config_content(toml, ConfigFormat::Toml).unwrap();
    assert_eq!(config.general.server_lifetime, Duration::from_secs(60));
    assert_eq!(config.general.query_wait_timeout, Duration::from_secs(45));
}

#[test]
fn legacy_map_users_format() {
    let toml = r#"
[general]
admin_username = "admin"
admin_password = "hunter2"

[databases.db.users.0]
username = "u"
password = "p"
"#;
    let config = parse_config_content(toml, ConfigFormat::Toml).unwrap();
    assert_eq!(config.databases.get("db").unwrap().users.len(), 1);
}

#[test]
fn database_hash_changes_with_content() {
    let a = Database::default();
    let mut b = Database::default();
    assert_eq!(a.hash_value(), b.hash_value());
    b.port = 5433;
    assert_ne!(a.hash_value(), b.hash_value());
}
