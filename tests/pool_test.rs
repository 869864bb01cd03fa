//! Pool behavior against an in-process fake PostgreSQL backend.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serial_test::serial;

use common::FakeBackend;
use pg_warden::config::{self, Config, Database, Duration as ConfigDuration, User};
use pg_warden::pool::{self, get_pool, lookup_claim, rebuild_pools};
use pg_warden::server::cancel_backend;

const DB: &str = "app_db";
const USER: &str = "app_user";

fn test_config(port: u16, mutate: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    config.general.admin_username = "admin".into();
    config.general.admin_password = "admin".into();
    config.general.query_wait_timeout = ConfigDuration::from_secs(2);
    config.general.server_connect_timeout = ConfigDuration::from_secs(2);

    let database = Database {
        host: "127.0.0.1".into(),
        port,
        users: vec![User {
            username: USER.into(),
            password: "secret".into(),
            pool_size: Some(1),
            ..User::default()
        }],
        ..Database::default()
    };

    config.databases = HashMap::from([(DB.to_string(), database)]);
    mutate(&mut config);
    config
}

async fn setup(port: u16, mutate: impl FnOnce(&mut Config)) -> pool::ConnectionPool {
    config::set_config(test_config(port, mutate));
    rebuild_pools().unwrap();
    get_pool(DB, USER).unwrap()
}

#[tokio::test]
#[serial]
async fn checkout_reuses_the_released_connection() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let mut lease = pool.get(1).await.unwrap();
    let first_pid = lease.server().process_id();
    pool.release(lease).await;

    let mut lease = pool.get(1).await.unwrap();
    assert_eq!(lease.server().process_id(), first_pid);
    pool.release(lease).await;

    // Only one physical connection was ever made.
    assert_eq!(backend.state.sessions.lock().len(), 1);
}

#[tokio::test]
#[serial]
async fn second_client_waits_for_the_single_server() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let lease = pool.get(1).await.unwrap();

    // The second client parks in the wait queue until the release.
    let contender = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let lease = pool.get(2).await.unwrap();
            let waited = started.elapsed();
            pool.release(lease).await;
            waited
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.release(lease).await;

    let waited = contender.await.unwrap();
    assert!(waited >= Duration::from_millis(150), "waited {waited:?}");
    assert_eq!(backend.state.sessions.lock().len(), 1);
}

#[tokio::test]
#[serial]
async fn wait_queue_times_out_with_an_error() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |config| {
        config.general.query_wait_timeout = ConfigDuration::from_millis(200);
    })
    .await;

    let lease = pool.get(1).await.unwrap();
    let err = pool.get(2).await.err().expect("second checkout must fail");
    assert!(err.to_string().contains("query_wait_timeout"));
    pool.release(lease).await;
}

#[tokio::test]
#[serial]
async fn reserve_pool_opens_after_the_timeout() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |config| {
        config.general.reserve_pool_size = 1;
        config.general.reserve_pool_timeout = ConfigDuration::from_millis(100);
        config.general.query_wait_timeout = ConfigDuration::from_secs(5);
    })
    .await;

    // The only base server is taken.
    let mut busy = pool.get(1).await.unwrap();
    let first_pid = busy.server().process_id();

    // The second client exceeds reserve_pool_timeout, after which the
    // effective cap rises and a second server is launched.
    let started = std::time::Instant::now();
    let mut lease = pool.get(2).await.unwrap();
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
    assert_eq!(backend.state.sessions.lock().len(), 2);
    assert_ne!(lease.server().process_id(), first_pid);

    pool.release(lease).await;
    pool.release(busy).await;
}

#[tokio::test]
#[serial]
async fn cancel_request_reaches_the_backend_with_the_server_key() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let mut lease = pool.get(1).await.unwrap();
    let backend_pid = lease.server().process_id();
    let backend_key = lease.server().secret_key();

    // The pooler-issued client key maps to the server-side key.
    let client_key = (4242, 2424);
    lease.server().claim(client_key.0, client_key.1);

    let target = lookup_claim(client_key.0, client_key.1).expect("claim must be registered");
    assert_eq!(target.backend_pid, backend_pid);
    assert_eq!(target.backend_key, backend_key);

    // Forwarding opens a fresh connection and sends the *server* key.
    cancel_backend(&target.host, target.port, target.backend_pid, target.backend_key)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        backend.state.cancel_requests.lock().as_slice(),
        &[(backend_pid, backend_key)]
    );

    lease.server().unclaim(client_key.0, client_key.1);
    assert!(lookup_claim(client_key.0, client_key.1).is_none());
    pool.release(lease).await;
}

#[tokio::test]
#[serial]
async fn being_canceled_server_is_not_reused_until_cancels_drain() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let lease = pool.get(1).await.unwrap();
    let server_id = lease.id;

    let key = (7, 8);
    assert!(pool.add_canceling_client(server_id, key));

    // Released while a cancel is in flight: the server parks in
    // being_canceled instead of idle.
    pool.release(lease).await;
    assert_eq!(
        pool.with_inner(|inner| inner.list_count(pool::ServerState::BeingCanceled)),
        1
    );
    assert_eq!(
        pool.with_inner(|inner| inner.list_count(pool::ServerState::Idle)),
        0
    );

    // The cancel resolves; the server becomes assignable again.
    pool.cancel_resolved(server_id, key);
    assert_eq!(
        pool.with_inner(|inner| inner.list_count(pool::ServerState::Idle)),
        1
    );

    let lease = pool.get(2).await.unwrap();
    assert_eq!(lease.id, server_id);
    pool.release(lease).await;
}

#[tokio::test]
#[serial]
async fn killed_pool_rejects_checkouts() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let lease = pool.get(1).await.unwrap();
    pool.release(lease).await;

    pool.kill();
    assert!(pool.get(2).await.is_err());
    assert_eq!(pool.connected_server_count(), 0);
}

#[tokio::test]
#[serial]
async fn paused_pool_queues_clients_until_resume() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |config| {
        config.general.query_wait_timeout = ConfigDuration::from_secs(5);
    })
    .await;

    // Warm one idle server, then pause.
    let lease = pool.get(1).await.unwrap();
    pool.release(lease).await;
    pool.pause();

    let contender = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let lease = pool.get(2).await.unwrap();
            pool.release(lease).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!contender.is_finished(), "client must wait while paused");

    pool.resume();
    tokio::time::timeout(Duration::from_secs(2), contender)
        .await
        .expect("resume must serve the queued client")
        .unwrap();
}

#[tokio::test]
#[serial]
async fn welcome_parameters_come_from_the_server() {
    let backend = FakeBackend::start().await;
    let pool = setup(backend.port, |_| {}).await;

    let params = pool.welcome_parameters().await.unwrap();
    assert_eq!(params.get("server_version").unwrap(), "15.4 (fake)");
    assert_eq!(params.get("client_encoding").unwrap(), "UTF8");
}
