//! Listener setup, the accept loop, signals and shutdown progression.

use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use once_cell::sync::Lazy;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::Notify;

use crate::app::args::Args;
use crate::config::{get_config, reload_config, Config};
use crate::format_duration;
use crate::messages::configure_tcp_socket;
use crate::pool;
use crate::stats::TOTAL_CONNECTION_COUNTER;

/// Clients currently connected to the pooler.
pub static CURRENT_CLIENT_COUNT: AtomicI64 = AtomicI64::new(0);

/// Shutdown progression, advanced by signals and the admin console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownMode {
    None = 0,
    /// Deny new clients, close servers as they become idle, drop
    /// waiting clients, exit when all servers are gone.
    WaitForServers = 1,
    /// Stop listening, keep serving connected clients until they
    /// leave.
    WaitForClients = 2,
    /// Close everything and exit now.
    Immediate = 3,
}

pub static SHUTDOWN_MODE: AtomicU8 = AtomicU8::new(ShutdownMode::None as u8);

/// Wakes the accept loop when the mode changes.
pub static SHUTDOWN_NOTIFY: Lazy<Arc<Notify>> = Lazy::new(|| Arc::new(Notify::new()));

/// Raw fds of the listening sockets, for SHOW FDS and rolling
/// restarts.
pub static LISTENER_FDS: Lazy<Mutex<Vec<RawFd>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn begin_shutdown(mode: ShutdownMode) {
    SHUTDOWN_MODE.store(mode as u8, Ordering::SeqCst);
    SHUTDOWN_NOTIFY.notify_waiters();
}

fn build_listener(config: &Config, inherit_fd: Option<i32>) -> TcpListener {
    if let Some(fd) = inherit_fd {
        info!("Inheriting listener from predecessor process (fd={fd})");
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .expect("can't set nonblocking on inherited listener");
        return TcpListener::from_std(std_listener).expect("can't adopt inherited listener");
    }

    let addr = format!("{}:{}", config.general.host, config.general.port)
        .to_socket_addrs()
        .expect("invalid listen address")
        .next()
        .expect("listen address resolved to nothing");

    let listen_socket = if addr.is_ipv4() {
        TcpSocket::new_v4().unwrap()
    } else {
        TcpSocket::new_v6().unwrap()
    };
    listen_socket.set_reuseaddr(true).expect("can't set reuseaddr");
    if config.general.so_reuseport {
        listen_socket.set_reuseport(true).expect("can't set reuseport");
    }
    listen_socket.set_nodelay(true).expect("can't set nodelay");
    {
        let sock_ref = SockRef::from(&listen_socket);
        sock_ref
            .set_linger(Some(Duration::from_secs(config.general.tcp_so_linger)))
            .expect("could not configure linger for the listener");
    }
    listen_socket.bind(addr).expect("can't bind");

    let backlog = if config.general.backlog > 0 {
        config.general.backlog
    } else {
        config.general.max_client_conn as u32
    };
    match listen_socket.listen(backlog) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Listener socket error: {err:?}");
            std::process::exit(exitcode::CONFIG);
        }
    }
}

pub fn run_server(args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("worker-pg-warden")
        .build()?;

    let inherit_fd = args.inherit_fd;

    runtime.block_on(async move {
        let listener = build_listener(&config, inherit_fd);
        LISTENER_FDS.lock().push(listener.as_raw_fd());

        info!(
            "Listening on {}:{}",
            config.general.host, config.general.port
        );
        config.show();

        if let Err(err) = pool::rebuild_pools() {
            error!("Pool setup error: {err:?}");
            std::process::exit(exitcode::CONFIG);
        }

        tokio::spawn(pool::janitor::run());

        let mut term_signal = unix_signal(SignalKind::terminate()).unwrap();
        let mut interrupt_signal = unix_signal(SignalKind::interrupt()).unwrap();
        let mut sighup_signal = unix_signal(SignalKind::hangup()).unwrap();

        // The listener is dropped when WAIT_FOR_CLIENTS starts; the
        // loop keeps running to drain.
        let mut listener = Some(listener);

        info!("Waiting for clients");
        loop {
            let accept_future = async {
                match listener.as_ref() {
                    Some(listener) => listener.accept().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // kill -SIGHUP: reload configuration.
                _ = sighup_signal.recv() => {
                    info!("Got SIGHUP, reloading config");
                    let _ = reload_config().await;
                    get_config().show();
                },

                // kill -SIGINT: graceful shutdown, wait for servers.
                _ = interrupt_signal.recv() => {
                    info!("Got SIGINT, starting graceful shutdown");
                    begin_shutdown(ShutdownMode::WaitForServers);
                },

                // kill -SIGTERM: immediate shutdown.
                _ = term_signal.recv() => {
                    info!("Got SIGTERM, shutting down now");
                    begin_shutdown(ShutdownMode::Immediate);
                },

                _ = SHUTDOWN_NOTIFY.notified() => {
                    // Mode changed via the console; fall through to the
                    // checks below.
                },

                // While shutting down, poll the drain conditions.
                _ = tokio::time::sleep(Duration::from_millis(500)),
                    if SHUTDOWN_MODE.load(Ordering::SeqCst) != ShutdownMode::None as u8 => {},

                new_client = accept_future => {
                    let (mut socket, addr) = match new_client {
                        Ok((socket, addr)) => (socket, addr),
                        Err(err) => {
                            error!("Accept error: {err:?}");
                            continue;
                        }
                    };

                    let shutdown = SHUTDOWN_MODE.load(Ordering::SeqCst);
                    if shutdown == ShutdownMode::Immediate as u8 {
                        let _ = socket.shutdown().await;
                        continue;
                    }
                    let admin_only = shutdown == ShutdownMode::WaitForServers as u8;

                    let config = get_config();
                    let log_client_disconnections = config.general.log_client_disconnections;
                    let max_client_conn = config.general.max_client_conn;

                    configure_tcp_socket(&socket);
                    tokio::spawn(async move {
                        TOTAL_CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
                        let current_clients =
                            CURRENT_CLIENT_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

                        if current_clients as u64 > max_client_conn {
                            warn!("Client {addr:?}: too many clients already");
                            if let Err(err) =
                                crate::client::client_entrypoint_too_many_clients_already(socket)
                                    .await
                            {
                                debug!("Client {addr:?} disconnected with error: {err}");
                            }
                            CURRENT_CLIENT_COUNT.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }

                        let start = chrono::offset::Utc::now().naive_utc();
                        match crate::client::client_entrypoint(socket, admin_only).await {
                            Ok(()) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;
                                if log_client_disconnections {
                                    info!(
                                        "Client {:?} disconnected, session duration: {}",
                                        addr,
                                        format_duration(&duration)
                                    );
                                }
                            }
                            Err(err) => {
                                let duration = chrono::offset::Utc::now().naive_utc() - start;
                                warn!(
                                    "Client {:?} disconnected with error {:?}, duration: {}",
                                    addr,
                                    err,
                                    format_duration(&duration)
                                );
                            }
                        };
                        CURRENT_CLIENT_COUNT.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }

            // Advance the shutdown sequence.
            match SHUTDOWN_MODE.load(Ordering::SeqCst) {
                mode if mode == ShutdownMode::Immediate as u8 => break,

                mode if mode == ShutdownMode::WaitForClients as u8 => {
                    if listener.is_some() {
                        // New connection attempts now fail at the TCP
                        // level; existing clients keep their service.
                        info!("Listener closed, draining connected clients");
                        listener = None;
                        LISTENER_FDS.lock().clear();
                    }
                    if CURRENT_CLIENT_COUNT.load(Ordering::SeqCst) == 0 {
                        info!("All clients disconnected, shutting down");
                        break;
                    }
                }

                mode if mode == ShutdownMode::WaitForServers as u8 => {
                    // The janitor closes idle servers and fails waiting
                    // clients while this mode is active.
                    let servers_left: usize = pool::get_all_pools()
                        .iter()
                        .map(|(_, pool)| pool.connected_server_count())
                        .sum();
                    if servers_left == 0 {
                        info!("All server connections closed, shutting down");
                        break;
                    }
                }

                _ => (),
            }
        }

        info!("Shutting down...");
    });

    Ok(())
}
