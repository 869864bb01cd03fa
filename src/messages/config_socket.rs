//! TCP socket tuning applied to accepted and outbound connections.

use std::time::Duration;

use log::warn;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::get_config;

/// Configure keepalives, nodelay and linger on a client or server
/// socket. Dead peers must be detected in bounded time, otherwise a
/// vanished client can pin a server connection indefinitely.
pub fn configure_tcp_socket(stream: &TcpStream) {
    let config = get_config();
    let sock_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.general.tcp_keepalives_idle))
        .with_interval(Duration::from_secs(config.general.tcp_keepalives_interval))
        .with_retries(config.general.tcp_keepalives_count);
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive: {err:?}");
    }

    if let Err(err) = sock_ref.set_tcp_nodelay(config.general.tcp_no_delay) {
        warn!("Failed to set TCP nodelay: {err:?}");
    }

    if let Err(err) = sock_ref.set_linger(Some(Duration::from_secs(config.general.tcp_so_linger))) {
        warn!("Failed to set SO_LINGER: {err:?}");
    }
}

/// Cancel-request sockets get a graceful linger so libpq clients do not
/// see a reset while the CancelRequest is still in flight.
pub fn configure_tcp_socket_for_cancel(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(err) = sock_ref.set_linger(Some(Duration::from_secs(1))) {
        warn!("Failed to set SO_LINGER on cancel socket: {err:?}");
    }
}
