use log::{error, info};
use std::sync::atomic::Ordering;
use tokio::io::split;
use tokio::net::TcpStream;

use crate::errors::Error;
use crate::messages::{configure_tcp_socket_for_cancel, error_response_terminal};
use crate::stats::CANCEL_CONNECTION_COUNTER;

use super::core::Client;
use super::startup::{get_startup, ClientConnectionType};

/// The accept path once the process is over `max_client_conn`: cancel
/// requests are still honored (they free servers up), everyone else is
/// turned away.
pub async fn client_entrypoint_too_many_clients_already(mut stream: TcpStream) -> Result<(), Error> {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "failed to get peer address: {err:?}"
            )));
        }
    };

    match get_startup(&mut stream).await {
        Ok((ClientConnectionType::CancelQuery, bytes)) => {
            configure_tcp_socket_for_cancel(&stream);
            let (read, write) = split(stream);
            let mut client = Client::cancel(read, write, addr, bytes).await?;
            info!("Client {addr:?} issued a cancel query request");
            client.handle().await
        }
        Ok((ClientConnectionType::Startup, _)) => {
            error_response_terminal(&mut stream, "sorry, too many clients already", "53300").await
        }
        Err(err) => Err(err),
    }
}

/// Client entrypoint: sort the connection by its first packet and run
/// the matching lifecycle.
pub async fn client_entrypoint(mut stream: TcpStream, admin_only: bool) -> Result<(), Error> {
    let config = crate::config::get_config();
    let log_client_connections = config.general.log_client_connections;

    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "failed to get peer address: {err:?}"
            )));
        }
    };

    match get_startup(&mut stream).await {
        Ok((ClientConnectionType::Startup, bytes)) => {
            let (read, write) = split(stream);

            // Stalled logins are cut off; half-open startup exchanges
            // must not pin accept slots.
            let login = Client::startup(read, write, addr, bytes, admin_only);
            let mut client = match tokio::time::timeout(
                config.general.client_login_timeout.as_std(),
                login,
            )
            .await
            {
                Ok(client) => client?,
                Err(_) => {
                    return Err(Error::ClientError(format!(
                        "client {addr:?} exceeded client_login_timeout"
                    )))
                }
            };
            if log_client_connections {
                info!("Client {addr:?} connected");
            }

            let result = client.handle().await;
            if result.is_err() {
                client.disconnect_stats();
            }
            result
        }

        Ok((ClientConnectionType::CancelQuery, bytes)) => {
            CANCEL_CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
            // A reset on the cancel socket makes libpq clients print a
            // spurious warning; a short graceful linger avoids it.
            configure_tcp_socket_for_cancel(&stream);
            let (read, write) = split(stream);

            let mut client = Client::cancel(read, write, addr, bytes).await?;
            info!("Cancel request received from {addr:?}; forwarding to the backend");
            client.handle().await
        }

        Err(err) => {
            error!("Client {addr:?} startup failed: {err:?}");
            Err(err)
        }
    }
}
