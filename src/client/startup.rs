use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};

use crate::auth::{authenticate_admin, authenticate_client};
use crate::config::get_config;
use crate::errors::{ClientIdentifier, Error};
use crate::messages::constants::*;
use crate::messages::{
    auth_ok, backend_key_data, error_response_terminal, parse_startup, ready_for_query,
    write_all, write_all_flush,
};
use crate::pool::admit_client;
use crate::server::ServerParameters;
use crate::stats::ClientStats;

use super::core::{Client, PreparedState};
use super::requests::OutstandingRequests;

/// Names under which the admin console is reachable. `pgbouncer` is
/// accepted for tooling compatibility.
const ADMIN_DATABASES: [&str; 2] = ["pgwarden", "pgbouncer"];

/// Type of connection received from the client.
pub(crate) enum ClientConnectionType {
    Startup,
    CancelQuery,
}

/// Handle the first packet the client sends, negotiating away the
/// encryption requests we do not serve.
pub(crate) async fn get_startup<S>(
    stream: &mut S,
) -> Result<(ClientConnectionType, BytesMut), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };

        // Minimum is 8 bytes (length + code); cap the startup packet to
        // keep a garbage length from allocating gigabytes.
        if !(8..=8 * 1024).contains(&len) {
            return Err(Error::ClientBadStartup);
        }

        let mut startup = vec![0u8; (len - 4) as usize];
        if stream.read_exact(&mut startup).await.is_err() {
            return Err(Error::ClientBadStartup);
        }

        let mut bytes = BytesMut::from(&startup[..]);
        let code = bytes.get_i32();

        match code {
            PROTOCOL_VERSION_NUMBER => return Ok((ClientConnectionType::Startup, bytes)),

            CANCEL_REQUEST_CODE => return Ok((ClientConnectionType::CancelQuery, bytes)),

            // TLS is not offered; the client may retry in plain text.
            SSL_REQUEST_CODE => {
                let mut no = BytesMut::with_capacity(1);
                no.put_u8(b'N');
                write_all(stream, no).await?;
            }

            // Same for GSSAPI encryption.
            GSSENC_REQUEST_CODE => {
                let mut no = BytesMut::with_capacity(1);
                no.put_u8(b'N');
                write_all(stream, no).await?;
            }

            PROTOCOL_VERSION_NUMBER_V2 => {
                return Err(Error::ProtocolSyncError(
                    "protocol version 2 is not supported".into(),
                ))
            }

            _ => {
                return Err(Error::ProtocolSyncError(format!(
                    "unexpected startup code: {code}"
                )))
            }
        }
    }
}

/// Low two bits of an issued cancel key encode a forwarding TTL, so
/// layered poolers can bound how often a key is relayed.
fn issue_cancel_key() -> (i32, i32) {
    let mut rng = rand::rng();
    let process_id: i32 = rng.random();
    let secret_key: i32 = (rng.random::<i32>() & !(CANCEL_KEY_TTL_MASK as i32)) | 0x03;
    (process_id, secret_key)
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Handle the Postgres client startup sequence: authentication,
    /// admission, and the welcome message.
    pub async fn startup(
        mut read: S,
        mut write: T,
        addr: std::net::SocketAddr,
        bytes: BytesMut, // The rest of the startup message.
        admin_only: bool,
    ) -> Result<Client<S, T>, Error> {
        let config = get_config();
        let parameters = parse_startup(bytes)?;

        // Mandatory by the protocol.
        let username = match parameters.get("user") {
            Some(user) => user.clone(),
            None => {
                return Err(Error::ClientError(
                    "missing 'user' parameter on client startup".into(),
                ))
            }
        };

        let pool_name = parameters
            .get("database")
            .unwrap_or(&username)
            .to_string();

        let application_name = parameters
            .get("application_name")
            .map(|s| s.as_str())
            .unwrap_or("pg_warden");

        let client_identifier =
            ClientIdentifier::new(application_name, &username, &pool_name, &addr.to_string());

        let admin = ADMIN_DATABASES.contains(&pool_name.as_str());

        // Only the console stays reachable once shutdown started.
        if !admin && admin_only {
            error_response_terminal(&mut write, "pooler is shutting down", "58006").await?;
            return Err(Error::ShuttingDown);
        }

        let mut admission = None;

        if admin {
            authenticate_admin(&mut read, &mut write, &client_identifier).await?;
        } else {
            // The pool must exist before we challenge for a password.
            let database = match config.databases.get(&pool_name) {
                Some(database) => database,
                None => {
                    error_response_terminal(
                        &mut write,
                        &format!("database \"{pool_name}\" does not exist"),
                        "3D000",
                    )
                    .await?;
                    return Err(Error::ClientError(format!(
                        "unknown database {pool_name:?} for {client_identifier}"
                    )));
                }
            };

            let user = match database.users.iter().find(|u| u.username == username) {
                Some(user) => user.clone(),
                None => {
                    error_response_terminal(
                        &mut write,
                        &format!("password authentication failed for user \"{username}\""),
                        "28P01",
                    )
                    .await?;
                    return Err(Error::AuthError(format!(
                        "unknown user {client_identifier}"
                    )));
                }
            };

            // Database- and user-level client caps, checked at accept.
            admission = match admit_client(&pool_name, &username) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    error_response_terminal(
                        &mut write,
                        "sorry, too many clients already",
                        "53300",
                    )
                    .await?;
                    return Err(err);
                }
            };

            authenticate_client(&mut read, &mut write, &client_identifier, &user.password)
                .await?;
        }

        let (process_id, secret_key) = issue_cancel_key();

        // Welcome message: AuthenticationOk, server parameters, the
        // cancel key, ReadyForQuery.
        let mut server_parameters = if admin {
            ServerParameters::admin()
        } else {
            match crate::pool::get_pool(&pool_name, &username) {
                Some(pool) => match pool.welcome_parameters().await {
                    Ok(params) => params,
                    Err(err) => {
                        error_response_terminal(
                            &mut write,
                            &format!("could not connect to server: {err}"),
                            "08001",
                        )
                        .await?;
                        return Err(err);
                    }
                },
                None => ServerParameters::admin(),
            }
        };
        server_parameters.set_from_hashmap(&parameters, false);

        let mut welcome = BytesMut::new();
        welcome.put(auth_ok());
        let params_buf: BytesMut = (&server_parameters).into();
        welcome.put(params_buf);
        welcome.put(backend_key_data(process_id, secret_key));
        welcome.put(ready_for_query(false));
        write_all_flush(&mut write, &welcome).await?;

        let stats = Arc::new(ClientStats::new(
            process_id,
            application_name,
            &username,
            &pool_name,
            &addr.to_string(),
        ));

        let max_packet_size = if config.general.max_packet_size == 0 {
            crate::messages::MAX_MESSAGE_SIZE
        } else {
            config.general.max_packet_size as i32
        };

        Ok(Client {
            read: BufReader::new(read),
            write,
            buffer: BytesMut::new(),
            addr,
            cancel_mode: false,
            process_id,
            secret_key,
            stats,
            admin,
            pool_name,
            username,
            server_parameters,
            prepared: PreparedState {
                enabled: !admin && config.general.max_prepared_statements > 0,
                ..Default::default()
            },
            requests: OutstandingRequests::new(),
            pooler_check_query_bytes: config.general.pooler_check_query_request_bytes(),
            max_packet_size,
            _admission: admission,
        })
    }

    /// Construct the short-lived client that carries a cancel request.
    pub async fn cancel(
        read: S,
        write: T,
        addr: std::net::SocketAddr,
        mut bytes: BytesMut, // The rest of the cancel message.
    ) -> Result<Client<S, T>, Error> {
        let process_id = bytes.get_i32();
        let secret_key = bytes.get_i32();

        Ok(Client {
            read: BufReader::new(read),
            write,
            buffer: BytesMut::new(),
            addr,
            cancel_mode: true,
            process_id,
            secret_key,
            stats: Arc::new(ClientStats::default()),
            admin: false,
            pool_name: String::from("undefined"),
            username: String::from("undefined"),
            server_parameters: ServerParameters::new(),
            prepared: PreparedState::default(),
            requests: OutstandingRequests::new(),
            pooler_check_query_bytes: Vec::new(),
            max_packet_size: crate::messages::MAX_MESSAGE_SIZE,
            _admission: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_keys_carry_the_forwarding_ttl() {
        for _ in 0..32 {
            let (_, secret_key) = issue_cancel_key();
            assert_eq!(secret_key & CANCEL_KEY_TTL_MASK as i32, 0x03);
        }
    }
}
