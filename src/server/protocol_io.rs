//! Protocol I/O toward the PostgreSQL server: sending buffered
//! requests and receiving framed responses with their state
//! side-effects applied.

use std::time::SystemTime;

use bytes::{Buf, BytesMut};
use log::{error, warn};
use tokio::time::timeout;

use crate::errors::Error;
use crate::messages::{
    proxy_copy_data, read_message_data, read_message_header, write_all_flush, BytesMutReader,
    PgErrorMsg, MAX_MESSAGE_SIZE,
};

use super::backend::Server;
use super::parameters::ServerParameters;

// CommandComplete payloads that flag session-altering statements.
const COMMAND_COMPLETE_SET: &[u8] = b"SET\0";
const COMMAND_COMPLETE_DECLARE_CURSOR: &[u8] = b"DECLARE CURSOR\0";
const COMMAND_COMPLETE_DEALLOCATE_ALL: &[u8] = b"DEALLOCATE ALL\0";
const COMMAND_COMPLETE_DISCARD_ALL: &[u8] = b"DISCARD ALL\0";
const COMMAND_COMPLETE_PREPARE: &[u8] = b"PREPARE\0";

/// One response read from the server.
#[derive(Debug)]
pub enum ResponseMessage {
    /// A complete wire message (code + length + payload).
    Message(BytesMut),
    /// An oversized DataRow / CopyData whose body was already streamed
    /// to the client; only the code is reported.
    Streamed(u8),
}

impl ResponseMessage {
    pub fn code(&self) -> u8 {
        match self {
            ResponseMessage::Message(bytes) => bytes[0],
            ResponseMessage::Streamed(code) => *code,
        }
    }
}

/// Send bytes to the server and flush. Marks the connection bad on
/// failure.
pub(crate) async fn send_and_flush(server: &mut Server, messages: &BytesMut) -> Result<(), Error> {
    server.stats.data_sent(messages.len());

    match write_all_flush(server.stream(), messages).await {
        Ok(_) => {
            server.ready = false;
            // The failure latch covers one request-response exchange.
            server.query_failed = false;
            server.last_activity = SystemTime::now();
            Ok(())
        }
        Err(err) => {
            error!("Terminating connection to server {server}: {err}");
            server.mark_bad("flush to server error");
            Err(err)
        }
    }
}

pub(crate) async fn send_and_flush_timeout(
    server: &mut Server,
    messages: &BytesMut,
    duration: std::time::Duration,
) -> Result<(), Error> {
    match timeout(duration, send_and_flush(server, messages)).await {
        Ok(result) => result,
        Err(_) => {
            server.mark_bad("flush timeout");
            error!("Flush timeout for server {server}");
            Err(Error::FlushTimeout)
        }
    }
}

/// Read one framed message from the server and apply its side-effects
/// to the server state. Oversized DataRow / CopyData messages are
/// streamed straight to `client_stream` instead of being buffered.
pub(crate) async fn recv_message<C>(
    server: &mut Server,
    client_stream: &mut C,
    mut client_parameters: Option<&mut ServerParameters>,
) -> Result<ResponseMessage, Error>
where
    C: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let (code, len) = match read_message_header(server.stream()).await {
        Ok(header) => header,
        Err(err) => {
            server.mark_bad(&format!("failed to read response header: {err}"));
            return Err(err);
        }
    };

    if len > MAX_MESSAGE_SIZE {
        server.mark_bad(&format!("response message of {len} bytes"));
        return Err(Error::MaxMessageSize);
    }

    // DataRow and CopyData can be arbitrarily large; relay their bodies
    // without buffering once they pass the configured threshold.
    let max_packet_size = server.max_packet_size();
    if max_packet_size > 0 && len > max_packet_size && (code == b'D' || code == b'd') {
        let mut header = BytesMut::with_capacity(5);
        use bytes::BufMut;
        header.put_u8(code);
        header.put_i32(len);
        write_all_flush(client_stream, &header).await?;

        let body_len = len as usize - 4;
        {
            // Split the borrow: proxy from the server stream into the client.
            let stream = server.stream();
            proxy_copy_data(stream, client_stream, body_len).await?;
        }

        server.stats.data_received(len as usize + 1);
        server.last_activity = SystemTime::now();
        return Ok(ResponseMessage::Streamed(code));
    }

    let message = match read_message_data(server.stream(), code, len).await {
        Ok(message) => message,
        Err(err) => {
            server.mark_bad(&format!("failed to read response body: {err}"));
            return Err(err);
        }
    };

    server.stats.data_received(message.len());
    server.last_activity = SystemTime::now();

    // Apply state side-effects.
    let mut payload = message.clone();
    let _ = payload.get_u8();
    let _ = payload.get_i32();

    match code as char {
        // ReadyForQuery: end of the response.
        'Z' => {
            let status = payload.get_u8() as char;
            match status {
                'I' => {
                    server.in_transaction = false;
                    server.is_aborted = false;
                }
                'T' => {
                    server.in_transaction = true;
                    server.is_aborted = false;
                }
                'E' => {
                    server.in_transaction = true;
                    server.is_aborted = true;
                }
                _ => {
                    let err = Error::ProtocolSyncError(format!(
                        "unknown transaction status '{status}' from server {server}"
                    ));
                    server.mark_bad("unknown transaction status");
                    return Err(err);
                }
            }
            // The failure latch survives into the ReadyForQuery
            // handling; the next request clears it.
            server.ready = true;
            server.in_copy_mode = false;
            server.clear_prepared_tx_refs();
        }

        // ErrorResponse: latch until ReadyForQuery.
        'E' => {
            server.query_failed = true;
            if server.in_copy_mode {
                server.in_copy_mode = false;
            }
            if let Ok(msg) = PgErrorMsg::parse(&payload) {
                if msg.severity == "FATAL" || msg.severity == "PANIC" {
                    server.mark_bad(&format!("server reported {}: {}", msg.severity, msg.message));
                }
            }
        }

        // CommandComplete: track session-altering statements.
        'C' => {
            if payload[..] == *COMMAND_COMPLETE_SET {
                server.cleanup_state.needs_cleanup_set = true;
            } else if payload[..] == *COMMAND_COMPLETE_DECLARE_CURSOR {
                server.cleanup_state.needs_cleanup_declare = true;
            } else if payload[..] == *COMMAND_COMPLETE_PREPARE {
                // Statement prepared via SQL, invisible to the cache.
                server.cleanup_state.needs_cleanup_prepare = true;
            } else if payload[..] == *COMMAND_COMPLETE_DEALLOCATE_ALL
                || payload[..] == *COMMAND_COMPLETE_DISCARD_ALL
            {
                warn!("Server {server} prepared statements dropped by client statement");
                server.clear_prepared_statements();
            }
        }

        // ParameterStatus: runtime parameter change.
        'S' => {
            let key = payload.read_string()?;
            let value = payload.read_string()?;
            if let Some(client_parameters) = client_parameters.as_mut() {
                client_parameters.set_param(key.clone(), value.clone(), false);
            }
            server.server_parameters.set_param(key, value, false);
        }

        // CopyInResponse / CopyOutResponse / CopyBothResponse.
        'G' | 'H' | 'W' => {
            server.in_copy_mode = true;
        }

        // CopyDone from the server; ReadyForQuery still follows.
        'c' => (),

        _ => (),
    }

    Ok(ResponseMessage::Message(message))
}
