// Helper functions to build and send one-off protocol messages.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;

use crate::errors::Error;
use crate::messages::constants::CANCEL_REQUEST_CODE;
use crate::messages::socket::{write_all, write_all_flush};
use crate::messages::types::DataType;

/// Generate md5 password challenge.
pub async fn md5_challenge<S>(stream: &mut S) -> Result<[u8; 4], Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let salt: [u8; 4] = rand::random();

    let mut res = BytesMut::with_capacity(13);
    res.put_u8(b'R');
    res.put_i32(12);
    res.put_i32(5); // MD5
    res.put_slice(&salt[..]);

    match stream.write_all(&res).await {
        Ok(_) => Ok(salt),
        Err(err) => Err(Error::SocketError(format!(
            "failed to write md5 challenge: {err}"
        ))),
    }
}

/// Generate plain password challenge.
pub async fn plain_password_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::with_capacity(9);
    res.put_u8(b'R');
    res.put_i32(8);
    res.put_i32(3); // cleartext password

    match stream.write_all(&res).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "failed to write password challenge: {err}"
        ))),
    }
}

/// Read a PasswordMessage ('p') from the client.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    use tokio::io::AsyncReadExt;

    let code = stream
        .read_u8()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read password code: {err}")))?;
    if code != b'p' {
        return Err(Error::ProtocolSyncError(format!(
            "expected password message (p), received '{}'",
            code as char
        )));
    }

    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read password length: {err}")))?;
    if !(4..=8192).contains(&len) {
        return Err(Error::ProtocolSyncError(format!(
            "bad password message length {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    stream
        .read_exact(&mut password)
        .await
        .map_err(|err| Error::SocketError(format!("failed to read password: {err}")))?;

    Ok(password)
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(query.len() + 6);
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Send a StartupMessage to the server.
pub async fn startup<S>(
    stream: &mut S,
    user: &str,
    database: &str,
    application_name: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::new();

    bytes.put_i32(196608); // protocol 3.0

    bytes.put(&b"user\0"[..]);
    bytes.put_slice(user.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"database\0"[..]);
    bytes.put_slice(database.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"application_name\0"[..]);
    bytes.put_slice(application_name.as_bytes());
    bytes.put_u8(0);
    bytes.put_u8(0); // terminator

    let len = bytes.len() as i32 + 4;
    let mut startup = BytesMut::with_capacity(len as usize);
    startup.put_i32(len);
    startup.put(bytes);

    write_all_flush(stream, &startup).await
}

/// Build a CancelRequest message for the given backend key.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Parse the params the client sends as a key/value format.
pub fn parse_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();

        // Nul-terminated C strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                break;
            }
            c = bytes.get_u8();
        }

        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    // Expect pairs of name and value, at least one pair.
    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ProtocolSyncError(format!(
            "expected key-value startup parameters, received {} strings",
            buf.len()
        )));
    }

    let mut i = 0;
    while i < buf.len() {
        result.insert(buf[i].clone(), buf[i + 1].clone());
        i += 2;
    }

    Ok(result)
}

/// Parse StartupMessage parameters, e.g. user, database, application_name.
pub fn parse_startup(bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let result = parse_params(bytes)?;

    // The protocol requires the user at the very minimum.
    if !result.contains_key("user") {
        return Err(Error::ClientBadStartup);
    }

    Ok(result)
}

/// Create md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass: md5(password + username)
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let output = md5.finalize_reset();

    md5_hash_second_pass(&format!("{output:x}"), salt)
}

/// Second pass: md5(first_pass_hex + salt), prefixed with "md5".
pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);
    password
}

/// Send the md5 challenge response to the server.
pub async fn md5_password<S>(
    stream: &mut S,
    user: &str,
    password: &str,
    salt: &[u8],
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let password = md5_hash_password(user, password, salt);

    let mut message = BytesMut::with_capacity(password.len() + 5);
    message.put_u8(b'p');
    message.put_i32(password.len() as i32 + 4);
    message.put_slice(&password[..]);

    write_all(stream, message).await
}

/// Like [`md5_password`] but the stored secret is already an md5 hash.
pub async fn md5_password_with_hash<S>(stream: &mut S, hash: &str, salt: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let password = md5_hash_second_pass(hash, salt);

    let mut message = BytesMut::with_capacity(password.len() + 5);
    message.put_u8(b'p');
    message.put_i32(password.len() as i32 + 4);
    message.put_slice(&password[..]);

    write_all(stream, message).await
}

/// Build an ErrorResponse with the given message and SQLSTATE code.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();

    // Severity
    error.put_u8(b'S');
    error.put_slice(&b"FATAL\0"[..]);
    // Severity (non-localized)
    error.put_u8(b'V');
    error.put_slice(&b"FATAL\0"[..]);

    // SQLSTATE
    error.put_u8(b'C');
    error.put_slice(code.as_bytes());
    error.put_u8(0);

    // Human-readable message
    error.put_u8(b'M');
    error.put_slice(message.as_bytes());
    error.put_u8(0);

    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Send an ErrorResponse followed by ReadyForQuery, so the client can
/// recover and try again.
pub async fn error_response<S>(stream: &mut S, message: &str, code: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut buf = error_message(message, code);
    buf.put(ready_for_query(false));
    write_all_flush(stream, &buf).await
}

/// Send a terminal ErrorResponse: no ReadyForQuery follows, the
/// connection is about to be closed.
pub async fn error_response_terminal<S>(
    stream: &mut S,
    message: &str,
    code: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(message, code);
    write_all_flush(stream, &res).await
}

/// Standard authentication failure response.
pub async fn wrong_password<S>(stream: &mut S, user: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    error_response_terminal(
        stream,
        &format!("password authentication failed for user \"{user}\""),
        "28P01",
    )
    .await
}

/// Create a row description message.
pub fn row_description(columns: &[(&str, DataType)]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    row_desc.put_i16(columns.len() as i16);

    for (name, data_type) in columns {
        // Column name
        row_desc.put_slice(name.as_bytes());
        row_desc.put_u8(0);

        // Doesn't belong to any table
        row_desc.put_i32(0);
        row_desc.put_i16(0);

        // Type oid
        row_desc.put_i32(data_type.into());

        let type_size = match data_type {
            DataType::Text => -1,
            DataType::Int4 => 4,
            DataType::Numeric => -1,
            DataType::Bool => 1,
            DataType::Oid => 4,
        };
        row_desc.put_i16(type_size);

        // Type modifier
        row_desc.put_i32(-1);

        // Text format
        row_desc.put_i16(0);
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);
    res
}

/// Create a data row message.
pub fn data_row(row: &[String]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);

    for value in row {
        data_row.put_i32(value.len() as i32);
        data_row.put_slice(value.as_bytes());
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);
    res
}

/// Create a data row message with nullable values.
pub fn data_row_nullable(row: &[Option<String>]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);

    for value in row {
        match value {
            Some(value) => {
                data_row.put_i32(value.len() as i32);
                data_row.put_slice(value.as_bytes());
            }
            None => {
                data_row.put_i32(-1);
            }
        }
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);
    res
}

/// Create a command complete message.
pub fn command_complete(command: &str) -> BytesMut {
    let mut res = BytesMut::with_capacity(command.len() + 6);
    res.put_u8(b'C');
    res.put_i32(command.len() as i32 + 4 + 1);
    res.put_slice(command.as_bytes());
    res.put_u8(0);
    res
}

/// Create a ready for query message.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(if in_transaction { b'T' } else { b'I' });
    bytes
}

/// Create a parse complete message.
pub fn parse_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'1');
    bytes.put_i32(4);
    bytes
}

/// Create a close complete message.
pub fn close_complete() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'3');
    bytes.put_i32(4);
    bytes
}

/// Create a sync message.
pub fn sync() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'S');
    bytes.put_i32(4);
    bytes
}

/// AuthenticationOk.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// BackendKeyData carrying the pooler-issued cancel key.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Create a server parameter (ParameterStatus) message.
pub fn server_parameter_message(key: &str, value: &str) -> BytesMut {
    let mut server_info = BytesMut::new();
    server_info.put_u8(b'S');
    server_info.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    server_info.put_slice(key.as_bytes());
    server_info.put_u8(0);
    server_info.put_slice(value.as_bytes());
    server_info.put_u8(0);
    server_info
}

/// Local reply to the pooler health-check query: EmptyQueryResponse +
/// ReadyForQuery.
pub fn check_query_response() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(11);
    bytes.put_u8(b'I');
    bytes.put_i32(4);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(b'I');
    bytes
}

/// Local reply to DEALLOCATE handled without a server.
pub fn deallocate_response() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put(command_complete("DEALLOCATE"));
    bytes.put(ready_for_query(false));
    bytes
}
