//! Low-level socket helpers: message framing and buffered writes.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;

/// Reads are chunked so a huge CopyData message never has to be
/// buffered whole.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Read a message header: the one-byte type code and the i32 length
/// (which includes itself but not the code byte).
pub async fn read_message_header<S>(stream: &mut S) -> Result<(u8, i32), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = stream
        .read_u8()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read message code: {err}")))?;
    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read message length: {err}")))?;
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "message length {len} is smaller than the length field itself"
        )));
    }
    Ok((code, len))
}

/// Read the message body for an already-read header and return the
/// complete wire message (code + length + payload).
pub async fn read_message_data<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut message = BytesMut::with_capacity(len as usize + 1);
    message.put_u8(code);
    message.put_i32(len);

    let mut payload = vec![0u8; len as usize - 4];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| Error::SocketError(format!("failed to read message payload: {err}")))?;
    message.put_slice(&payload);

    Ok(message)
}

/// Read one complete wire message. `max_packet_size` of zero disables
/// the size check.
pub async fn read_message<S>(stream: &mut S, max_packet_size: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, len) = read_message_header(stream).await?;
    if max_packet_size > 0 && len > max_packet_size {
        return Err(Error::MaxMessageSize);
    }
    read_message_data(stream, code, len).await
}

/// Write all bytes without flushing.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    stream
        .write_all(&buf)
        .await
        .map_err(|err| Error::SocketError(format!("failed to write to socket: {err}")))
}

/// Write all bytes and flush the stream.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    stream
        .write_all(buf)
        .await
        .map_err(|err| Error::SocketError(format!("failed to write to socket: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("failed to flush socket: {err}")))
}

/// Relay exactly `n` payload bytes from one stream to another in
/// bounded chunks, flushing as we go. Used for CopyData and oversized
/// DataRow messages whose bodies are never buffered whole.
pub async fn proxy_copy_data<F, T>(from: &mut F, to: &mut T, mut n: usize) -> Result<(), Error>
where
    F: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut chunk = vec![0u8; COPY_CHUNK_SIZE.min(n.max(1))];
    while n > 0 {
        let want = COPY_CHUNK_SIZE.min(n);
        let got = from
            .read(&mut chunk[..want])
            .await
            .map_err(|err| Error::SocketError(format!("failed to read copy data: {err}")))?;
        if got == 0 {
            return Err(Error::SocketError(
                "connection closed mid copy stream".into(),
            ));
        }
        to.write_all(&chunk[..got])
            .await
            .map_err(|err| Error::SocketError(format!("failed to relay copy data: {err}")))?;
        n -= got;
    }
    to.flush()
        .await
        .map_err(|err| Error::SocketError(format!("failed to flush copy data: {err}")))
}

/// Like [`proxy_copy_data`] but bounded by a wall-clock deadline, so a
/// stalled peer cannot pin the relay forever.
pub async fn proxy_copy_data_with_timeout<F, T>(
    duration: std::time::Duration,
    from: &mut F,
    to: &mut T,
    n: usize,
) -> Result<(), Error>
where
    F: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match tokio::time::timeout(duration, proxy_copy_data(from, to, n)).await {
        Ok(result) => result,
        Err(_) => Err(Error::FlushTimeout),
    }
}
