//! Upstream connection establishment over TCP or unix sockets.

use std::time::Duration;

use log::warn;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpStream, UnixStream};

use crate::config::get_config;
use crate::errors::Error;

/// A connected upstream stream, TCP or unix.
#[derive(Debug)]
pub enum StreamInner {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl tokio::io::AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamInner::Tcp(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            StreamInner::Unix(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StreamInner::Tcp(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            StreamInner::Unix(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamInner::Tcp(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            StreamInner::Unix(stream) => std::pin::Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamInner::Tcp(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            StreamInner::Unix(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl StreamInner {
    pub fn try_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::Tcp(stream) => stream.try_write(buf),
            StreamInner::Unix(stream) => stream.try_write(buf),
        }
    }
}

/// Connect to a host:port over TCP with keepalives configured.
pub async fn create_tcp_stream(host: &str, port: u16) -> Result<StreamInner, Error> {
    let stream = match TcpStream::connect(&format!("{host}:{port}")).await {
        Ok(stream) => stream,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "could not connect to server {host}:{port}: {err}"
            )));
        }
    };

    let config = get_config();
    let sock_ref = SockRef::from(&stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.general.tcp_keepalives_idle))
        .with_interval(Duration::from_secs(config.general.tcp_keepalives_interval))
        .with_retries(config.general.tcp_keepalives_count);
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set keepalive on server socket: {err:?}");
    }
    if let Err(err) = sock_ref.set_tcp_nodelay(true) {
        warn!("Failed to set nodelay on server socket: {err:?}");
    }

    Ok(StreamInner::Tcp(stream))
}

/// Connect to a PostgreSQL unix socket: `<dir>/.s.PGSQL.<port>`.
pub async fn create_unix_stream(dir: &str, port: u16) -> Result<StreamInner, Error> {
    let path = format!("{dir}/.s.PGSQL.{port}");
    match UnixStream::connect(&path).await {
        Ok(stream) => Ok(StreamInner::Unix(stream)),
        Err(err) => Err(Error::SocketError(format!(
            "could not connect to server socket {path}: {err}"
        ))),
    }
}

/// Dispatch on the host form: a leading '/' selects a unix socket
/// directory.
pub async fn connect(host: &str, port: u16) -> Result<StreamInner, Error> {
    if host.starts_with('/') {
        create_unix_stream(host, port).await
    } else {
        create_tcp_stream(host, port).await
    }
}
