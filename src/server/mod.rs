//! `crate::server` module (backend PostgreSQL connection and protocol
//! handling).

pub(crate) mod cancel;
pub(crate) mod cleanup;
pub(crate) mod parameters;
pub(crate) mod protocol_io;
pub(crate) mod stream;

mod backend;
mod prepared;

pub use backend::Server;
pub use parameters::ServerParameters;
pub use prepared::PreparedStatementCache;
pub use protocol_io::ResponseMessage;
pub use stream::StreamInner;

/// Issue a query cancellation request toward a backend, on a separate
/// connection that is not part of the connection pool.
pub async fn cancel_backend(
    host: &str,
    port: u16,
    process_id: i32,
    secret_key: i32,
) -> Result<(), crate::errors::Error> {
    cancel::cancel(host, port, process_id, secret_key).await
}
