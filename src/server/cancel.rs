//! Query cancellation toward the server. A CancelRequest travels on a
//! fresh, short-lived connection that never joins the reusable pool.

use log::warn;

use crate::errors::Error;
use crate::messages::{cancel_request, write_all_flush};

use super::stream::connect;

/// Open a connection, send the CancelRequest, and drop the connection.
/// The server never answers it.
pub(crate) async fn cancel(
    host: &str,
    port: u16,
    process_id: i32,
    secret_key: i32,
) -> Result<(), Error> {
    let mut stream = connect(host, port).await?;

    warn!("Sending CancelRequest to [{process_id}] {host}:{port}");

    let bytes = cancel_request(process_id, secret_key);
    write_all_flush(&mut stream, &bytes).await
}
