/// Handle clients by pretending to be a PostgreSQL server.
use ahash::AHashMap;
use bytes::BytesMut;
use log::info;
use std::sync::Arc;
use tokio::io::BufReader;

use crate::errors::Error;
use crate::messages::{error_response, Parse};
use crate::pool::{
    get_pool, lookup_claim, ClientAdmission, ConnectionPool,
};
use crate::server::ServerParameters;
use crate::stats::ClientStats;

use super::requests::OutstandingRequests;

/// Prepared statement state for one client.
#[derive(Default)]
pub struct PreparedState {
    /// Whether statement rewriting is enabled for this client.
    pub enabled: bool,

    /// The client used Flush and runs the pipeline asynchronously;
    /// statement rewriting is off from then on.
    pub async_client: bool,

    /// Client-visible statement name -> (pooler-renamed definition,
    /// query id).
    pub statements: AHashMap<String, (Arc<Parse>, u64)>,
}

/// The client state. One of these is created per client connection.
pub struct Client<S, T> {
    /// The reads are buffered (8K by default).
    pub(crate) read: BufReader<S>,

    /// We buffer the writes ourselves because we know the protocol
    /// better than a stock buffer.
    pub(crate) write: T,

    /// Messages collected here until a Sync/Flush/Query forces a
    /// server exchange.
    pub(crate) buffer: BytesMut,

    pub(crate) addr: std::net::SocketAddr,

    /// The client connected for the sole purpose of canceling another
    /// client's query.
    pub(crate) cancel_mode: bool,

    /// For query cancellation, the client is issued a random process
    /// id and secret key on startup.
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,

    pub(crate) stats: Arc<ClientStats>,

    /// Talking to the admin console database.
    pub(crate) admin: bool,

    /// Name of the pool for this client (the database name from the
    /// startup message).
    pub(crate) pool_name: String,

    pub(crate) username: String,

    /// Session parameters the client expects; servers are aligned to
    /// these before forwarding.
    pub(crate) server_parameters: ServerParameters,

    pub(crate) prepared: PreparedState,

    /// Expected server replies with their dispositions.
    pub(crate) requests: OutstandingRequests,

    /// Complete wire bytes of the health-check query, for cheap
    /// comparison.
    pub(crate) pooler_check_query_bytes: Vec<u8>,

    pub(crate) max_packet_size: i32,

    /// Admission counters, held (not read) for this client's lifetime;
    /// dropping them releases the per-database and per-user slots.
    pub(crate) _admission: Option<ClientAdmission>,
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    #[inline]
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub(crate) fn disconnect_stats(&self) {
        self.stats.disconnect();
    }

    /// Retrieve the connection pool, reporting an error to the client
    /// when it does not exist.
    pub(crate) async fn get_pool(&mut self) -> Result<ConnectionPool, Error> {
        match get_pool(&self.pool_name, &self.username) {
            Some(pool) => Ok(pool),
            None => {
                error_response(
                    &mut self.write,
                    &format!(
                        "database \"{}\" does not exist for user \"{}\"",
                        self.pool_name, self.username
                    ),
                    "3D000",
                )
                .await?;

                Err(Error::ClientError(format!(
                    "no pool configured {{ username: {}, pool_name: {} }}",
                    self.username, self.pool_name
                )))
            }
        }
    }

    /// Forward a cancel request on behalf of this short-lived cancel
    /// connection, then tear it down. The cancel connection never
    /// joins the reusable pool.
    pub(crate) async fn handle_cancel_mode(&mut self) -> Result<(), Error> {
        // Unknown or stale keys are dropped silently: answering them
        // would leak whether a session exists.
        let target = match lookup_claim(self.process_id, self.secret_key) {
            Some(target) => target,
            None => return Ok(()),
        };

        let pool = match get_pool(&target.pool_id.db, &target.pool_id.user) {
            Some(pool) => pool,
            None => return Ok(()),
        };

        let key = (self.process_id, self.secret_key);
        if !pool.add_canceling_client(target.server_id, key) {
            // The server is already gone; nothing to cancel.
            return Ok(());
        }

        // The CancelRequest travels on its own short-lived connection,
        // tracked as a cancel carrier in the pool lists.
        let carrier = pool.insert_cancel_carrier().ok();

        info!(
            "Forwarding cancel request for backend [{}] at {}:{}",
            target.backend_pid, target.host, target.port
        );

        let result = tokio::time::timeout(
            pool.settings.cancel_wait_timeout.as_std(),
            crate::server::cancel_backend(
                &target.host,
                target.port,
                target.backend_pid,
                target.backend_key,
            ),
        )
        .await;

        if let Some((carrier_id, _stats)) = carrier {
            pool.remove_cancel_carrier(carrier_id);
        }
        pool.cancel_resolved(target.server_id, key);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::SocketError(
                "cancel request timed out (cancel_wait_timeout)".into(),
            )),
        }
    }
}

impl<S, T> Drop for Client<S, T> {
    fn drop(&mut self) {
        crate::pool::release_claim(self.process_id, self.secret_key);
        // Covers abrupt disconnects (e.g. TCP resets) that skip the
        // normal teardown path.
        self.stats.disconnect();
    }
}
