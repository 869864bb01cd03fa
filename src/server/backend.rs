// Implementation of the PostgreSQL client protocol toward the real
// server: connect, authenticate, and maintain per-connection state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, BufMut, BytesMut};
use log::{error, info, warn};
use lru::LruCache;
use tokio::io::{AsyncReadExt, BufStream};

use crate::auth::scram::ScramSha256;
use crate::config::{get_config, Address, User};
use crate::errors::{Error, ServerIdentifier};
use crate::messages::constants::*;
use crate::messages::{
    md5_hash_password, md5_hash_second_pass, read_message_data, simple_query, startup,
    write_all_flush, PgErrorMsg,
};
use crate::pool::{claim_server, release_claim, PoolIdentifier};
use crate::stats::ServerStats;

use super::cleanup::CleanupState;
use super::parameters::ServerParameters;
use super::protocol_io;
use super::stream::{connect, StreamInner};

/// Per-statement bookkeeping on the server-side prepared statement
/// cache. A statement referenced inside the current transaction must
/// not be evicted until the transaction ends.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StatementGuard {
    pub(crate) tx_refs: u32,
    /// Set once the server acknowledged the Parse with ParseComplete.
    pub(crate) acked: bool,
}

/// One connection to the PostgreSQL server.
pub struct Server {
    /// Pool-assigned identity, also the stats registry key.
    server_id: u64,

    pub(crate) address: Address,

    stream: BufStream<StreamInner>,

    /// Parameters the server reported, kept aligned with the linked
    /// client's expectations.
    pub(crate) server_parameters: ServerParameters,

    /// Snapshot of the parameters right after connect; the pool
    /// defaults a reset reverts to.
    startup_parameters: ServerParameters,

    /// Backend pid and secret used for query cancellation.
    process_id: i32,
    secret_key: i32,

    /// Accepts a new query (saw ReadyForQuery and nothing was sent
    /// since).
    pub(crate) ready: bool,

    pub(crate) in_transaction: bool,
    pub(crate) is_aborted: bool,

    /// In a COPY stream; Sync handling is suspended until
    /// CopyDone/CopyFail.
    pub(crate) in_copy_mode: bool,

    /// An ErrorResponse arrived; stays latched until ReadyForQuery.
    pub(crate) query_failed: bool,

    /// Must be discarded instead of pooled.
    bad: bool,

    pub(crate) cleanup_state: CleanupState,

    connected_at: chrono::naive::NaiveDateTime,

    pub stats: Arc<ServerStats>,

    application_name: String,

    pub last_activity: SystemTime,

    /// Statements currently prepared on this server, by pooler name.
    /// Unbounded container; the cap is enforced by the eviction logic
    /// so protected statements can ride out a full cache.
    prepared_statements: Option<LruCache<String, StatementGuard>>,
    prepared_max: usize,

    max_packet_size: i32,
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}]-{}@{}:{}/{}",
            self.process_id,
            self.address.username,
            self.address.host,
            self.address.port,
            self.address.database,
        )
    }
}

impl Server {
    /// Pretend to be a Postgres client: connect, authenticate, absorb
    /// the startup parameters, and return a ready server connection.
    pub async fn startup(
        server_id: u64,
        address: &Address,
        user: &User,
        stats: Arc<ServerStats>,
        application_name: &str,
    ) -> Result<Server, Error> {
        let config = get_config();

        let mut stream = connect(&address.host, address.port).await?;

        let username = user.server_username.as_ref().unwrap_or(&user.username);
        let password = user.server_password.as_ref().unwrap_or(&user.password);
        let server_identifier = ServerIdentifier::new(username, &address.database);

        startup(&mut stream, username, &address.database, application_name).await?;

        let mut process_id: i32 = 0;
        let mut secret_key: i32 = 0;
        let mut scram: Option<ScramSha256> = None;
        let mut server_parameters = ServerParameters::new();

        loop {
            let code = stream.read_u8().await.map_err(|err| {
                Error::ServerStartupError(
                    format!("message code ({err})"),
                    server_identifier.clone(),
                )
            })? as char;

            let len = stream.read_i32().await.map_err(|err| {
                Error::ServerStartupError(
                    format!("message length ({err})"),
                    server_identifier.clone(),
                )
            })?;

            match code {
                // Authentication request
                'R' => {
                    let auth_code = stream.read_i32().await.map_err(|_| {
                        Error::ServerStartupError(
                            "authentication code".into(),
                            server_identifier.clone(),
                        )
                    })?;
                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),

                        MD5_ENCRYPTED_PASSWORD => {
                            let mut salt = [0u8; 4];
                            stream.read_exact(&mut salt).await.map_err(|_| {
                                Error::ServerStartupError(
                                    "md5 salt".into(),
                                    server_identifier.clone(),
                                )
                            })?;

                            let hashed = if let Some(hash) = password.strip_prefix("md5") {
                                md5_hash_second_pass(hash, &salt)
                            } else {
                                md5_hash_password(username, password, &salt)
                            };

                            let mut response = BytesMut::with_capacity(hashed.len() + 5);
                            response.put_u8(b'p');
                            response.put_i32(hashed.len() as i32 + 4);
                            response.put_slice(&hashed);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        SASL => {
                            if password.starts_with("md5") {
                                return Err(Error::ServerAuthError(
                                    "server wants SCRAM but only an md5 hash is configured; \
                                     set server_password to the cleartext password"
                                        .into(),
                                    server_identifier.clone(),
                                ));
                            }

                            let sasl_len = (len - 8) as usize;
                            let mut sasl_auth = vec![0u8; sasl_len];
                            stream.read_exact(&mut sasl_auth).await.map_err(|_| {
                                Error::ServerStartupError(
                                    "SASL mechanism list".into(),
                                    server_identifier.clone(),
                                )
                            })?;
                            let mechanisms = String::from_utf8_lossy(&sasl_auth);

                            if !mechanisms.contains(SCRAM_SHA_256) {
                                return Err(Error::ServerAuthError(
                                    format!("unsupported SASL mechanisms: {mechanisms}"),
                                    server_identifier.clone(),
                                ));
                            }

                            let mut client = ScramSha256::new(password);
                            let first = client.message();

                            // SASLInitialResponse
                            let mut res = BytesMut::new();
                            res.put_u8(b'p');
                            res.put_i32(
                                4 + SCRAM_SHA_256.len() as i32 + 1 + 4 + first.len() as i32,
                            );
                            res.put_slice(SCRAM_SHA_256.as_bytes());
                            res.put_u8(0);
                            res.put_i32(first.len() as i32);
                            res.put(first);
                            write_all_flush(&mut stream, &res).await?;

                            scram = Some(client);
                        }

                        SASL_CONTINUE => {
                            let client = scram.as_mut().ok_or_else(|| {
                                Error::ServerAuthError(
                                    "SASL continuation without an exchange in progress".into(),
                                    server_identifier.clone(),
                                )
                            })?;

                            let mut sasl_data = vec![0u8; (len - 8) as usize];
                            stream.read_exact(&mut sasl_data).await.map_err(|_| {
                                Error::ServerStartupError(
                                    "SASL continuation".into(),
                                    server_identifier.clone(),
                                )
                            })?;

                            let response = client.update(&BytesMut::from(&sasl_data[..]))?;

                            let mut res = BytesMut::new();
                            res.put_u8(b'p');
                            res.put_i32(4 + response.len() as i32);
                            res.put(response);
                            write_all_flush(&mut stream, &res).await?;
                        }

                        SASL_FINAL => {
                            let client = scram.as_mut().ok_or_else(|| {
                                Error::ServerAuthError(
                                    "SASL final without an exchange in progress".into(),
                                    server_identifier.clone(),
                                )
                            })?;

                            let mut sasl_final = vec![0u8; (len - 8) as usize];
                            stream.read_exact(&mut sasl_final).await.map_err(|_| {
                                Error::ServerStartupError(
                                    "SASL final".into(),
                                    server_identifier.clone(),
                                )
                            })?;

                            client.finish(&BytesMut::from(&sasl_final[..]))?;
                        }

                        AUTHENTICATION_CLEAR_PASSWORD => {
                            if password.starts_with("md5") {
                                return Err(Error::ServerAuthError(
                                    "server wants a cleartext password but only an md5 hash \
                                     is configured"
                                        .into(),
                                    server_identifier.clone(),
                                ));
                            }
                            let mut response = BytesMut::with_capacity(password.len() + 6);
                            response.put_u8(b'p');
                            response.put_i32(4 + password.len() as i32 + 1);
                            response.put_slice(password.as_bytes());
                            response.put_u8(0);
                            write_all_flush(&mut stream, &response).await?;
                        }

                        _ => {
                            return Err(Error::ServerAuthError(
                                format!("unsupported authentication request {auth_code}"),
                                server_identifier.clone(),
                            ));
                        }
                    }
                }

                // ErrorResponse
                'E' => {
                    let error_len = len as usize - 4;
                    let mut payload = vec![0u8; error_len];
                    stream.read_exact(&mut payload).await.map_err(|err| {
                        Error::ServerStartupError(
                            format!("error response ({err})"),
                            server_identifier.clone(),
                        )
                    })?;

                    return match PgErrorMsg::parse(&payload) {
                        Ok(msg) => {
                            error!(
                                "Server startup error {} {}: {}",
                                msg.severity, msg.code, msg.message
                            );
                            Err(Error::ServerStartupError(msg.message, server_identifier))
                        }
                        Err(_) => Err(Error::ServerStartupError(
                            "unparseable error response".into(),
                            server_identifier,
                        )),
                    };
                }

                // NoticeResponse
                'N' => {
                    let mut payload = vec![0u8; len as usize - 4];
                    stream.read_exact(&mut payload).await.map_err(|err| {
                        Error::ServerStartupError(
                            format!("notice ({err})"),
                            server_identifier.clone(),
                        )
                    })?;
                    if let Ok(msg) = PgErrorMsg::parse(&payload) {
                        info!(
                            "Server startup notice (severity: {} message: {})",
                            msg.severity, msg.message
                        );
                    }
                }

                // ParameterStatus
                'S' => {
                    let mut message = read_message_data(&mut stream, code as u8, len).await?;
                    let _ = message.get_u8();
                    let _ = message.get_i32();
                    let key = crate::messages::BytesMutReader::read_string(&mut message)?;
                    let value = crate::messages::BytesMutReader::read_string(&mut message)?;
                    server_parameters.set_param(key, value, true);
                }

                // BackendKeyData
                'K' => {
                    process_id = stream.read_i32().await.map_err(|_| {
                        Error::ServerStartupError("process id".into(), server_identifier.clone())
                    })?;
                    secret_key = stream.read_i32().await.map_err(|_| {
                        Error::ServerStartupError("secret key".into(), server_identifier.clone())
                    })?;
                }

                // ReadyForQuery
                'Z' => {
                    let _status = read_message_data(&mut stream, code as u8, len).await?;

                    let prepared_max = config.general.max_prepared_statements;
                    let max_packet_size = if config.general.max_packet_size == 0 {
                        crate::messages::MAX_MESSAGE_SIZE
                    } else {
                        config.general.max_packet_size as i32
                    };

                    let mut server = Server {
                        server_id,
                        address: address.clone(),
                        stream: BufStream::new(stream),
                        server_parameters: server_parameters.clone(),
                        startup_parameters: server_parameters,
                        process_id,
                        secret_key,
                        ready: true,
                        in_transaction: false,
                        is_aborted: false,
                        in_copy_mode: false,
                        query_failed: false,
                        bad: false,
                        cleanup_state: CleanupState::new(),
                        connected_at: chrono::offset::Utc::now().naive_utc(),
                        stats,
                        application_name: application_name.to_string(),
                        last_activity: SystemTime::now(),
                        prepared_statements: match prepared_max {
                            0 => None,
                            _ => Some(LruCache::unbounded()),
                        },
                        prepared_max,
                        max_packet_size,
                    };
                    server.stats.update_backend_pid(process_id);
                    server.stats.register();

                    return Ok(server);
                }

                _ => {
                    return Err(Error::ProtocolSyncError(format!(
                        "unexpected message code '{code}' during server startup"
                    )));
                }
            }
        }
    }

    #[inline]
    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    #[inline]
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    #[inline]
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    #[inline]
    pub fn max_packet_size(&self) -> i32 {
        self.max_packet_size
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// In a transaction that already failed; the client owes a ROLLBACK.
    #[inline]
    pub fn in_aborted_transaction(&self) -> bool {
        self.in_transaction && self.is_aborted
    }

    #[inline]
    pub fn in_copy_mode(&self) -> bool {
        self.in_copy_mode
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn server_parameters_as_hashmap(&self) -> HashMap<String, String> {
        let bytes: BytesMut = (&self.server_parameters).into();
        let mut map = HashMap::new();
        let mut cursor = bytes;
        while cursor.has_remaining() {
            let _ = cursor.get_u8();
            let _ = cursor.get_i32();
            let key = crate::messages::BytesMutReader::read_string(&mut cursor).unwrap_or_default();
            let value =
                crate::messages::BytesMutReader::read_string(&mut cursor).unwrap_or_default();
            map.insert(key, value);
        }
        map
    }

    /// Indicate that this connection cannot be reused.
    pub fn mark_bad(&mut self, reason: &str) {
        error!("Server {self} marked bad, reason: {reason}");
        self.bad = true;
    }

    #[inline]
    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub(crate) fn stream(&mut self) -> &mut BufStream<StreamInner> {
        &mut self.stream
    }

    pub async fn send_and_flush(&mut self, messages: &BytesMut) -> Result<(), Error> {
        protocol_io::send_and_flush(self, messages).await
    }

    pub async fn send_and_flush_timeout(
        &mut self,
        messages: &BytesMut,
        duration: std::time::Duration,
    ) -> Result<(), Error> {
        protocol_io::send_and_flush_timeout(self, messages, duration).await
    }

    /// Read one framed response message, applying its state
    /// side-effects. See `protocol_io::recv_message`.
    pub async fn recv_message<C>(
        &mut self,
        client_stream: &mut C,
        client_parameters: Option<&mut ServerParameters>,
    ) -> Result<protocol_io::ResponseMessage, Error>
    where
        C: tokio::io::AsyncWrite + std::marker::Unpin,
    {
        protocol_io::recv_message(self, client_stream, client_parameters).await
    }

    /// Execute a query with the simple protocol and discard the
    /// response. Used for SET, ROLLBACK, reset and check queries.
    pub async fn small_simple_query(&mut self, query: &str) -> Result<(), Error> {
        let message = simple_query(query);
        self.send_and_flush(&message).await?;

        let mut sink = tokio::io::sink();
        while !self.ready {
            self.recv_message(&mut sink, None).await?;
        }
        if self.query_failed {
            // The reset/check query itself failed; don't reuse this
            // connection.
            self.mark_bad(&format!("control query {query:?} failed"));
            return Err(Error::ServerError(format!(
                "control query {query:?} failed"
            )));
        }
        Ok(())
    }

    /// Read and discard whatever the server still has to say, until it
    /// reports ready. Best effort before discarding a connection.
    pub async fn drain(&mut self) {
        let mut sink = tokio::io::sink();
        while !self.ready {
            if self.recv_message(&mut sink, None).await.is_err() {
                break;
            }
        }
    }

    /// Align this server's tracked parameters to the client's. Returns
    /// true if a SET had to run.
    pub async fn sync_parameters(&mut self, wanted: &ServerParameters) -> Result<bool, Error> {
        let diff = self.server_parameters.diff(wanted);
        if diff.is_empty() {
            return Ok(false);
        }

        let query = ServerParameters::set_query(&diff);
        self.small_simple_query(&query).await?;
        // The alignment SET is pooler housekeeping, not client session
        // state.
        self.cleanup_state.needs_cleanup_set = false;
        Ok(true)
    }

    /// Revert the tracked parameters to the values captured at connect.
    pub async fn reset_parameters(&mut self) -> Result<(), Error> {
        let startup_parameters = self.startup_parameters.clone();
        let diff = self.server_parameters.diff(&startup_parameters);
        if diff.is_empty() {
            return Ok(());
        }
        let query = ServerParameters::set_query(&diff);
        self.small_simple_query(&query).await?;
        self.cleanup_state.needs_cleanup_set = false;
        Ok(())
    }

    /// Run the configured reset query (server_reset_query).
    pub async fn run_reset_query(&mut self, query: &str) -> Result<(), Error> {
        self.small_simple_query(query).await?;

        let upper = query.to_uppercase();
        if upper.contains("DISCARD ALL") || upper.contains("DEALLOCATE ALL") {
            self.clear_prepared_statements();
        }
        if upper.contains("DISCARD ALL") || upper.contains("RESET ALL") {
            self.cleanup_state.reset();
            self.server_parameters = self.startup_parameters.clone();
        }
        Ok(())
    }

    /// Run the configured connect_query once, right after login.
    pub async fn run_connect_query(&mut self, query: &str) -> Result<(), Error> {
        self.small_simple_query(query).await
    }

    /// Checks and cleanup performed before this connection is given
    /// back to the pool.
    pub async fn checkin_cleanup(&mut self) -> Result<(), Error> {
        if self.in_copy_mode() {
            warn!("Server {self} returned while still in copy-mode");
            self.mark_bad("returned in copy-mode");
            return Err(Error::ProtocolSyncError(
                "server was returned to the pool while still in COPY mode".into(),
            ));
        }
        if !self.is_ready() {
            warn!("Server {self} returned while a response is still pending");
            self.mark_bad("returned with pending data");
            return Err(Error::ProtocolSyncError(
                "server was returned to the pool with response data pending".into(),
            ));
        }

        // Client went away mid-transaction: roll it back instead of
        // discarding the connection.
        if self.in_transaction() {
            warn!("Server {self} returned while still in transaction, rolling back");
            self.small_simple_query("ROLLBACK").await?;
        }

        if self.cleanup_state.needs_cleanup() {
            info!(
                "Server {self} returned with session state altered, discarding state ({})",
                self.cleanup_state
            );
            let mut reset_string = String::from("RESET ROLE;");
            if self.cleanup_state.needs_cleanup_set {
                reset_string.push_str("RESET ALL;");
            }
            if self.cleanup_state.needs_cleanup_prepare {
                reset_string.push_str("DEALLOCATE ALL;");
            }
            if self.cleanup_state.needs_cleanup_declare {
                reset_string.push_str("CLOSE ALL;");
            }
            self.small_simple_query(&reset_string).await?;
            if self.cleanup_state.needs_cleanup_prepare {
                self.clear_prepared_statements();
            }
            self.cleanup_state.reset();
        }

        self.in_transaction = false;
        self.is_aborted = false;
        self.in_copy_mode = false;
        self.query_failed = false;
        Ok(())
    }

    /// Map this client to this server for the purposes of query
    /// cancellation.
    pub fn claim(&self, client_process_id: i32, client_secret_key: i32) {
        claim_server(
            client_process_id,
            client_secret_key,
            self.process_id,
            self.secret_key,
            &self.address.host,
            self.address.port,
            PoolIdentifier::new(&self.address.pool_name, &self.address.username),
            self.server_id,
        );
    }

    /// Drop the cancel mapping again; the client can no longer cancel
    /// queries on this server.
    pub fn unclaim(&self, client_process_id: i32, client_secret_key: i32) {
        release_claim(client_process_id, client_secret_key);
    }

    // ------------------------------------------------------------------
    // Server-side prepared statement bookkeeping.
    // ------------------------------------------------------------------

    pub fn prepared_statements_enabled(&self) -> bool {
        self.prepared_statements.is_some()
    }

    pub fn prepared_statement_count(&self) -> usize {
        self.prepared_statements
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Does this server hold the statement? Promotes it when present.
    pub fn has_prepared_statement(&mut self, name: &str) -> bool {
        match self.prepared_statements.as_mut() {
            Some(cache) => {
                let found = cache.get(name).is_some();
                if found {
                    cache.promote(name);
                }
                found
            }
            None => false,
        }
    }

    /// Record a statement as being prepared on this server, evicting
    /// LRU statements beyond the cap. Statements referenced in the
    /// current transaction are never evicted; the cache temporarily
    /// exceeds the cap when everything is protected. Returns the names
    /// to Close on the server.
    pub fn register_prepared_statement(&mut self, name: &str) -> Vec<String> {
        let max = self.prepared_max;
        let mut evicted = Vec::new();
        let Some(cache) = self.prepared_statements.as_mut() else {
            return evicted;
        };

        if cache.get(name).is_some() {
            cache.promote(name);
            return evicted;
        }

        while cache.len() >= max {
            // `iter` walks MRU to LRU; take the least recently used
            // unprotected entry.
            let victim = cache
                .iter()
                .filter(|(_, guard)| guard.tx_refs == 0 && guard.acked)
                .next_back()
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    cache.pop(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }

        cache.put(name.to_string(), StatementGuard::default());
        evicted
    }

    /// The ParseComplete for this statement arrived.
    pub fn ack_prepared_statement(&mut self, name: &str) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            if let Some(guard) = cache.get_mut(name) {
                guard.acked = true;
            }
        }
    }

    /// Forget a statement (failed registration rollback, or a Close
    /// the client issued itself).
    pub fn forget_prepared_statement(&mut self, name: &str) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            cache.pop(name);
        }
    }

    /// Put an evicted statement back (the transaction that evicted it
    /// failed before its Close was confirmed).
    pub fn restore_prepared_statement(&mut self, name: &str) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            cache.put(
                name.to_string(),
                StatementGuard {
                    tx_refs: 0,
                    acked: true,
                },
            );
        }
    }

    /// The statement is referenced by the current transaction.
    pub fn mark_prepared_statement_used(&mut self, name: &str) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            if let Some(guard) = cache.get_mut(name) {
                guard.tx_refs += 1;
            }
        }
    }

    /// Called on every ReadyForQuery.
    pub(crate) fn clear_prepared_tx_refs(&mut self) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            for (_, guard) in cache.iter_mut() {
                guard.tx_refs = 0;
            }
        }
    }

    pub fn clear_prepared_statements(&mut self) {
        if let Some(cache) = self.prepared_statements.as_mut() {
            cache.clear();
        }
    }

    pub fn connected_at(&self) -> chrono::naive::NaiveDateTime {
        self.connected_at
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }
}

impl Drop for Server {
    /// Try a clean shutdown: best effort, the socket may not be
    /// writable.
    fn drop(&mut self) {
        self.stats.disconnect();

        if !self.is_bad() {
            let mut bytes = BytesMut::with_capacity(5);
            bytes.put_u8(b'X');
            bytes.put_i32(4);
            match self.stream.get_mut().try_write(&bytes) {
                Ok(5) => (),
                Err(err) => warn!("Dirty server {self} shutdown: {err}"),
                _ => warn!("Dirty server {self} shutdown"),
            };
        }

        let now = chrono::offset::Utc::now().naive_utc();
        let duration = now - self.connected_at;
        let message = if self.bad {
            "Server connection terminated"
        } else {
            "Server connection closed"
        };
        info!(
            "{} {}, session duration: {}",
            message,
            self,
            crate::format_duration(&duration)
        );
    }
}
