//! The per-client dispatch loop: routing packets between a client and
//! its linked server, pairing every server reply against the
//! outstanding-request queue, and applying the pool-mode release
//! rules.

use bytes::{BufMut, BytesMut};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::admin::handle_admin;
use crate::app::server::{ShutdownMode, SHUTDOWN_MODE};
use crate::config::PoolMode;
use crate::errors::Error;
use crate::messages::{
    bind_statement_name, check_query_response, close_complete, command_complete,
    deallocate_response, error_message, error_response, error_response_terminal, parse_complete,
    read_message, ready_for_query, rewrite_bind, write_all_flush, Close, Describe, Parse,
};
use crate::pool::{ConnectionPool, ServerLease};
use crate::server::ResponseMessage;
use crate::utils::clock;

use super::core::Client;
use super::requests::{ResponseAction, StatementEffect};

/// Collected server output is flushed to the client at this size.
const RELAY_FLUSH_THRESHOLD: usize = 8192;

/// How long an async (Flush-driven) pump waits for more server output
/// before yielding back to the client.
const ASYNC_PUMP_IDLE: Duration = Duration::from_millis(100);

/// Time budget for pushing a batch at the server.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How a response pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    /// ReadyForQuery arrived (or a copy-in stream handed control
    /// back).
    Done,
    /// The server connection died mid-response. The client already
    /// received a synthesized error and ReadyForQuery and may retry on
    /// a fresh server.
    ServerLost,
}

/// What the transaction loop decided.
enum TxOutcome {
    /// Server released, client stays.
    Release,
    /// Client sent Terminate or must be dropped.
    Disconnect,
    /// Server released; park the client until it rolls back the
    /// failed transaction.
    WaitRollback,
}

fn is_standalone_begin(message: &BytesMut) -> bool {
    if message.is_empty() || message[0] != b'Q' || message.len() < 6 {
        return false;
    }
    let payload = &message[5..];
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    let sql = match std::str::from_utf8(&payload[..end]) {
        Ok(sql) => sql,
        Err(_) => return false,
    };
    sql.trim().trim_end_matches(';').trim().eq_ignore_ascii_case("begin")
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    /// Serve a connected and authenticated client until it leaves.
    pub async fn handle(&mut self) -> Result<(), Error> {
        if self.cancel_mode {
            return self.handle_cancel_mode().await;
        }

        self.stats.register();

        if self.admin {
            return self.handle_admin_loop().await;
        }

        let pool = self.get_pool().await?;
        pool.register_client(self.process_id);
        let result = self.serve(&pool).await;
        pool.unregister_client(self.process_id);
        result
    }

    async fn handle_admin_loop(&mut self) -> Result<(), Error> {
        loop {
            let message = read_message(&mut self.read, self.max_packet_size).await?;
            if message[0] == b'X' {
                debug!("Admin client {} disconnected", self.addr);
                return Ok(());
            }
            handle_admin(&mut self.write, message).await?;
        }
    }

    /// The idle/link/serve cycle of a regular client.
    async fn serve(&mut self, pool: &ConnectionPool) -> Result<(), Error> {
        let settings = pool.settings.clone();
        let mut pending_begin: Option<BytesMut> = None;

        loop {
            self.stats.idle();

            let message = match self
                .read_client_message(settings.client_idle_timeout.as_std())
                .await?
            {
                Some(message) => message,
                None => {
                    error_response_terminal(&mut self.write, "client_idle_timeout", "08P01")
                        .await?;
                    return Err(Error::ClientError("client_idle_timeout".into()));
                }
            };

            let code = message[0];

            if code == b'X' {
                debug!("Client {} sent Terminate", self.addr);
                return Ok(());
            }

            if SHUTDOWN_MODE.load(std::sync::atomic::Ordering::Relaxed)
                == ShutdownMode::WaitForServers as u8
            {
                warn!("Dropping client {} during shutdown", self.addr);
                error_response_terminal(&mut self.write, "pooler is shutting down", "58006")
                    .await?;
                return Ok(());
            }

            if self.try_handle_without_server(&message).await? {
                continue;
            }

            // A lone BEGIN only reserves a server; answer it
            // synthetically and replay it when real work arrives.
            if is_standalone_begin(&message) && pending_begin.is_none() {
                debug!("Synthesizing response for standalone BEGIN from {}", self.addr);
                let mut response = command_complete("BEGIN");
                response.put_u8(b'Z');
                response.put_i32(5);
                response.put_u8(b'T');
                write_all_flush(&mut self.write, &response).await?;
                pending_begin = Some(message);
                continue;
            }

            // Grab a server.
            self.stats.waiting();
            let wait_start = clock::now();
            let mut lease = match pool.get(self.process_id).await {
                Ok(lease) => lease,
                Err(err) => {
                    self.stats.error();
                    self.stats.idle();
                    let detail = err.to_string();
                    error_response(
                        &mut self.write,
                        &format!("sorry, too many clients already ({detail})"),
                        "53300",
                    )
                    .await?;
                    error!(
                        "Failed to get a server {{ pool: {}, user: {}, error: {detail:?} }}",
                        self.pool_name, self.username
                    );
                    return Err(err);
                }
            };
            self.stats
                .wait_time(wait_start.elapsed().as_micros() as u64);
            self.stats.active();

            // Link.
            let xact_start = clock::now();
            {
                let server = lease.server();
                server.claim(self.process_id, self.secret_key);
                server
                    .stats
                    .linked_application(self.server_parameters.get_application_name());

                if let Err(err) = server.sync_parameters(&self.server_parameters).await {
                    warn!("Failed to align server parameters: {err}");
                    server.mark_bad("failed to align session parameters");
                    pool.release(lease).await;
                    error_response(&mut self.write, "failed to prepare a server", "58000")
                        .await?;
                    continue;
                }

                if let Some(begin) = pending_begin.take() {
                    debug!("Replaying deferred BEGIN for {}", self.addr);
                    if let Err(err) = self.replay_deferred_begin(server, &begin).await {
                        pool.release(lease).await;
                        return Err(err);
                    }
                }
            }

            let outcome = self.transaction_loop(&mut lease, pool, message, xact_start).await;

            // Unlink.
            lease.server().unclaim(self.process_id, self.secret_key);
            let xact_time = xact_start.elapsed().as_micros() as u64;
            pool.stats.xact(xact_time);
            self.stats.transaction();
            lease.server().stats.transaction();
            pool.release(lease).await;

            // A torn batch leaves stale expectations behind; the
            // server that carried them was already discarded by the
            // release checks.
            self.buffer.clear();
            let _ = self.requests.drain().count();

            match outcome {
                Ok(TxOutcome::Release) => (),
                Ok(TxOutcome::Disconnect) => return Ok(()),
                Ok(TxOutcome::WaitRollback) => self.wait_rollback().await?,
                Err(err) => {
                    self.stats.error();
                    return Err(err);
                }
            }
        }
    }

    /// Read the next message from an unlinked client. `Ok(None)` means
    /// the idle timeout fired.
    async fn read_client_message(
        &mut self,
        idle_timeout: Duration,
    ) -> Result<Option<BytesMut>, Error> {
        if idle_timeout.is_zero() {
            return Ok(Some(
                read_message(&mut self.read, self.max_packet_size).await?,
            ));
        }
        match tokio::time::timeout(
            idle_timeout,
            read_message(&mut self.read, self.max_packet_size),
        )
        .await
        {
            Ok(message) => Ok(Some(message?)),
            Err(_) => Ok(None),
        }
    }

    /// Answer queries the pooler can serve locally: the health-check
    /// query and DEALLOCATE of cached statements.
    async fn try_handle_without_server(&mut self, message: &BytesMut) -> Result<bool, Error> {
        if message[0] != b'Q' {
            return Ok(false);
        }

        if message.len() == self.pooler_check_query_bytes.len()
            && self.pooler_check_query_bytes.as_slice() == &message[..]
        {
            write_all_flush(&mut self.write, &check_query_response()).await?;
            return Ok(true);
        }

        if self.prepared.enabled && message.len() >= 6 {
            let payload = &message[5..message.len() - 1];
            const DEALLOCATE: &[u8] = b"deallocate ";
            if payload.len() > DEALLOCATE.len()
                && payload[..DEALLOCATE.len()].eq_ignore_ascii_case(DEALLOCATE)
            {
                let target = std::str::from_utf8(&payload[DEALLOCATE.len()..])
                    .unwrap_or("")
                    .trim()
                    .trim_end_matches(';');
                if target.eq_ignore_ascii_case("all") {
                    let count = self.prepared.statements.len();
                    self.prepared.statements.clear();
                    debug!("DEALLOCATE ALL cleared {count} cached statements");
                } else if !target.is_empty() {
                    self.prepared.statements.remove(target);
                    debug!("DEALLOCATE removed {target:?} from the statement cache");
                }
                write_all_flush(&mut self.write, &deallocate_response()).await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Push a stashed BEGIN at the server, discarding the response the
    /// client already received synthetically.
    async fn replay_deferred_begin(
        &mut self,
        server: &mut crate::server::Server,
        begin: &BytesMut,
    ) -> Result<(), Error> {
        server.send_and_flush_timeout(begin, SEND_TIMEOUT).await?;
        let mut sink = tokio::io::sink();
        while !server.is_ready() {
            if let Err(err) = server.recv_message(&mut sink, None).await {
                server.mark_bad("deferred BEGIN failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Multiple queries can be issued here; the server belongs to the
    /// client until the release rules fire (or forever in session
    /// mode).
    async fn transaction_loop(
        &mut self,
        lease: &mut ServerLease,
        pool: &ConnectionPool,
        first_message: BytesMut,
        xact_start: quanta::Instant,
    ) -> Result<TxOutcome, Error> {
        let settings = pool.settings.clone();
        let mut next_message = Some(first_message);

        loop {
            let message = match next_message.take() {
                Some(message) => message,
                None => {
                    match self.read_linked_message(lease, &settings, xact_start).await? {
                        Some(message) => message,
                        None => return Ok(TxOutcome::Disconnect),
                    }
                }
            };

            let code = message[0];
            let query_start = clock::now();

            match code {
                // Terminate.
                b'X' => {
                    debug!("Client {} sent Terminate", self.addr);
                    return Ok(TxOutcome::Disconnect);
                }

                // Simple query, or a function call: a full roundtrip.
                b'Q' | b'F' => {
                    self.requests.push(code, ResponseAction::Forward);
                    lease
                        .server()
                        .send_and_flush_timeout(&message, SEND_TIMEOUT)
                        .await?;
                    let pumped = self.pump_until_ready(lease, pool).await?;
                    self.account_query(lease, pool, query_start);
                    if pumped == PumpOutcome::ServerLost {
                        return Ok(TxOutcome::Release);
                    }

                    if let Some(outcome) = self.after_command(lease, &settings).await? {
                        return Ok(outcome);
                    }
                }

                // Extended protocol: collected until Sync or Flush.
                b'P' => self.handle_parse(pool, message)?,
                b'B' => self.handle_bind(lease, pool, message)?,
                b'D' => self.handle_describe(lease, pool, message)?,
                b'E' => {
                    self.buffer.put(&message[..]);
                    self.requests.push(b'E', ResponseAction::Forward);
                }
                b'C' => self.handle_close(message)?,

                // Sync: flush the batch and read until ReadyForQuery.
                b'S' => {
                    self.buffer.put(&message[..]);
                    self.requests.push(b'S', ResponseAction::Forward);
                    let batch = std::mem::take(&mut self.buffer);
                    lease
                        .server()
                        .send_and_flush_timeout(&batch, SEND_TIMEOUT)
                        .await?;
                    let pumped = self.pump_until_ready(lease, pool).await?;
                    self.account_query(lease, pool, query_start);
                    if pumped == PumpOutcome::ServerLost {
                        return Ok(TxOutcome::Release);
                    }

                    if let Some(outcome) = self.after_command(lease, &settings).await? {
                        return Ok(outcome);
                    }
                }

                // Flush: the client drives the pipeline itself; answer
                // with whatever the server has and stay linked.
                b'H' => {
                    self.buffer.put(&message[..]);
                    let batch = std::mem::take(&mut self.buffer);
                    lease
                        .server()
                        .send_and_flush_timeout(&batch, SEND_TIMEOUT)
                        .await?;
                    if self.prepared.enabled && !self.prepared.async_client {
                        debug!("Client {} uses Flush; statement rewriting off", self.addr);
                        self.prepared.async_client = true;
                    }
                    self.pump_async(lease).await?;
                }

                // CopyData toward the server, batched.
                b'd' => {
                    if !lease.server().in_copy_mode() {
                        lease.server().mark_bad("CopyData outside of copy mode");
                        error_response(&mut self.write, "not in COPY mode", "08P01").await?;
                        return Err(Error::ProtocolSyncError(
                            "CopyData outside of copy mode".into(),
                        ));
                    }
                    self.buffer.put(&message[..]);
                    if self.buffer.len() > RELAY_FLUSH_THRESHOLD {
                        let batch = std::mem::take(&mut self.buffer);
                        lease
                            .server()
                            .send_and_flush_timeout(&batch, SEND_TIMEOUT)
                            .await?;
                    }
                }

                // CopyDone / CopyFail: finish the stream, then read the
                // command result.
                b'c' | b'f' => {
                    if !lease.server().in_copy_mode() {
                        lease.server().mark_bad("copy end outside of copy mode");
                        error_response(&mut self.write, "not in COPY mode", "08P01").await?;
                        return Err(Error::ProtocolSyncError(
                            "copy end outside of copy mode".into(),
                        ));
                    }
                    self.buffer.put(&message[..]);
                    let batch = std::mem::take(&mut self.buffer);
                    lease
                        .server()
                        .send_and_flush_timeout(&batch, SEND_TIMEOUT)
                        .await?;
                    let pumped = self.pump_until_ready(lease, pool).await?;
                    self.account_query(lease, pool, query_start);
                    if pumped == PumpOutcome::ServerLost {
                        return Ok(TxOutcome::Release);
                    }

                    if let Some(outcome) = self.after_command(lease, &settings).await? {
                        return Ok(outcome);
                    }
                }

                _ => {
                    error!("Unexpected message code '{}' from {}", code as char, self.addr);
                    error_response_terminal(
                        &mut self.write,
                        &format!("unexpected message type '{}'", code as char),
                        "08P01",
                    )
                    .await?;
                    return Err(Error::ProtocolSyncError(format!(
                        "unexpected client message '{}'",
                        code as char
                    )));
                }
            }
        }
    }

    fn account_query(&self, lease: &mut ServerLease, pool: &ConnectionPool, start: quanta::Instant) {
        let elapsed = start.elapsed().as_micros() as u64;
        pool.stats.query(elapsed);
        self.stats.query();
        lease.server().stats.query(elapsed);
    }

    /// Release rules after a completed command, per pool mode.
    async fn after_command(
        &mut self,
        lease: &mut ServerLease,
        settings: &Arc<crate::pool::PoolSettings>,
    ) -> Result<Option<TxOutcome>, Error> {
        let server = lease.server();

        if server.in_copy_mode() {
            // The stream is still open; stay linked regardless of mode.
            return Ok(None);
        }

        if server.in_aborted_transaction() && settings.pool_mode != PoolMode::Session {
            return Ok(Some(TxOutcome::WaitRollback));
        }

        match settings.pool_mode {
            PoolMode::Session => Ok(None),
            PoolMode::Transaction => {
                if server.in_transaction() {
                    Ok(None)
                } else {
                    Ok(Some(TxOutcome::Release))
                }
            }
            PoolMode::Statement => {
                if server.in_transaction() {
                    // No transaction blocks under statement pooling.
                    error_response_terminal(
                        &mut self.write,
                        "transaction blocks not allowed in statement pooling mode",
                        "0A000",
                    )
                    .await?;
                    Err(Error::ClientError(
                        "transaction block under statement pooling".into(),
                    ))
                } else {
                    Ok(Some(TxOutcome::Release))
                }
            }
        }
    }

    /// Read the next client message while linked to a server,
    /// enforcing the transaction timeouts. `Ok(None)` means Terminate.
    async fn read_linked_message(
        &mut self,
        lease: &mut ServerLease,
        settings: &Arc<crate::pool::PoolSettings>,
        xact_start: quanta::Instant,
    ) -> Result<Option<BytesMut>, Error> {
        let in_transaction = lease.server().in_transaction();

        let mut deadline: Option<Duration> = None;
        if in_transaction && !settings.idle_transaction_timeout.is_disabled() {
            deadline = Some(settings.idle_transaction_timeout.as_std());
        }
        if in_transaction && !settings.transaction_timeout.is_disabled() {
            let remaining = settings
                .transaction_timeout
                .as_std()
                .saturating_sub(xact_start.elapsed());
            deadline = Some(match deadline {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }

        let result = match deadline {
            None => read_message(&mut self.read, self.max_packet_size).await,
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    read_message(&mut self.read, self.max_packet_size),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Transaction timeout for client {}", self.addr);
                        error_response_terminal(
                            &mut self.write,
                            "transaction timeout, closing connection",
                            "25P03",
                        )
                        .await?;
                        // checkin_cleanup rolls the transaction back.
                        return Ok(None);
                    }
                }
            }
        };

        result.map(Some)
    }

    // -----------------------------------------------------------------
    // Extended protocol handling with statement rewriting.
    // -----------------------------------------------------------------

    fn rewriting_active(&self) -> bool {
        self.prepared.enabled && !self.prepared.async_client
    }

    /// A Parse for a named statement is absorbed into the cache; the
    /// server sees it lazily, when something references it.
    fn handle_parse(&mut self, pool: &ConnectionPool, message: BytesMut) -> Result<(), Error> {
        if !self.rewriting_active() {
            self.buffer.put(&message[..]);
            self.requests.push(b'P', ResponseAction::Forward);
            return Ok(());
        }

        let parse = Parse::parse(&message)?;
        if parse.name.is_empty() {
            // Anonymous statements live and die with the batch.
            self.buffer.put(&message[..]);
            self.requests.push(b'P', ResponseAction::Forward);
            return Ok(());
        }

        let cache = pool
            .prepared_statement_cache
            .as_ref()
            .expect("rewriting enabled without a cache");
        let query_id = parse.query_id();
        let renamed = cache.get_or_insert(&parse, query_id);

        // Re-Parse under the same client name replaces the mapping;
        // the old definition stays interned for other clients.
        self.prepared
            .statements
            .insert(parse.name.clone(), (renamed, query_id));
        pool.stats.client_parse();

        // The client still expects a ParseComplete at this position.
        self.requests.push(b'P', ResponseAction::Fake);
        Ok(())
    }

    /// Bind: rewrite the statement name, lazily preparing the
    /// statement on this server first when it lacks it.
    fn handle_bind(
        &mut self,
        lease: &mut ServerLease,
        pool: &ConnectionPool,
        message: BytesMut,
    ) -> Result<(), Error> {
        if !self.rewriting_active() {
            self.buffer.put(&message[..]);
            self.requests.push(b'B', ResponseAction::Forward);
            return Ok(());
        }

        let statement = bind_statement_name(&message)?;
        let entry = self.prepared.statements.get(&statement).cloned();
        match entry {
            None => {
                // Anonymous, or prepared outside our sight; forward
                // untouched.
                self.buffer.put(&message[..]);
                self.requests.push(b'B', ResponseAction::Forward);
            }
            Some((parse, query_id)) => {
                if let Some(cache) = pool.prepared_statement_cache.as_ref() {
                    cache.promote(&query_id);
                }
                self.ensure_statement_on_server(lease, pool, &parse)?;
                let rewritten = rewrite_bind(&message, &parse.name)?;
                self.buffer.put(&rewritten[..]);
                self.requests.push(b'B', ResponseAction::Forward);
                lease.server().mark_prepared_statement_used(&parse.name);
                pool.stats.bind();
            }
        }
        Ok(())
    }

    fn handle_describe(
        &mut self,
        lease: &mut ServerLease,
        pool: &ConnectionPool,
        message: BytesMut,
    ) -> Result<(), Error> {
        if !self.rewriting_active() {
            self.buffer.put(&message[..]);
            self.requests.push(b'D', ResponseAction::Forward);
            return Ok(());
        }

        let describe = Describe::parse(&message)?;
        if !describe.is_statement() || describe.name.is_empty() {
            self.buffer.put(&message[..]);
            self.requests.push(b'D', ResponseAction::Forward);
            return Ok(());
        }

        match self.prepared.statements.get(&describe.name).cloned() {
            None => {
                self.buffer.put(&message[..]);
                self.requests.push(b'D', ResponseAction::Forward);
            }
            Some((parse, query_id)) => {
                if let Some(cache) = pool.prepared_statement_cache.as_ref() {
                    cache.promote(&query_id);
                }
                self.ensure_statement_on_server(lease, pool, &parse)?;
                let rewritten = describe.rename(&parse.name);
                self.buffer.put(&rewritten[..]);
                self.requests.push(b'D', ResponseAction::Forward);
                lease.server().mark_prepared_statement_used(&parse.name);
            }
        }
        Ok(())
    }

    /// Close of a named statement is answered locally; the server-side
    /// definition is shared and stays.
    fn handle_close(&mut self, message: BytesMut) -> Result<(), Error> {
        if !self.rewriting_active() {
            self.buffer.put(&message[..]);
            self.requests.push(b'C', ResponseAction::Forward);
            return Ok(());
        }

        let close = Close::parse(&message)?;
        if close.is_statement() && !close.name.is_empty() {
            self.prepared.statements.remove(&close.name);
            // Close of an unknown statement also yields CloseComplete.
            self.requests.push(b'C', ResponseAction::Fake);
        } else {
            self.buffer.put(&message[..]);
            self.requests.push(b'C', ResponseAction::Forward);
        }
        Ok(())
    }

    /// Make sure the statement exists on the linked server: inject the
    /// eviction Closes and the Parse in front of the message being
    /// forwarded, each paired with a Skip entry for its reply.
    fn ensure_statement_on_server(
        &mut self,
        lease: &mut ServerLease,
        pool: &ConnectionPool,
        parse: &Arc<Parse>,
    ) -> Result<(), Error> {
        let server = lease.server();
        if server.has_prepared_statement(&parse.name) {
            return Ok(());
        }

        for evicted in server.register_prepared_statement(&parse.name) {
            debug!("Evicting statement {evicted} from server");
            let close_bytes: BytesMut = (&Close::new(&evicted)).try_into()?;
            self.buffer.put(&close_bytes[..]);
            self.requests.push_with_effect(
                b'C',
                ResponseAction::Skip,
                StatementEffect::Evict(evicted),
            );
        }

        let parse_bytes: BytesMut = parse.as_ref().try_into()?;
        self.buffer.put(&parse_bytes[..]);
        self.requests.push_with_effect(
            b'P',
            ResponseAction::Skip,
            StatementEffect::Register(parse.name.clone()),
        );
        pool.stats.server_parse();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Server response pumping.
    // -----------------------------------------------------------------

    /// Emit fabricated replies for Fake entries at the queue head.
    fn drain_leading_fakes(&mut self, out: &mut BytesMut) {
        while self
            .requests
            .head()
            .map(|r| r.action == ResponseAction::Fake)
            .unwrap_or(false)
        {
            let request = self.requests.pop().expect("head vanished");
            match request.code {
                b'P' => out.put(parse_complete()),
                b'C' => out.put(close_complete()),
                other => warn!("Fake entry with unexpected code '{}'", other as char),
            }
        }
    }

    /// Process one server message against the outstanding queue.
    /// Returns the bytes to relay (if any).
    fn route_response(
        &mut self,
        lease: &mut ServerLease,
        message: ResponseMessage,
        out: &mut BytesMut,
    ) {
        let code = message.code();
        let server = lease.server();
        let query_failed = server.query_failed;

        // Fabricated replies owed at positions ahead of this one go
        // out first, unless the batch already failed.
        if !query_failed {
            self.drain_leading_fakes(out);
        }

        let popped = match code {
            b'1' => self.requests.pop_if(b'P'),
            b'2' => self.requests.pop_if(b'B'),
            b'3' => self.requests.pop_if(b'C'),
            b't' | b'n' => self.requests.pop_if(b'D'),
            b'T' => self.requests.pop_if(b'D'),
            b'C' | b'I' => self
                .requests
                .pop_if(b'E')
                .or_else(|| self.requests.pop_if(b'Q')),
            b's' => self.requests.pop_if(b'E'),
            b'V' => self.requests.pop_if(b'F'),
            b'E' => self.requests.pop(),
            _ => None,
        };

        let action = popped
            .as_ref()
            .map(|r| r.action)
            .unwrap_or(ResponseAction::Forward);

        // Finalize prepared statement bookkeeping tied to the popped
        // request.
        if let Some(request) = &popped {
            match (&request.effect, code) {
                // The injected Parse was acknowledged.
                (Some(StatementEffect::Register(name)), b'1') => {
                    lease.server().ack_prepared_statement(name);
                }
                // The eviction Close was acknowledged; nothing to do,
                // the name is already gone from the server cache.
                (Some(StatementEffect::Evict(_)), b'3') => (),
                // The request failed; undo its cache effect.
                (Some(StatementEffect::Register(name)), _) => {
                    lease.server().forget_prepared_statement(name);
                }
                (Some(StatementEffect::Evict(name)), _) => {
                    lease.server().restore_prepared_statement(name);
                }
                (None, _) => (),
            }
        }

        if code == b'Z' {
            // The queue drains at every ReadyForQuery; whatever is
            // left never got its reply (error recovery), so cache
            // effects are rolled back and Fakes are dropped.
            let effects: Vec<StatementEffect> =
                self.requests.drain().filter_map(|r| r.effect).collect();
            let server = lease.server();
            for effect in effects {
                match effect {
                    StatementEffect::Register(name) => server.forget_prepared_statement(&name),
                    StatementEffect::Evict(name) => server.restore_prepared_statement(&name),
                }
            }
        }

        match message {
            ResponseMessage::Streamed(_) => {
                // Already on the wire toward the client.
            }
            ResponseMessage::Message(bytes) => match action {
                ResponseAction::Skip => (),
                ResponseAction::Forward | ResponseAction::Fake => out.put(&bytes[..]),
            },
        }
    }

    /// Read server responses until ReadyForQuery (or a copy stream
    /// hands control back to the client), relaying per the queue.
    async fn pump_until_ready(
        &mut self,
        lease: &mut ServerLease,
        pool: &ConnectionPool,
    ) -> Result<PumpOutcome, Error> {
        let query_timeout = pool.settings.query_timeout.as_std();
        if query_timeout.is_zero() {
            return self.pump_until_ready_inner(lease).await;
        }

        match tokio::time::timeout(query_timeout, self.pump_until_ready_inner(lease)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("query_timeout for client {}", self.addr);
                lease.server().mark_bad("query_timeout");
                error_response_terminal(
                    &mut self.write,
                    "query timeout, server connection closed",
                    "57014",
                )
                .await?;
                Err(Error::QueryTimeout)
            }
        }
    }

    async fn pump_until_ready_inner(
        &mut self,
        lease: &mut ServerLease,
    ) -> Result<PumpOutcome, Error> {
        // Relayed bytes go straight out (unflushed), so an oversized
        // message streamed inside recv_message can never overtake
        // buffered output.
        let mut out = BytesMut::new();

        loop {
            let message = {
                let server = lease.server();
                match server
                    .recv_message(&mut self.write, Some(&mut self.server_parameters))
                    .await
                {
                    Ok(message) => message,
                    Err(err) => {
                        if lease.server().in_copy_mode() {
                            // Mid-copy the client protocol cannot be
                            // repaired; drop the client too.
                            return Err(err);
                        }
                        // The client sees a synthesized error and a
                        // ReadyForQuery so it can recover; the broken
                        // server is discarded by the release path.
                        warn!("Server lost mid-query for client {}: {err}", self.addr);
                        let mut synthesized =
                            error_message("server connection lost", "08P01");
                        synthesized.put(ready_for_query(false));
                        write_all_flush(&mut self.write, &synthesized).await?;
                        return Ok(PumpOutcome::ServerLost);
                    }
                }
            };

            let code = message.code();
            self.route_response(lease, message, &mut out);
            if !out.is_empty() {
                crate::messages::write_all(&mut self.write, out.split()).await?;
            }

            if code == b'Z' {
                write_all_flush(&mut self.write, &[]).await?;
                return Ok(PumpOutcome::Done);
            }

            // CopyInResponse (or CopyBoth) suspends dispatch; the
            // client drives the next step. Copy-out keeps streaming
            // from the server, so the pump stays.
            if lease.server().in_copy_mode() && matches!(code, b'G' | b'W') {
                write_all_flush(&mut self.write, &[]).await?;
                return Ok(PumpOutcome::Done);
            }
        }
    }

    /// Pump after a Flush: the server answers with whatever it has,
    /// without a closing ReadyForQuery. Read until the line goes
    /// quiet.
    async fn pump_async(&mut self, lease: &mut ServerLease) -> Result<(), Error> {
        let mut out = BytesMut::new();
        self.drain_leading_fakes(&mut out);

        loop {
            let result = {
                let server = lease.server();
                tokio::time::timeout(
                    ASYNC_PUMP_IDLE,
                    server.recv_message(&mut self.write, Some(&mut self.server_parameters)),
                )
                .await
            };

            match result {
                Err(_) => break, // quiet; hand control back to the client
                Ok(Ok(message)) => {
                    let code = message.code();
                    self.route_response(lease, message, &mut out);
                    if !out.is_empty() {
                        crate::messages::write_all(&mut self.write, out.split()).await?;
                    }
                    if code == b'Z' || lease.server().is_ready() {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    let mut synthesized = error_message("server connection lost", "08P01");
                    synthesized.put(ready_for_query(false));
                    let _ = write_all_flush(&mut self.write, &synthesized).await;
                    return Err(err);
                }
            }
        }

        write_all_flush(&mut self.write, &out).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Aborted transaction parking.
    // -----------------------------------------------------------------

    /// The transaction failed and the server was released. Any command
    /// except ROLLBACK/COMMIT earns the client the standard aborted
    /// transaction error until it gives in.
    pub(crate) async fn wait_rollback(&mut self) -> Result<(), Error> {
        loop {
            let message = read_message(&mut self.read, self.max_packet_size).await?;
            match message[0] {
                b'X' => {
                    self.stats.disconnect();
                    return Ok(());
                }
                b'Q' => {
                    let payload = &message[5..];
                    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
                    let sql = std::str::from_utf8(&payload[..end]).unwrap_or("");
                    let command = sql.trim().trim_end_matches(';').trim();
                    if command.eq_ignore_ascii_case("rollback")
                        || command.eq_ignore_ascii_case("commit")
                    {
                        let mut response = BytesMut::with_capacity(32);
                        response.put(command_complete("ROLLBACK"));
                        response.put(ready_for_query(false));
                        write_all_flush(&mut self.write, &response).await?;
                        return Ok(());
                    }
                    self.send_aborted_transaction_error().await?;
                }
                _ => {
                    self.send_aborted_transaction_error().await?;
                }
            }
        }
    }

    async fn send_aborted_transaction_error(&mut self) -> Result<(), Error> {
        let mut buf = error_message(
            "current transaction is aborted, commands ignored until end of transaction block",
            "25P02",
        );
        buf.put_u8(b'Z');
        buf.put_i32(5);
        buf.put_u8(b'E');
        write_all_flush(&mut self.write, &buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_message(sql: &str) -> BytesMut {
        crate::messages::simple_query(sql)
    }

    #[test]
    fn standalone_begin_detection() {
        assert!(is_standalone_begin(&query_message("BEGIN")));
        assert!(is_standalone_begin(&query_message("begin;")));
        assert!(is_standalone_begin(&query_message("  Begin ; ")));
        assert!(!is_standalone_begin(&query_message("BEGIN; SELECT 1")));
        assert!(!is_standalone_begin(&query_message("SELECT 1")));
        assert!(!is_standalone_begin(&query_message("beginning")));
    }
}
