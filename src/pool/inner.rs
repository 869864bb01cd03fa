//! The pool's inner state: the per-state server lists, the client
//! wait queue, and the single transition primitive that keeps list
//! membership and the state field in lockstep.
//!
//! Everything in here runs under the pool mutex and never awaits.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::errors::Error;
use crate::server::Server;
use crate::stats::ServerStatState;
use crate::utils::clock;

/// States a server connection can be in. The state IS the list the
/// server is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ServerState {
    /// Connection being established / logging in.
    Login = 0,
    /// Parked, ready to be linked to a client.
    Idle = 1,
    /// Linked to a client.
    Active = 2,
    /// Just unlinked, undergoing bookkeeping before it is reusable.
    Used = 3,
    /// Running the reset query.
    Tested = 4,
    /// Unlinked but held back until in-flight cancels drain.
    BeingCanceled = 5,
    /// Short-lived connection carrying a CancelRequest.
    ActiveCancel = 6,
}

pub const SERVER_STATE_COUNT: usize = 7;

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Login => "login",
            ServerState::Idle => "idle",
            ServerState::Active => "active",
            ServerState::Used => "used",
            ServerState::Tested => "tested",
            ServerState::BeingCanceled => "being_canceled",
            ServerState::ActiveCancel => "active_cancel",
        }
    }

    pub(crate) fn stats_state(&self) -> ServerStatState {
        match self {
            ServerState::Login => ServerStatState::Login,
            ServerState::Idle => ServerStatState::Idle,
            ServerState::Active => ServerStatState::Active,
            ServerState::Used => ServerStatState::Used,
            ServerState::Tested => ServerStatState::Tested,
            ServerState::BeingCanceled => ServerStatState::BeingCanceled,
            ServerState::ActiveCancel => ServerStatState::ActiveCancel,
        }
    }
}

/// Metadata record for one server connection. The I/O object itself
/// (`conn`) is parked here while the pool holds the connection and
/// checked out (None) while a client task drives it.
pub struct ServerEntry {
    pub state: ServerState,
    pub conn: Option<Server>,
    pub created_at: quanta::Instant,
    pub last_used_at: quanta::Instant,
    /// Close as soon as the connection is unlinked.
    pub close_needed: bool,
    /// Cancel requests in flight against this server, by the issuing
    /// client's (process_id, secret_key).
    pub canceling_clients: HashSet<(i32, i32)>,
    pub stats: std::sync::Arc<crate::stats::ServerStats>,
}

/// A client parked until a server frees up.
pub(crate) struct Waiter {
    pub token: u64,
    pub client_process_id: i32,
    pub queued_at: quanta::Instant,
    pub tx: oneshot::Sender<Result<(u64, Server), Error>>,
}

/// Client list membership, mirroring the client state machine.
#[derive(Debug, Default)]
pub struct ClientLists {
    /// Logged-in clients currently driving (or able to drive) a query.
    pub active: HashSet<i32>,
    /// Cancel requests waiting for a connection slot.
    pub waiting_cancel: VecDeque<(i32, i32)>,
    /// Cancel requests already forwarded, awaiting teardown.
    pub active_cancel: HashSet<(i32, i32)>,
}

/// Pool-wide connect failure bookkeeping, for login-retry backoff.
#[derive(Debug, Default)]
pub struct ConnectFailure {
    pub at: Option<quanta::Instant>,
    pub message: String,
}

/// Inner pool state. One instance per (database, user) pool, protected
/// by the pool mutex.
pub struct PoolInner {
    lists: [VecDeque<u64>; SERVER_STATE_COUNT],
    entries: HashMap<u64, ServerEntry>,

    pub(crate) waiters: VecDeque<Waiter>,
    pub(crate) clients: ClientLists,

    pub(crate) last_lifetime_disconnect: quanta::Instant,
    pub(crate) connect_failure: ConnectFailure,

    /// Round-robin counter for host lists. Never reset, on purpose:
    /// a reload that shrinks the host list simply wraps.
    pub(crate) rrcounter: u16,
}

impl Default for PoolInner {
    fn default() -> Self {
        PoolInner {
            lists: Default::default(),
            entries: HashMap::new(),
            waiters: VecDeque::new(),
            clients: ClientLists::default(),
            last_lifetime_disconnect: clock::now(),
            connect_failure: ConnectFailure::default(),
            rrcounter: 0,
        }
    }
}

impl PoolInner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new server entry in the Login list.
    pub fn insert_login(&mut self, id: u64, stats: std::sync::Arc<crate::stats::ServerStats>) {
        let now = clock::now();
        let prev = self.entries.insert(
            id,
            ServerEntry {
                state: ServerState::Login,
                conn: None,
                created_at: now,
                last_used_at: now,
                close_needed: false,
                canceling_clients: HashSet::new(),
                stats,
            },
        );
        debug_assert!(prev.is_none(), "server id reused");
        self.lists[ServerState::Login as usize].push_back(id);
        self.assert_consistent(id);
    }

    /// The single transition primitive: unlink from the current state
    /// list, link into the new one, update the state field.
    pub fn change_state(&mut self, id: u64, new_state: ServerState) {
        let entry = self.entries.get_mut(&id).expect("unknown server id");
        let old_state = entry.state;
        if old_state == new_state {
            return;
        }

        let old_list = &mut self.lists[old_state as usize];
        let pos = old_list
            .iter()
            .position(|&other| other == id)
            .expect("server missing from its state list");
        old_list.remove(pos);

        entry.state = new_state;
        entry.stats.set_state(new_state.stats_state());
        self.lists[new_state as usize].push_back(id);

        self.assert_consistent(id);
    }

    /// Like [`change_state`](Self::change_state), for entries that may
    /// have been removed concurrently (pool killed while the server
    /// was checked out). Returns false when the entry is gone.
    pub fn try_change_state(&mut self, id: u64, new_state: ServerState) -> bool {
        if self.entries.contains_key(&id) {
            self.change_state(id, new_state);
            true
        } else {
            false
        }
    }

    /// Remove the entry entirely, returning the parked connection if
    /// any. The caller drops the connection outside the lock.
    pub fn remove(&mut self, id: u64) -> Option<Server> {
        let entry = self.entries.remove(&id)?;
        let list = &mut self.lists[entry.state as usize];
        let pos = list
            .iter()
            .position(|&other| other == id)
            .expect("server missing from its state list");
        list.remove(pos);
        entry.conn
    }

    fn assert_consistent(&self, id: u64) {
        #[cfg(debug_assertions)]
        {
            let entry = self.entries.get(&id).expect("unknown server id");
            let mut memberships = 0;
            for (state, list) in self.lists.iter().enumerate() {
                let present = list.iter().filter(|&&other| other == id).count();
                if state == entry.state as usize {
                    debug_assert_eq!(present, 1, "server must be in its state list once");
                } else {
                    debug_assert_eq!(present, 0, "server linked into a foreign state list");
                }
                memberships += present;
            }
            debug_assert_eq!(memberships, 1);
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = id;
        }
    }

    pub fn entry(&self, id: u64) -> Option<&ServerEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: u64) -> Option<&mut ServerEntry> {
        self.entries.get_mut(&id)
    }

    pub fn list(&self, state: ServerState) -> &VecDeque<u64> {
        &self.lists[state as usize]
    }

    pub fn list_count(&self, state: ServerState) -> usize {
        self.lists[state as usize].len()
    }

    /// Fully connected servers, the number the janitor balances against
    /// pool_size and min_pool_size. Cancel carriers and logins are
    /// deliberately excluded.
    pub fn connected_server_count(&self) -> usize {
        self.list_count(ServerState::Active)
            + self.list_count(ServerState::Idle)
            + self.list_count(ServerState::Used)
            + self.list_count(ServerState::Tested)
            + self.list_count(ServerState::BeingCanceled)
    }

    /// Every open connection, including logins in progress and cancel
    /// carriers.
    pub fn total_server_count(&self) -> usize {
        self.connected_server_count()
            + self.list_count(ServerState::Login)
            + self.list_count(ServerState::ActiveCancel)
    }

    /// Pop the head of the idle list for assignment, taking the parked
    /// connection out and moving the entry to Active.
    pub fn pop_idle(&mut self) -> Option<(u64, Server)> {
        let id = *self.lists[ServerState::Idle as usize].front()?;
        self.change_state(id, ServerState::Active);
        let entry = self.entries.get_mut(&id).expect("unknown server id");
        entry.last_used_at = clock::now();
        let conn = entry.conn.take().expect("idle server without a connection");
        Some((id, conn))
    }

    /// Park a connection on its entry.
    pub fn park(&mut self, id: u64, conn: Server) {
        let entry = self.entries.get_mut(&id).expect("unknown server id");
        debug_assert!(entry.conn.is_none(), "server parked twice");
        entry.last_used_at = clock::now();
        entry.conn = Some(conn);
    }

    /// Hand an Active-state connection to the next live waiter.
    /// Returns the connection back if nobody is waiting.
    pub fn hand_to_waiter(&mut self, id: u64, mut conn: Server) -> Option<Server> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(Ok((id, conn))) {
                Ok(()) => return None,
                // Receiver gave up (timeout); try the next waiter.
                Err(Ok((_, returned))) => conn = returned,
                Err(Err(_)) => unreachable!("we sent Ok"),
            }
        }
        Some(conn)
    }

    /// Fail every waiting client, e.g. after a server connect failure.
    pub fn fail_waiters(&mut self, make_error: impl Fn() -> Error) {
        while let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter.tx.send(Err(make_error()));
        }
    }

    /// Drop one waiter by its token (its receiver timed out).
    pub fn remove_waiter(&mut self, token: u64) {
        if let Some(pos) = self.waiters.iter().position(|w| w.token == token) {
            self.waiters.remove(pos);
        }
    }

    pub fn waiting_client_count(&self) -> usize {
        self.waiters.len()
    }

    /// Oldest wait start, for SHOW POOLS maxwait.
    pub fn oldest_wait(&self) -> Option<quanta::Instant> {
        self.waiters.front().map(|w| w.queued_at)
    }

    /// Whether a new connection attempt is allowed right now given the
    /// login-retry backoff.
    pub fn login_allowed(&self, retry_backoff: std::time::Duration) -> bool {
        match self.connect_failure.at {
            Some(at) => at.elapsed() >= retry_backoff,
            None => true,
        }
    }

    pub fn record_connect_failure(&mut self, message: &str) {
        self.connect_failure.at = Some(clock::now());
        self.connect_failure.message = message.to_string();
    }

    pub fn clear_connect_failure(&mut self) {
        self.connect_failure.at = None;
        self.connect_failure.message.clear();
    }

    /// Next host index for a fresh connection.
    pub fn next_host_index(&mut self, host_count: usize, round_robin: bool) -> usize {
        if host_count <= 1 {
            return 0;
        }
        if round_robin {
            let index = self.rrcounter as usize % host_count;
            self.rrcounter = self.rrcounter.wrapping_add(1);
            index
        } else {
            0
        }
    }

    /// Ids currently linked into any list, for iteration by the
    /// janitor and the console.
    pub fn all_ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stats() -> Arc<crate::stats::ServerStats> {
        Arc::new(crate::stats::ServerStats::new(0, "db", "user", "host", 5432))
    }

    #[test]
    fn change_state_moves_between_lists() {
        let mut inner = PoolInner::new();
        inner.insert_login(1, stats());
        assert_eq!(inner.list_count(ServerState::Login), 1);

        inner.change_state(1, ServerState::Idle);
        assert_eq!(inner.list_count(ServerState::Login), 0);
        assert_eq!(inner.list_count(ServerState::Idle), 1);
        assert_eq!(inner.entry(1).unwrap().state, ServerState::Idle);

        inner.change_state(1, ServerState::Active);
        inner.change_state(1, ServerState::Used);
        inner.change_state(1, ServerState::Tested);
        inner.change_state(1, ServerState::BeingCanceled);
        assert_eq!(inner.connected_server_count(), 1);
        assert_eq!(inner.total_server_count(), 1);
    }

    #[test]
    fn counts_split_by_connectedness() {
        let mut inner = PoolInner::new();
        inner.insert_login(1, stats());
        inner.insert_login(2, stats());
        inner.change_state(2, ServerState::Idle);
        inner.insert_login(3, stats());
        inner.change_state(3, ServerState::ActiveCancel);

        assert_eq!(inner.connected_server_count(), 1);
        assert_eq!(inner.total_server_count(), 3);
    }

    #[test]
    fn remove_unlinks_from_list() {
        let mut inner = PoolInner::new();
        inner.insert_login(7, stats());
        inner.change_state(7, ServerState::Idle);
        assert!(inner.remove(7).is_none()); // no conn parked in this test
        assert_eq!(inner.list_count(ServerState::Idle), 0);
        assert!(inner.entry(7).is_none());
    }

    #[test]
    fn rrcounter_wraps_without_reset() {
        let mut inner = PoolInner::new();
        assert_eq!(inner.next_host_index(3, true), 0);
        assert_eq!(inner.next_host_index(3, true), 1);
        assert_eq!(inner.next_host_index(3, true), 2);
        assert_eq!(inner.next_host_index(3, true), 0);
        // List shrinks; the counter keeps counting.
        assert_eq!(inner.next_host_index(2, true), 0);
        assert_eq!(inner.next_host_index(2, true), 1);
        // Round-robin disabled: always the first host.
        assert_eq!(inner.next_host_index(2, false), 0);
    }

    #[test]
    fn waiter_removal_by_token() {
        let mut inner = PoolInner::new();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        inner.waiters.push_back(Waiter {
            token: 42,
            client_process_id: 1,
            queued_at: crate::utils::clock::now(),
            tx,
        });
        assert_eq!(inner.waiting_client_count(), 1);
        inner.remove_waiter(42);
        assert_eq!(inner.waiting_client_count(), 0);
    }
}
