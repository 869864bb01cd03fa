//! Pool-wide prepared statement interner.
//!
//! Clients name statements freely; the pool keys each distinct
//! (query text, parameter types) pair by its query id and hands out a
//! single shared definition under a pooler-assigned name, so any
//! server can host the statement and any client can reach it no matter
//! which server backs the current transaction.
//!
//! The pooler name is derived from the query id itself, never from
//! insertion order. The table may therefore shed cold entries under
//! memory pressure without consequence: re-interning an evicted
//! statement produces the identical name, and per-server caches keyed
//! by that name stay valid.

use std::num::NonZeroUsize;
use std::sync::Arc;

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::messages::Parse;

/// Interned statement definitions, least recently used out first.
pub struct PreparedStatementCache {
    entries: Mutex<LruCache<u64, Arc<Parse>>>,
}

impl std::fmt::Debug for PreparedStatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("PreparedStatementCache")
            .field("len", &entries.len())
            .field("cap", &entries.cap())
            .finish()
    }
}

impl PreparedStatementCache {
    pub fn new(size: usize) -> Self {
        let cap = NonZeroUsize::new(size.max(1)).expect("capacity is at least one");
        PreparedStatementCache {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Look up by query id, interning on first sight. The returned
    /// definition carries the pooler-assigned name.
    pub fn get_or_insert(&self, parse: &Parse, query_id: u64) -> Arc<Parse> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&query_id) {
            return existing.clone();
        }

        let renamed = Arc::new(parse.rewrite(query_id));
        if let Some((_, cold)) = entries.push(query_id, renamed.clone()) {
            // Clients holding the Arc keep using it; the statement
            // simply gets re-interned on its next first sight, under
            // the same name.
            debug!("Interner dropped cold statement {}", cold.name);
        }
        renamed
    }

    pub fn get(&self, query_id: &u64) -> Option<Arc<Parse>> {
        self.entries.lock().get(query_id).cloned()
    }

    /// Mark the statement as recently used.
    pub fn promote(&self, query_id: &u64) {
        self.entries.lock().promote(query_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of all entries, for SHOW PREPARED_STATEMENTS. Does not
    /// disturb the recency order.
    pub fn entries(&self) -> Vec<(u64, Arc<Parse>)> {
        self.entries
            .lock()
            .iter()
            .map(|(query_id, parse)| (*query_id, parse.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parse(query: &str) -> Parse {
        let p = Parse {
            name: "client_name".into(),
            query: Arc::from(query),
            param_types: vec![],
        };
        let wire: BytesMut = (&p).try_into().unwrap();
        Parse::parse(&wire).unwrap()
    }

    #[test]
    fn interning_is_stable_per_query_id() {
        let cache = PreparedStatementCache::new(8);
        let p = parse("SELECT 1");
        let id = p.query_id();

        let first = cache.get_or_insert(&p, id);
        let second = cache.get_or_insert(&p, id);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.name.starts_with(crate::messages::REWRITTEN_NAME_PREFIX));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = PreparedStatementCache::new(2);
        let a = parse("SELECT 1");
        let b = parse("SELECT 2");
        let c = parse("SELECT 3");

        cache.get_or_insert(&a, a.query_id());
        cache.get_or_insert(&b, b.query_id());
        // Touch `a` so `b` becomes the eviction victim.
        cache.promote(&a.query_id());
        cache.get_or_insert(&c, c.query_id());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.query_id()).is_some());
        assert!(cache.get(&b.query_id()).is_none());
        assert!(cache.get(&c.query_id()).is_some());
    }

    #[test]
    fn eviction_never_renames_a_statement() {
        let cache = PreparedStatementCache::new(1);
        let a = parse("SELECT 1");
        let b = parse("SELECT 2");

        let original = cache.get_or_insert(&a, a.query_id());
        // `a` is pushed out, then comes back.
        cache.get_or_insert(&b, b.query_id());
        assert!(cache.get(&a.query_id()).is_none());
        let reinterned = cache.get_or_insert(&a, a.query_id());

        assert_eq!(original.name, reinterned.name);
    }
}
