//! Per-pool statistics.
//!
//! `current` is updated online. Each `stats_period` the janitor calls
//! [`PoolStats::rotate`]:
//!
//! ```text
//! older = newer;
//! newer = current;
//! current = zeroed;
//! ```
//!
//! so `newer` always holds the last complete period, which SHOW STATS
//! uses for the per-second averages. Lifetime totals accumulate
//! separately and survive rotation.

use parking_lot::Mutex;

/// One bucket of counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatCounters {
    pub server_assignment_count: u64,
    pub xact_count: u64,
    pub query_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Microsecond totals.
    pub xact_time: u64,
    pub query_time: u64,
    pub wait_time: u64,

    pub ps_client_parse_count: u64,
    pub ps_server_parse_count: u64,
    pub ps_bind_count: u64,
}

impl StatCounters {
    fn add(&mut self, other: &StatCounters) {
        self.server_assignment_count += other.server_assignment_count;
        self.xact_count += other.xact_count;
        self.query_count += other.query_count;
        self.bytes_received += other.bytes_received;
        self.bytes_sent += other.bytes_sent;
        self.xact_time += other.xact_time;
        self.query_time += other.query_time;
        self.wait_time += other.wait_time;
        self.ps_client_parse_count += other.ps_client_parse_count;
        self.ps_server_parse_count += other.ps_server_parse_count;
        self.ps_bind_count += other.ps_bind_count;
    }
}

#[derive(Debug, Default)]
struct Buckets {
    current: StatCounters,
    newer: StatCounters,
    older: StatCounters,
    totals: StatCounters,
}

/// Statistics for one pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    buckets: Mutex<Buckets>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a delta to the online bucket and the lifetime totals.
    pub fn record(&self, delta: &StatCounters) {
        let mut buckets = self.buckets.lock();
        buckets.current.add(delta);
        buckets.totals.add(delta);
    }

    pub fn server_assignment(&self) {
        self.record(&StatCounters {
            server_assignment_count: 1,
            ..Default::default()
        });
    }

    pub fn xact(&self, xact_time_us: u64) {
        self.record(&StatCounters {
            xact_count: 1,
            xact_time: xact_time_us,
            ..Default::default()
        });
    }

    pub fn query(&self, query_time_us: u64) {
        self.record(&StatCounters {
            query_count: 1,
            query_time: query_time_us,
            ..Default::default()
        });
    }

    pub fn wait(&self, wait_time_us: u64) {
        self.record(&StatCounters {
            wait_time: wait_time_us,
            ..Default::default()
        });
    }

    pub fn client_parse(&self) {
        self.record(&StatCounters {
            ps_client_parse_count: 1,
            ..Default::default()
        });
    }

    pub fn server_parse(&self) {
        self.record(&StatCounters {
            ps_server_parse_count: 1,
            ..Default::default()
        });
    }

    pub fn bind(&self) {
        self.record(&StatCounters {
            ps_bind_count: 1,
            ..Default::default()
        });
    }

    pub fn transfer(&self, received: u64, sent: u64) {
        self.record(&StatCounters {
            bytes_received: received,
            bytes_sent: sent,
            ..Default::default()
        });
    }

    /// Advance the period buckets. Called by the janitor once per
    /// `stats_period`.
    pub fn rotate(&self) {
        let mut buckets = self.buckets.lock();
        buckets.older = buckets.newer;
        buckets.newer = buckets.current;
        buckets.current = StatCounters::default();
    }

    pub fn totals(&self) -> StatCounters {
        self.buckets.lock().totals
    }

    /// The last complete period, for per-second averages.
    pub fn last_period(&self) -> StatCounters {
        self.buckets.lock().newer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_buckets() {
        let stats = PoolStats::new();
        stats.query(1_000);
        stats.query(3_000);

        assert_eq!(stats.last_period(), StatCounters::default());

        stats.rotate();
        let period = stats.last_period();
        assert_eq!(period.query_count, 2);
        assert_eq!(period.query_time, 4_000);

        stats.rotate();
        assert_eq!(stats.last_period(), StatCounters::default());

        // Totals survive rotation.
        assert_eq!(stats.totals().query_count, 2);
    }

    #[test]
    fn record_accumulates_all_fields() {
        let stats = PoolStats::new();
        stats.server_assignment();
        stats.xact(10);
        stats.wait(7);
        stats.client_parse();
        stats.server_parse();
        stats.bind();
        stats.transfer(100, 200);

        let totals = stats.totals();
        assert_eq!(totals.server_assignment_count, 1);
        assert_eq!(totals.xact_count, 1);
        assert_eq!(totals.xact_time, 10);
        assert_eq!(totals.wait_time, 7);
        assert_eq!(totals.ps_client_parse_count, 1);
        assert_eq!(totals.ps_server_parse_count, 1);
        assert_eq!(totals.ps_bind_count, 1);
        assert_eq!(totals.bytes_received, 100);
        assert_eq!(totals.bytes_sent, 200);
    }
}
