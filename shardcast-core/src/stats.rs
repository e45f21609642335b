//! Process-local counters. Admin tooling scrapes these out-of-band, so they
//! are relaxed atomics: the reactor writes without coordination and readers
//! tolerate transient inconsistency.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct ShardStat {
    pub requests: AtomicU64,
    pub waiter_count: AtomicI64,
}

pub struct ProxyStats {
    pub cur_clients: AtomicI64,
    pub num_request_stmt: AtomicU64,
    pub num_request_stmt_in_pool: AtomicU64,
    pub num_hint_key_queries: AtomicU64,
    pub num_hint_id_queries: AtomicU64,
    pub num_hint_none_queries: AtomicU64,
    pub stmt_waiter_count: AtomicI64,
    pub num_proxy_errors: AtomicU64,
    pub num_waiter_timeouts: AtomicU64,
    pub shards: Vec<ShardStat>,
}

impl ProxyStats {
    pub fn new(shard_count: usize) -> Self {
        Self {
            cur_clients: AtomicI64::new(0),
            num_request_stmt: AtomicU64::new(0),
            num_request_stmt_in_pool: AtomicU64::new(0),
            num_hint_key_queries: AtomicU64::new(0),
            num_hint_id_queries: AtomicU64::new(0),
            num_hint_none_queries: AtomicU64::new(0),
            stmt_waiter_count: AtomicI64::new(0),
            num_proxy_errors: AtomicU64::new(0),
            num_waiter_timeouts: AtomicU64::new(0),
            shards: (0..shard_count).map(|_| ShardStat::default()).collect(),
        }
    }

    pub fn shard_request(&self, shard_id: i32) {
        if let Some(stat) = self.shards.get(shard_id as usize) {
            stat.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn shard_waiter_delta(&self, shard_id: i32, delta: i64) {
        if let Some(stat) = self.shards.get(shard_id as usize) {
            stat.waiter_count.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn stmt_waiter_delta(&self, delta: i64) {
        self.stmt_waiter_count.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn client_delta(&self, delta: i64) {
        self.cur_clients.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_go_both_ways() {
        let stats = ProxyStats::new(2);
        stats.shard_waiter_delta(1, 1);
        stats.shard_waiter_delta(1, -1);
        assert_eq!(stats.shards[1].waiter_count.load(Ordering::Relaxed), 0);

        stats.shard_request(0);
        stats.shard_request(7); // out of range, ignored
        assert_eq!(stats.shards[0].requests.load(Ordering::Relaxed), 1);
    }
}
