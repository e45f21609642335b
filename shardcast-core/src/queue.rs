//! Dispatch and wait queues.
//!
//! Dispatch queues are plain FIFOs drained by the handler once per tick.
//! Wait queues hold `(cid, uid, expire_time)` handles ordered by deadline;
//! stale handles are skipped at wakeup, not removed eagerly.

use std::collections::VecDeque;

use crate::event::ProxyEvent;

#[derive(Default)]
pub struct EventQueue {
    q: VecDeque<ProxyEvent>,
}

impl EventQueue {
    pub fn push(&mut self, event: ProxyEvent) {
        self.q.push_back(event);
    }

    pub fn pop(&mut self) -> Option<ProxyEvent> {
        self.q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

/// Deadline used when a waiter has no timeout.
pub const EXPIRE_NEVER: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitContext {
    pub ctx_cid: i32,
    pub ctx_uid: u32,
    pub expire_time: i64,
}

impl WaitContext {
    pub fn new(ctx_cid: i32, ctx_uid: u32, timeout_secs: i32, now: i64) -> Self {
        let expire_time = if timeout_secs <= 0 {
            EXPIRE_NEVER
        } else {
            now + timeout_secs as i64
        };
        Self {
            ctx_cid,
            ctx_uid,
            expire_time,
        }
    }
}

/// Ordered by `expire_time`, FIFO among equal deadlines.
#[derive(Default, Debug)]
pub struct WaitQueue {
    q: VecDeque<WaitContext>,
}

impl WaitQueue {
    pub fn ordered_insert(&mut self, waiter: WaitContext) {
        let at = self
            .q
            .partition_point(|w| w.expire_time <= waiter.expire_time);
        self.q.insert(at, waiter);
    }

    pub fn dequeue(&mut self) -> Option<WaitContext> {
        self.q.pop_front()
    }

    pub fn peek(&self) -> Option<&WaitContext> {
        self.q.front()
    }

    /// Pops every waiter whose deadline has passed.
    pub fn pop_expired(&mut self, now: i64) -> Vec<WaitContext> {
        let mut expired = Vec::new();
        while matches!(self.q.front(), Some(w) if w.expire_time < now) {
            expired.push(self.q.pop_front().unwrap());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn clear(&mut self) {
        self.q.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(cid: i32, expire: i64) -> WaitContext {
        WaitContext {
            ctx_cid: cid,
            ctx_uid: 1,
            expire_time: expire,
        }
    }

    #[test]
    fn ordered_by_deadline_fifo_on_ties() {
        let mut q = WaitQueue::default();
        q.ordered_insert(w(1, 100));
        q.ordered_insert(w(2, 50));
        q.ordered_insert(w(3, 100));
        q.ordered_insert(w(4, EXPIRE_NEVER));

        assert_eq!(q.dequeue().unwrap().ctx_cid, 2);
        assert_eq!(q.dequeue().unwrap().ctx_cid, 1);
        assert_eq!(q.dequeue().unwrap().ctx_cid, 3);
        assert_eq!(q.dequeue().unwrap().ctx_cid, 4);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn no_timeout_never_expires() {
        let mut q = WaitQueue::default();
        q.ordered_insert(WaitContext::new(1, 1, 0, 1000));
        q.ordered_insert(WaitContext::new(2, 1, 5, 1000));

        let expired = q.pop_expired(1006);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ctx_cid, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn deadline_boundary_is_exclusive() {
        let mut q = WaitQueue::default();
        q.ordered_insert(WaitContext::new(1, 1, 5, 1000));
        assert!(q.pop_expired(1005).is_empty());
        assert_eq!(q.pop_expired(1006).len(), 1);
    }
}
