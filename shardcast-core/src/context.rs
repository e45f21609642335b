//! Per-client-connection contexts.
//!
//! A context is owned by exactly one client connection for its lifetime and
//! carries the request state machine between reactor ticks. Slots are
//! addressed by `(cid, uid)`: the uid is bumped on every allocation (never
//! zero), so a holder of a recycled handle sees a mismatch and is rejected.

use std::collections::VecDeque;

use log::debug;

use shardcast_proto::func::FuncCode;
use shardcast_proto::error::CAS_NO_ERROR;

use crate::event::ProxyEvent;
use crate::INVALID_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxHandle {
    pub cid: i32,
    pub uid: u32,
}

#[derive(Debug)]
pub struct Context {
    pub cid: i32,
    pub uid: u32,

    pub is_busy: bool,
    pub is_in_tran: bool,
    pub is_prepare_for_execute: bool,
    pub free_on_end_tran: bool,
    pub free_on_client_io_write: bool,
    pub free_context: bool,
    /// Faked transaction status reported to the client while a check-cas is
    /// outstanding; the CAS itself may already be out of tran.
    pub is_client_in_tran: bool,
    pub is_cas_in_tran: bool,
    pub waiting_dummy_prepare: bool,
    pub dont_free_statement: bool,

    pub waiting_event: Option<Box<ProxyEvent>>,
    pub func_code: Option<FuncCode>,
    pub stmt_h_id: i32,
    pub stmt_hint_type: crate::parser::HintType,
    pub prepared_stmt: Option<i32>,
    pub wait_timeout: i32,

    pub is_connected: bool,
    pub database_user: String,
    pub database_passwd: String,

    /// Statement handles this context has pinned.
    pub stmt_list: Vec<i32>,

    pub client_id: i32,
    pub shard_id: i32,
    pub cas_id: i32,

    pub error_ind: i32,
    pub error_code: i32,
    pub error_msg: String,
}

impl Context {
    fn empty(cid: i32) -> Self {
        Self {
            cid,
            uid: 0,
            is_busy: false,
            is_in_tran: false,
            is_prepare_for_execute: false,
            free_on_end_tran: false,
            free_on_client_io_write: false,
            free_context: false,
            is_client_in_tran: false,
            is_cas_in_tran: false,
            waiting_dummy_prepare: false,
            dont_free_statement: false,
            waiting_event: None,
            func_code: None,
            stmt_h_id: INVALID_ID,
            stmt_hint_type: crate::parser::HintType::None,
            prepared_stmt: None,
            wait_timeout: 0,
            is_connected: false,
            database_user: String::new(),
            database_passwd: String::new(),
            stmt_list: Vec::new(),
            client_id: INVALID_ID,
            shard_id: INVALID_ID,
            cas_id: INVALID_ID,
            error_ind: CAS_NO_ERROR,
            error_code: CAS_NO_ERROR,
            error_msg: String::new(),
        }
    }

    fn clear(&mut self) {
        let cid = self.cid;
        *self = Context::empty(cid);
    }

    pub fn handle(&self) -> CtxHandle {
        CtxHandle {
            cid: self.cid,
            uid: self.uid,
        }
    }

    pub fn set_in_tran(&mut self, shard_id: i32, cas_id: i32) {
        debug_assert!(shard_id >= 0 && cas_id >= 0);
        self.is_in_tran = true;
        self.shard_id = shard_id;
        self.cas_id = cas_id;
        self.dont_free_statement = false;
    }

    pub fn set_out_tran(&mut self) {
        self.is_in_tran = false;
        self.shard_id = INVALID_ID;
        self.cas_id = INVALID_ID;
    }

    pub fn set_error(&mut self, error_ind: i32, error_code: i32) {
        self.set_error_with_msg(error_ind, error_code, "");
    }

    /// `error_msg` is stored verbatim; it is never interpreted as a format
    /// string anywhere downstream.
    pub fn set_error_with_msg(&mut self, error_ind: i32, error_code: i32, error_msg: &str) {
        if self.error_ind != CAS_NO_ERROR {
            // keep the first error of the request
            return;
        }
        self.error_ind = error_ind;
        self.error_code = error_code;
        self.error_msg = error_msg.to_string();
    }

    pub fn clear_error(&mut self) {
        self.error_ind = CAS_NO_ERROR;
        self.error_code = CAS_NO_ERROR;
        self.error_msg.clear();
    }

    pub fn has_error(&self) -> bool {
        self.error_ind != CAS_NO_ERROR
    }

    pub fn has_stmt(&self, stmt_h_id: i32) -> bool {
        self.stmt_list.contains(&stmt_h_id)
    }

    /// Records a pinned statement handle. Returns false when already held
    /// (the caller must not pin twice).
    pub fn add_stmt(&mut self, stmt_h_id: i32) -> bool {
        if self.has_stmt(stmt_h_id) {
            return false;
        }
        self.stmt_list.push(stmt_h_id);
        true
    }

    pub fn take_stmt_list(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.stmt_list)
    }
}

pub struct ContextPool {
    ents: Vec<Context>,
    freeq: VecDeque<usize>,
    next_uid: u32,
    wait_timeout_default: i32,
}

impl ContextPool {
    pub fn new(size: usize, wait_timeout_default: i32) -> Self {
        Self {
            ents: (0..size).map(|i| Context::empty(i as i32)).collect(),
            freeq: (0..size).collect(),
            next_uid: 0,
            wait_timeout_default,
        }
    }

    pub fn default_wait_timeout(&self) -> i32 {
        self.wait_timeout_default
    }

    /// Allocates a fresh context. The uid is bumped and never zero.
    pub fn alloc(&mut self) -> Option<CtxHandle> {
        let slot = self.freeq.pop_front()?;
        self.next_uid = self.next_uid.wrapping_add(1);
        if self.next_uid == 0 {
            self.next_uid = 1;
        }
        let ctx = &mut self.ents[slot];
        debug_assert!(!ctx.is_busy);
        ctx.clear();
        ctx.uid = self.next_uid;
        ctx.is_busy = true;
        ctx.wait_timeout = self.wait_timeout_default;
        debug!("new context created. (cid:{}, uid:{})", ctx.cid, ctx.uid);
        Some(ctx.handle())
    }

    pub fn get(&self, handle: CtxHandle) -> Option<&Context> {
        let ctx = self.ents.get(handle.cid as usize)?;
        (ctx.is_busy && ctx.uid == handle.uid).then_some(ctx)
    }

    pub fn get_mut(&mut self, handle: CtxHandle) -> Option<&mut Context> {
        let ctx = self.ents.get_mut(handle.cid as usize)?;
        (ctx.is_busy && ctx.uid == handle.uid).then_some(ctx)
    }

    /// Returns the slot to the free queue. The caller has already released
    /// the context's CAS, client slot and statement pins.
    pub fn release(&mut self, handle: CtxHandle) {
        if let Some(ctx) = self.get_mut(handle) {
            ctx.clear();
            self.freeq.push_back(handle.cid as usize);
        }
    }

    /// Handles of every live context, for sweeps and shutdown.
    pub fn busy_handles(&self) -> Vec<CtxHandle> {
        self.ents
            .iter()
            .filter(|c| c.is_busy)
            .map(|c| c.handle())
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.ents.iter().filter(|c| c.is_busy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected() {
        let mut pool = ContextPool::new(2, 30);
        let first = pool.alloc().unwrap();
        pool.release(first);
        let second = pool.alloc().unwrap();
        // same slot, new generation
        assert_eq!(second.cid, first.cid);
        assert_ne!(second.uid, first.uid);
        assert!(pool.get(first).is_none());
        assert!(pool.get(second).is_some());
    }

    #[test]
    fn pool_exhaustion_and_reuse() {
        let mut pool = ContextPool::new(1, 30);
        let h = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.release(h);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn uid_skips_zero() {
        let mut pool = ContextPool::new(1, 30);
        pool.next_uid = u32::MAX;
        let h = pool.alloc().unwrap();
        assert_eq!(h.uid, 1);
    }

    #[test]
    fn in_tran_transitions() {
        let mut pool = ContextPool::new(1, 30);
        let h = pool.alloc().unwrap();
        let ctx = pool.get_mut(h).unwrap();
        ctx.set_in_tran(1, 3);
        assert!(ctx.is_in_tran);
        assert_eq!((ctx.shard_id, ctx.cas_id), (1, 3));
        ctx.set_out_tran();
        assert!(!ctx.is_in_tran);
        assert_eq!(ctx.shard_id, INVALID_ID);
    }

    #[test]
    fn first_error_wins() {
        let mut pool = ContextPool::new(1, 30);
        let h = pool.alloc().unwrap();
        let ctx = pool.get_mut(h).unwrap();
        ctx.set_error_with_msg(-1, -10001, "first");
        ctx.set_error_with_msg(-1, -10004, "second");
        assert_eq!(ctx.error_code, -10001);
        assert_eq!(ctx.error_msg, "first");
    }
}
