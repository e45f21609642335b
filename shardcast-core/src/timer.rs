//! ~1 Hz maintenance sweep: expire shard and statement waiters, recycle
//! invalidated statements nobody pins.

use log::{debug, warn};

use shardcast_proto::error::{CAS_ERROR_INDICATOR, CAS_ER_INTERNAL};

use crate::context::CtxHandle;
use crate::reactor::ProxyRuntime;
use crate::stmt::{StmtStatus, STMT_INVALID_HANDLE_ID};
use crate::INVALID_ID;

const TIMEOUT_MSG: &str = "proxy service temporarily unavailable";

pub fn sweep(rt: &mut ProxyRuntime, now: i64) {
    for shard_id in 0..rt.shards.shard_count() as i32 {
        for waiter in rt.shards.pop_expired_waiters(shard_id, now) {
            rt.stats.shard_waiter_delta(shard_id, -1);
            rt.stats.inc(&rt.stats.num_waiter_timeouts);
            expire_context(
                rt,
                CtxHandle {
                    cid: waiter.ctx_cid,
                    uid: waiter.ctx_uid,
                },
            );
        }
    }

    for waiter in rt.stmts.pop_expired_waiters(now) {
        rt.stats.stmt_waiter_delta(-1);
        rt.stats.inc(&rt.stats.num_waiter_timeouts);
        expire_context(
            rt,
            CtxHandle {
                cid: waiter.ctx_cid,
                uid: waiter.ctx_uid,
            },
        );
    }

    rt.stmts.recycle_invalid();
}

/// A parked context ran out of wait-timeout: drop its saved request, detach
/// it from whatever it was waiting on and flush the timeout error.
fn expire_context(rt: &mut ProxyRuntime, handle: CtxHandle) {
    let prepared = {
        let Some(ctx) = rt.contexts.get_mut(handle) else {
            return; // freed while parked, nothing to do
        };
        warn!("context waiter timed out. (cid:{}, uid:{})", handle.cid, handle.uid);
        ctx.waiting_event = None;
        ctx.waiting_dummy_prepare = false;
        ctx.is_prepare_for_execute = false;
        ctx.func_code = None;
        ctx.stmt_h_id = STMT_INVALID_HANDLE_ID;
        ctx.stmt_hint_type = crate::parser::HintType::None;
        if !ctx.is_in_tran {
            ctx.shard_id = INVALID_ID;
            ctx.cas_id = INVALID_ID;
        }
        ctx.prepared_stmt.take()
    };
    let default_timeout = rt.contexts.default_wait_timeout();
    if let Some(ctx) = rt.contexts.get_mut(handle) {
        ctx.wait_timeout = default_timeout;
    }

    if let Some(stmt_h) = prepared {
        let owned_in_progress = rt
            .stmts
            .get(stmt_h)
            .map(|s| s.status == StmtStatus::InProgress && s.owner() == handle)
            .unwrap_or(false);
        if owned_in_progress {
            debug!("freeing half-prepared statement. (stmt_h_id:{})", stmt_h);
            rt.wake_and_free_stmt(stmt_h);
        }
    }

    if let Some(ctx) = rt.contexts.get_mut(handle) {
        ctx.set_error_with_msg(CAS_ERROR_INDICATOR, CAS_ER_INTERNAL, TIMEOUT_MSG);
    }
    let _ = rt.send_error_to_client(handle);
    if let Some(ctx) = rt.contexts.get_mut(handle) {
        ctx.clear_error();
    }
}
