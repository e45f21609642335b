//! CAS-side response handlers. Each receives the response event addressed
//! to the owning context and either relays it (after handle translation),
//! caches it, or re-drives a saved client request.

use log::{debug, warn};

use shardcast_proto::error::{self, CAS_ERROR_INDICATOR, CAS_ER_STMT_POOLING};
use shardcast_proto::version;
use shardcast_proto::{frame, reply};

use crate::context::CtxHandle;
use crate::event::ProxyEvent;
use crate::reactor::ProxyRuntime;
use crate::stmt::{StmtStatus, STMT_INVALID_HANDLE_ID};

/// Prepare replies differ only in column metadata past the server handle
/// and the result-cache lifetime.
const PREPARE_REPLY_META_AT: usize = frame::MSG_HEADER_SIZE + 4 + 4;

fn has_different_column_info(reply_a: &[u8], reply_b: &[u8]) -> bool {
    if reply_a.len() != reply_b.len() {
        return true;
    }
    if reply_a.len() <= PREPARE_REPLY_META_AT {
        return false;
    }
    reply_a[PREPARE_REPLY_META_AT..] != reply_b[PREPARE_REPLY_META_AT..]
}

impl ProxyRuntime {
    fn relay_to_client(&mut self, handle: CtxHandle, event: ProxyEvent) -> Result<(), ()> {
        self.send_to_client(handle, event.buffer.data)
    }

    /// Reads the error code of an error reply, normalized to the renewed
    /// numbering for internal comparisons.
    fn cas_error_code(msg: &[u8], error_ind: i32) -> i32 {
        let at = frame::MSG_HEADER_SIZE + 4;
        if msg.len() < at + 4 {
            return 0;
        }
        let code = i32::from_be_bytes([msg[at], msg[at + 1], msg[at + 2], msg[at + 3]]);
        error::code_from_client_wire(error_ind, code)
    }

    pub(crate) fn fn_cas_end_tran(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        ctx.dont_free_statement = false;
        if ctx.free_on_client_io_write {
            // the client asked for con-close; ack that instead of the relay
            if self
                .send_to_client(handle, reply::make_con_close_ok())
                .is_err()
            {
                self.set_free_flag(handle);
            }
            return;
        }
        if ctx.free_on_end_tran {
            debug!(
                "transaction aborted for a vanished client. (cid:{}, uid:{})",
                handle.cid, handle.uid
            );
            ctx.free_context = true;
            return;
        }
        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    pub(crate) fn fn_cas_prepare(&mut self, handle: CtxHandle, mut event: ProxyEvent) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            if ctx.is_client_in_tran {
                frame::set_con_status_in_tran(event.msg_mut());
            }
            // drop the retransmit copy unless it is a parked execute
            if ctx.waiting_event.is_some() && !ctx.is_prepare_for_execute {
                ctx.waiting_event = None;
            }
        }

        let result = frame::read_result_code(event.msg()).unwrap_or(-1);
        if result < 0 {
            let stmt_h = {
                let Some(ctx) = self.contexts.get_mut(handle) else {
                    return;
                };
                ctx.is_prepare_for_execute = false;
                ctx.waiting_event = None;
                ctx.prepared_stmt.take()
            };
            debug!(
                "cas prepare error. (error_ind:{}, cid:{})",
                result, handle.cid
            );
            if self.relay_to_client(handle, event).is_err() {
                self.set_free_flag(handle);
                return;
            }
            if let Some(stmt_h) = stmt_h {
                let in_progress = self
                    .stmts
                    .get(stmt_h)
                    .map(|s| s.status == StmtStatus::InProgress)
                    .unwrap_or(false);
                if in_progress {
                    self.wake_and_free_stmt(stmt_h);
                }
            }
            return;
        }

        let Some(stmt_h) = self.contexts.get(handle).and_then(|c| c.prepared_stmt) else {
            warn!("cas prepare reply without a statement. (cid:{})", handle.cid);
            self.set_free_flag(handle);
            return;
        };

        // first reply is cached; later dummy-prepare replies must agree on
        // column metadata
        let reply_is_cached = match self.stmts.get(stmt_h) {
            Some(stmt) => !stmt.reply_buffer.is_empty(),
            None => {
                self.set_free_flag(handle);
                return;
            }
        };
        if !reply_is_cached {
            let mut cached = event.msg().to_vec();
            frame::write_result_code(&mut cached, stmt_h);
            if let Some(stmt) = self.stmts.get_mut(stmt_h) {
                stmt.reply_buffer = cached;
            }
        } else {
            let different = self
                .stmts
                .get(stmt_h)
                .map(|s| has_different_column_info(event.msg(), &s.reply_buffer))
                .unwrap_or(true);
            if different {
                debug!(
                    "column metadata diverged, invalidating statement. (stmt_h_id:{})",
                    stmt_h
                );
                {
                    let Some(ctx) = self.contexts.get_mut(handle) else {
                        return;
                    };
                    ctx.is_prepare_for_execute = false;
                    ctx.waiting_event = None;
                    ctx.prepared_stmt = None;
                }
                self.stmts.invalidate(stmt_h);
                let (client_version, in_tran, renewed) = self.reply_error_shape(handle);
                let code = error::code_for_client(
                    CAS_ERROR_INDICATOR,
                    CAS_ER_STMT_POOLING,
                    client_version,
                    renewed,
                );
                let msg = reply::make_error_reply(
                    client_version,
                    CAS_ERROR_INDICATOR,
                    code,
                    "",
                    in_tran,
                );
                if self.send_to_client(handle, msg).is_err() {
                    self.set_free_flag(handle);
                }
                return;
            }
        }

        let (shard_id, cas_id) = match self.contexts.get(handle) {
            Some(ctx) => (ctx.shard_id, ctx.cas_id),
            None => return,
        };
        let srv_h_id = result;
        match self.stmts.add_srv_h_id(stmt_h, shard_id, cas_id, srv_h_id) {
            Ok(waiters) => self.wake_stmt_waiters(waiters),
            Err(()) => {
                self.set_free_flag(handle);
                return;
            }
        }

        let is_prepare_for_execute = self
            .contexts
            .get(handle)
            .map(|c| c.is_prepare_for_execute)
            .unwrap_or(false);
        if is_prepare_for_execute {
            // replay the execute that triggered the dummy prepare
            let waiting = {
                let Some(ctx) = self.contexts.get_mut(handle) else {
                    return;
                };
                ctx.prepared_stmt = None;
                ctx.is_prepare_for_execute = false;
                ctx.waiting_event.take()
            };
            let Some(waiting) = waiting else {
                self.set_free_flag(handle);
                return;
            };
            self.cli_ret_q.push(*waiting);
            return;
        }

        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            // keep the statement pinned through the implicit commit of the
            // dummy prepare
            ctx.dont_free_statement = true;
            ctx.prepared_stmt = None;
        }
        frame::write_result_code(event.msg_mut(), stmt_h);
        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    pub(crate) fn fn_cas_execute(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let (stmt_h, hint_type) = {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.waiting_event = None;
            if !ctx.is_cas_in_tran {
                ctx.is_client_in_tran = false;
            }
            let out = (ctx.stmt_h_id, ctx.stmt_hint_type);
            ctx.stmt_h_id = STMT_INVALID_HANDLE_ID;
            ctx.stmt_hint_type = crate::parser::HintType::None;
            out
        };

        let result = frame::read_result_code(event.msg()).unwrap_or(0);
        if result < 0 {
            let code = Self::cas_error_code(event.msg(), result);
            debug!(
                "cas execute error. (error_ind:{}, error_code:{}, cid:{})",
                result, code, handle.cid
            );
            let (shard_id, cas_id) = self
                .contexts
                .get(handle)
                .map(|c| (c.shard_id, c.cas_id))
                .unwrap_or((-1, -1));
            if stmt_h != STMT_INVALID_HANDLE_ID {
                self.stmts.del_srv_h_id(stmt_h, shard_id, cas_id);
                let client_version = self.client_version_of(handle);
                let old_driver = client_version < version::make_ver(8, 3, 0);
                let invalid = code == CAS_ER_STMT_POOLING
                    && (result == CAS_ERROR_INDICATOR || old_driver);
                if invalid {
                    self.stmts.invalidate(stmt_h);
                }
            }
        }

        match hint_type {
            crate::parser::HintType::Key | crate::parser::HintType::Val => {
                self.stats.inc(&self.stats.num_hint_key_queries)
            }
            crate::parser::HintType::Id => self.stats.inc(&self.stats.num_hint_id_queries),
            crate::parser::HintType::None => self.stats.inc(&self.stats.num_hint_none_queries),
        }

        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    pub(crate) fn fn_cas_fetch(&mut self, handle: CtxHandle, event: ProxyEvent) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            if !ctx.is_cas_in_tran {
                ctx.is_client_in_tran = false;
            }
        }
        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    /// Schema-info and prepare-and-execute replies both bind a fresh server
    /// handle to a per-context statement, then relay with the external id.
    fn cas_bind_and_relay(&mut self, handle: CtxHandle, mut event: ProxyEvent) {
        let stmt_h = {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.waiting_event = None;
            ctx.prepared_stmt.take()
        };

        let result = frame::read_result_code(event.msg()).unwrap_or(-1);
        if result < 0 {
            if self.relay_to_client(handle, event).is_err() {
                self.set_free_flag(handle);
                return;
            }
            if let Some(stmt_h) = stmt_h {
                let in_progress = self
                    .stmts
                    .get(stmt_h)
                    .map(|s| s.status == StmtStatus::InProgress)
                    .unwrap_or(false);
                if in_progress {
                    self.wake_and_free_stmt(stmt_h);
                }
            }
            return;
        }

        let Some(stmt_h) = stmt_h else {
            warn!("cas reply without a statement. (cid:{})", handle.cid);
            self.set_free_flag(handle);
            return;
        };
        let (shard_id, cas_id) = match self.contexts.get(handle) {
            Some(ctx) => (ctx.shard_id, ctx.cas_id),
            None => return,
        };
        if self
            .stmts
            .add_srv_h_id(stmt_h, shard_id, cas_id, result)
            .is_err()
        {
            self.set_free_flag(handle);
            return;
        }
        frame::write_result_code(event.msg_mut(), stmt_h);
        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    pub(crate) fn fn_cas_schema_info(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.cas_bind_and_relay(handle, event);
    }

    pub(crate) fn fn_cas_prepare_and_execute(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.cas_bind_and_relay(handle, event);
    }

    /// Backend liveness probe issued at connect. Success turns into the
    /// driver's dbinfo acknowledgement; failure dooms the connection after
    /// the error reaches the client.
    pub(crate) fn fn_cas_check_cas(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let is_client_in_tran = {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.waiting_event = None;
            ctx.is_client_in_tran
        };

        if event.msg().len() > frame::MSG_HEADER_SIZE {
            // an error body; relay and let the write-complete path close
            debug!("backend rejected connection. (cid:{})", handle.cid);
            if self.relay_to_client(handle, event).is_err() {
                self.set_free_flag(handle);
                return;
            }
            if let Some(ctx) = self.contexts.get_mut(handle) {
                ctx.free_on_client_io_write = true;
            }
            return;
        }

        let mut msg = reply::make_dbinfo_ok();
        if is_client_in_tran {
            frame::set_con_status_in_tran(&mut msg);
        }
        if self.send_to_client(handle, msg).is_err() {
            self.set_free_flag(handle);
            return;
        }
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.is_connected = true;
        }
    }

    pub(crate) fn fn_cas_relay_only(&mut self, handle: CtxHandle, event: ProxyEvent) {
        if self.relay_to_client(handle, event).is_err() {
            self.set_free_flag(handle);
        }
    }

    fn set_free_flag(&mut self, handle: CtxHandle) {
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.free_context = true;
        }
    }

    fn reply_error_shape(&self, handle: CtxHandle) -> (version::BrokerVersion, bool, bool) {
        let in_tran = self
            .contexts
            .get(handle)
            .map(|c| c.is_client_in_tran)
            .unwrap_or(false);
        let (client_version, renewed) = self
            .contexts
            .get(handle)
            .and_then(|c| self.clients.get(c.client_id))
            .map(|c| (c.client_version(), c.renewed_error_capability()))
            .unwrap_or((version::proto_ver(version::CURRENT_PROTOCOL), true));
        (client_version, in_tran, renewed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_info_comparison_ignores_handle_and_lifetime() {
        let mut a = vec![0u8; PREPARE_REPLY_META_AT + 4];
        let mut b = a.clone();
        // differing server handle: same metadata
        a[frame::MSG_HEADER_SIZE] = 9;
        b[frame::MSG_HEADER_SIZE] = 7;
        assert!(!has_different_column_info(&a, &b));

        // differing metadata byte
        b[PREPARE_REPLY_META_AT + 1] = 0xFF;
        assert!(has_different_column_info(&a, &b));

        // differing length
        let c = vec![0u8; PREPARE_REPLY_META_AT + 8];
        assert!(has_different_column_info(&a, &c));
    }
}
