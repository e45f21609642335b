//! Client-side request handlers, one per function code.
//!
//! A handler consumes its event: it forwards it to a CAS, answers locally,
//! parks it on a wait queue via `ctx.waiting_event`, or drops it after
//! recording an error. Fatal conditions set `ctx.free_context`; the
//! dispatcher destroys the context afterwards.

use log::{debug, warn};

use shardcast_proto::error::{
    CAS_ERROR_INDICATOR, CAS_ER_ARGS, CAS_ER_INTERNAL, CAS_ER_NOT_IMPLEMENTED, CAS_ER_SRV_HANDLE,
    CAS_ER_STMT_POOLING,
};
use shardcast_proto::func::FuncCode;
use shardcast_proto::version::{self, PROTOCOL_V1, PROTOCOL_V2};
use shardcast_proto::{frame, reply};

use crate::cas_io::{AllocRequest, CasAllocOutcome};
use crate::context::CtxHandle;
use crate::event::{EventKind, IoBuffer, ProxyEvent, FROM_CAS};
use crate::parser;
use crate::queue::WaitContext;
use crate::reactor::ProxyRuntime;
use crate::stmt::{StmtStatus, StmtType, STMT_INVALID_HANDLE_ID};
use crate::{now_secs, INVALID_ID};

/// Byte offset of the `argv[0]` payload (the server handle) in a request.
const REQUEST_HANDLE_AT: usize = frame::MSG_HEADER_SIZE + 1 + 4;

fn rewrite_request_handle(msg: &mut [u8], srv_h_id: i32) {
    if msg.len() >= REQUEST_HANDLE_AT + 4 {
        msg[REQUEST_HANDLE_AT..REQUEST_HANDLE_AT + 4].copy_from_slice(&srv_h_id.to_be_bytes());
    }
}

/// Query timeouts arrive in milliseconds; waiters tick in seconds. Combine
/// with the configured wait-timeout by `min` when both are set, else by sum.
fn combined_wait_timeout(configured: i32, query_timeout_ms: i32) -> i32 {
    let query_secs = (query_timeout_ms + 999) / 1000;
    if configured > 0 && query_secs > 0 {
        configured.min(query_secs)
    } else {
        configured + query_secs
    }
}

impl ProxyRuntime {
    fn set_ctx_error(&mut self, handle: CtxHandle, error_ind: i32, error_code: i32) {
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.set_error(error_ind, error_code);
        }
    }

    fn set_free(&mut self, handle: CtxHandle) {
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.free_context = true;
        }
    }

    /// Pins a statement to the context unless it already holds it.
    fn pin_to_ctx(&mut self, handle: CtxHandle, stmt_h: i32) {
        let added = match self.contexts.get_mut(handle) {
            Some(ctx) => ctx.add_stmt(stmt_h),
            None => false,
        };
        if added {
            let _ = self.stmts.pin(stmt_h);
        }
    }

    /// Wakes and frees a statement whose prepare will not complete.
    pub(crate) fn wake_and_free_stmt(&mut self, stmt_h: i32) {
        let waiters = self.stmts.abandon(stmt_h);
        self.wake_stmt_waiters(waiters);
        self.stmts.free(stmt_h);
    }

    /// Hands the event to a CAS write slot and records the pending function
    /// code. With `save_retry`, a copy is parked first so a CAS disconnect
    /// before the reply can retransmit.
    fn forward_to_cas(
        &mut self,
        handle: CtxHandle,
        shard_id: i32,
        cas_id: i32,
        code: FuncCode,
        event: ProxyEvent,
        save_retry: bool,
    ) -> Result<(), ()> {
        if save_retry {
            let copy = event.clone();
            if let Some(ctx) = self.contexts.get_mut(handle) {
                ctx.waiting_event = Some(Box::new(copy));
            }
        }
        self.send_to_cas(shard_id, cas_id, event)?;
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.func_code = Some(code);
        }
        Ok(())
    }

    /// Allocates a CAS for this context per the allocator policy, applying
    /// the side effects (in-tran binding, credential invalidation, waiter
    /// stats).
    fn alloc_cas_for(&mut self, handle: CtxHandle, func_code: FuncCode) -> CasAllocOutcome {
        let Some(ctx) = self.contexts.get(handle) else {
            return CasAllocOutcome::Fatal;
        };
        let shard_id = ctx.shard_id;
        let cas_id = if ctx.is_in_tran { ctx.cas_id } else { INVALID_ID };
        let timeout = ctx.wait_timeout;
        let db_user = ctx.database_user.clone();
        let db_passwd = ctx.database_passwd.clone();
        let request = AllocRequest {
            shard_id,
            cas_id,
            ctx: handle,
            timeout,
            func_code,
            db_user: &db_user,
            db_passwd: &db_passwd,
            case_sensitive_users: self.config.appl_server.case_sensitive_users(),
            now: now_secs(),
        };
        let outcome = self.shards.alloc_by_ctx(&request);
        match outcome {
            CasAllocOutcome::Assigned {
                shard_id,
                cas_id,
                credentials_changed,
            } => {
                if credentials_changed {
                    self.stmts.reset_srv_h_ids_for_cas(shard_id, cas_id);
                }
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.set_in_tran(shard_id, cas_id);
                }
            }
            CasAllocOutcome::Wait { shard_id } => {
                self.stats.shard_waiter_delta(shard_id, 1);
            }
            CasAllocOutcome::Fatal => {}
        }
        outcome
    }

    /// Resolves the shard every hint of the statement agrees on.
    /// `binds` provides the execute-time bind arguments for dynamic hints;
    /// without them dynamic hints are skipped (prepare time).
    /// `Ok(INVALID_ID)` means no hint constrained the choice.
    fn resolve_shard_for_stmt(
        &self,
        stmt_h: i32,
        binds: Option<(&[Vec<u8>], usize)>,
    ) -> Result<i32, ()> {
        let stmt = self.stmts.get(stmt_h).ok_or(())?;
        let mut shard = INVALID_ID;
        for hint in &stmt.hints {
            let resolved = match (hint.bind_type, hint.hint_type) {
                (parser::BindType::Static, parser::HintType::Id) => {
                    let id = hint.value.parse::<i32>().map_err(|_| ())?;
                    if !(0..self.shards.shard_count() as i32).contains(&id) {
                        return Err(());
                    }
                    id
                }
                (parser::BindType::Static, _) => self
                    .routers
                    .primary()
                    .shard_for_text(&hint.value)
                    .ok_or(())?,
                (parser::BindType::Dynamic, _) => {
                    let Some((args, base)) = binds else {
                        continue;
                    };
                    let value_at = base + hint.bind_position * 2 + 1;
                    let arg = args.get(value_at).ok_or(())?;
                    self.routers.primary().shard_for_bind(arg).ok_or(())?
                }
            };
            if shard != INVALID_ID && shard != resolved {
                debug!(
                    "hints resolve to different shards. (first:{}, next:{})",
                    shard, resolved
                );
                return Err(());
            }
            shard = resolved;
        }
        Ok(shard)
    }

    /// Serves a cached prepare reply: clone, patch the statement handle,
    /// reflect the transaction status.
    fn send_cached_prepare_reply(&mut self, handle: CtxHandle, stmt_h: i32) -> Result<(), ()> {
        let Some(stmt) = self.stmts.get(stmt_h) else {
            return Err(());
        };
        let mut msg = stmt.reply_buffer.clone();
        if msg.len() < frame::MSG_HEADER_SIZE + 4 {
            return Err(());
        }
        frame::write_result_code(&mut msg, stmt_h);
        // mirror the status the first prepare reported to its client
        let in_tran = self
            .contexts
            .get(handle)
            .map(|c| c.is_client_in_tran)
            .unwrap_or(false);
        if in_tran {
            frame::set_con_status_in_tran(&mut msg);
        } else {
            frame::set_con_status_out_tran(&mut msg);
        }
        self.send_to_client(handle, msg)
    }

    pub(crate) fn fn_client_end_tran(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        ctx.is_client_in_tran = false;
        let in_tran = ctx.is_in_tran;
        let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
        if in_tran {
            if self
                .forward_to_cas(handle, shard_id, cas_id, FuncCode::EndTran, event, false)
                .is_err()
            {
                self.set_free(handle);
                return;
            }
        } else if self.send_to_client(handle, reply::make_end_tran_ok()).is_err() {
            self.set_free(handle);
            return;
        }
        self.free_ctx_stmt_list(handle);
    }

    pub(crate) fn fn_client_prepare(&mut self, handle: CtxHandle, mut event: ProxyEvent) {
        let is_prepare_for_execute;
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.is_client_in_tran = true;
            if ctx.waiting_event.is_some() {
                warn!("prepare while another request is parked. (cid:{})", handle.cid);
                ctx.waiting_event = None;
                ctx.free_context = true;
                return;
            }
            is_prepare_for_execute = ctx.is_prepare_for_execute;
        }

        let parsed_args = frame::split_argv(event.msg()).ok().and_then(|argv| {
            if argv.len() < 2 {
                return None;
            }
            let sql = frame::arg_as_str(argv[0]).ok()?.to_string();
            let rest: Vec<Vec<u8>> = argv[1..].iter().map(|a| a.to_vec()).collect();
            Some((sql, rest))
        });
        let Some((sql, rest_args)) = parsed_args else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        };

        let Ok(mut parsed) = parser::parse(&sql) else {
            warn!("failed to scan sql hints. (cid:{})", handle.cid);
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        };
        let organized =
            match parser::rewrite_to_shard_id(&parsed, |v| self.routers.primary().shard_for_text(v))
            {
                Some(s) => s,
                None => {
                    self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                    return;
                }
            };
        if organized != sql {
            debug!("rewrote sql statement. (sql:[{}])", organized);
            match parser::parse(&organized) {
                Ok(p) => parsed = p,
                Err(_) => {
                    self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
                    return;
                }
            }
        }

        if !is_prepare_for_execute {
            self.stats.inc(&self.stats.num_request_stmt);
        }
        let bucket = version::protocol_bucket(self.client_version_of(handle));
        let db_user = self
            .contexts
            .get(handle)
            .map(|c| c.database_user.clone())
            .unwrap_or_default();

        let mut use_temp_statement = false;
        let mut relay_stmt: Option<i32> = None;
        if let Some(found) = self.stmts.find_by_sql(&organized, &db_user, bucket) {
            if !is_prepare_for_execute {
                self.stats.inc(&self.stats.num_request_stmt_in_pool);
            }
            let status = self.stmts.get(found).map(|s| s.status);
            match status {
                Some(StmtStatus::Complete) => {
                    let already_held = self
                        .contexts
                        .get(handle)
                        .map(|c| c.has_stmt(found))
                        .unwrap_or(false);
                    if already_held {
                        // preparing the same text twice in one transaction
                        // must yield a distinct handle
                        use_temp_statement = true;
                    } else {
                        if self.send_cached_prepare_reply(handle, found).is_err() {
                            self.set_free(handle);
                            return;
                        }
                        self.pin_to_ctx(handle, found);
                        return;
                    }
                }
                Some(StmtStatus::InProgress) => {
                    let owner = self.stmts.get(found).map(|s| s.owner());
                    if owner == Some(handle) {
                        // woken up to retry our own dummy prepare
                        relay_stmt = Some(found);
                    } else {
                        let timeout = self
                            .contexts
                            .get(handle)
                            .map(|c| c.wait_timeout)
                            .unwrap_or(0);
                        let waiter =
                            WaitContext::new(handle.cid, handle.uid, timeout, now_secs());
                        if let Some(stmt) = self.stmts.get_mut(found) {
                            stmt.waitq.ordered_insert(waiter);
                        }
                        self.stats.stmt_waiter_delta(1);
                        if let Some(ctx) = self.contexts.get_mut(handle) {
                            ctx.waiting_event = Some(Box::new(event));
                        }
                        return;
                    }
                }
                _ => {
                    self.set_free(handle);
                    return;
                }
            }
        }

        let stmt_h = match relay_stmt {
            Some(h) => h,
            None => {
                let stmt_type = if use_temp_statement {
                    StmtType::Exclusive
                } else {
                    StmtType::Prepared
                };
                let Some(h) = self.stmts.new_statement(
                    stmt_type,
                    organized.clone(),
                    parsed.hints.clone(),
                    parsed.bind_count,
                    &db_user,
                    bucket,
                    handle,
                ) else {
                    warn!("statement pool exhausted. (cid:{})", handle.cid);
                    self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                    return;
                };
                debug!("created statement. (stmt_h_id:{}, sql:[{}])", h, organized);

                // forward the rewritten text and keep it for dummy prepares
                let sql_arg = frame::str_arg(&organized);
                let mut args: Vec<&[u8]> = vec![&sql_arg];
                args.extend(rest_args.iter().map(|v| v.as_slice()));
                let request = frame::build_request(FuncCode::Prepare.as_u8(), &args);
                if let Some(stmt) = self.stmts.get_mut(h) {
                    stmt.request_buffer = request.clone();
                }
                event.buffer = IoBuffer::from_message(request);

                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.prepared_stmt = Some(h);
                }
                self.pin_to_ctx(handle, h);
                h
            }
        };

        self.relay_prepare_request(handle, stmt_h, event);
    }

    /// Shared tail of the prepare path: force-out-tran marking, static shard
    /// resolution, CAS allocation and the actual forward.
    fn relay_prepare_request(&mut self, handle: CtxHandle, stmt_h: i32, mut event: ProxyEvent) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            if !ctx.is_in_tran || ctx.waiting_dummy_prepare {
                frame::set_force_out_tran(event.msg_mut());
            }
            ctx.waiting_dummy_prepare = false;
        }

        if self.stmts.get(stmt_h).map(|s| s.status) != Some(StmtStatus::InProgress) {
            warn!("unexpected statement status before prepare relay. (stmt_h_id:{})", stmt_h);
            self.set_free(handle);
            return;
        }

        let has_static = self
            .stmts
            .get(stmt_h)
            .map(|s| s.has_static_hint())
            .unwrap_or(false);
        if has_static {
            match self.resolve_shard_for_stmt(stmt_h, None) {
                Ok(shard) if shard != INVALID_ID => {
                    if let Some(ctx) = self.contexts.get_mut(handle) {
                        ctx.shard_id = shard;
                    }
                }
                _ => {
                    self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                    self.wake_and_free_stmt(stmt_h);
                    if let Some(ctx) = self.contexts.get_mut(handle) {
                        ctx.prepared_stmt = None;
                    }
                    return;
                }
            }
        }

        match self.alloc_cas_for(handle, FuncCode::Prepare) {
            CasAllocOutcome::Assigned {
                shard_id, cas_id, ..
            } => {
                if self
                    .forward_to_cas(handle, shard_id, cas_id, FuncCode::Prepare, event, true)
                    .is_err()
                {
                    self.set_free(handle);
                }
            }
            CasAllocOutcome::Wait { .. } => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.waiting_event = Some(Box::new(event));
                    ctx.waiting_dummy_prepare = true;
                    ctx.func_code = Some(FuncCode::Prepare);
                }
            }
            CasAllocOutcome::Fatal => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                self.wake_and_free_stmt(stmt_h);
                let shard_bound = self
                    .contexts
                    .get_mut(handle)
                    .map(|ctx| {
                        ctx.prepared_stmt = None;
                        ctx.shard_id != INVALID_ID
                    })
                    .unwrap_or(false);
                if shard_bound {
                    self.set_free(handle);
                }
            }
        }
    }

    pub(crate) fn fn_client_execute(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.client_execute_internal(handle, event, FuncCode::Execute)
    }

    pub(crate) fn fn_client_execute_array(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.client_execute_internal(handle, event, FuncCode::ExecuteArray)
    }

    fn client_execute_internal(&mut self, handle: CtxHandle, event: ProxyEvent, func: FuncCode) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            if ctx.waiting_event.is_some() {
                warn!("execute while another request is parked. (cid:{})", handle.cid);
                ctx.waiting_event = None;
                ctx.free_context = true;
                return;
            }
            ctx.is_client_in_tran = true;
        }

        let client_version = self.client_version_of(handle);
        let v1_or_later = client_version >= version::proto_ver(PROTOCOL_V1);
        let bind_base = if v1_or_later { 3 } else { 2 };

        let argv: Vec<Vec<u8>> = match frame::split_argv(event.msg()) {
            Ok(argv) => argv.iter().map(|a| a.to_vec()).collect(),
            Err(_) => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
                return;
            }
        };
        if argv.len() < bind_base || (argv.len() - bind_base) % 2 != 0 {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        }
        let Ok(srv_h) = frame::arg_as_i32(&argv[0]) else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        };
        let query_timeout_ms = if v1_or_later {
            let raw = frame::arg_as_i32(&argv[2]).unwrap_or(0);
            if version::understands(client_version, PROTOCOL_V2) {
                raw
            } else {
                raw.saturating_mul(1000) // V1 drivers send seconds
            }
        } else {
            0
        };

        let stmt_status = self.stmts.get(srv_h).map(|s| s.status);
        if stmt_status.is_none() || stmt_status == Some(StmtStatus::Invalid) {
            debug!("execute with unknown statement handle. (srv_h_id:{})", srv_h);
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_STMT_POOLING);
            return;
        }

        let Ok(shard) = self.resolve_shard_for_stmt(srv_h, Some((&argv, bind_base))) else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
            return;
        };

        if func == FuncCode::ExecuteArray {
            let bind_size = self.stmts.get(srv_h).map(|s| s.bind_count * 2).unwrap_or(0);
            if bind_size > 0 {
                let mut at = bind_base + bind_size;
                while at < argv.len() {
                    match self.resolve_shard_for_stmt(srv_h, Some((&argv, at))) {
                        Ok(next) if next == shard => {}
                        _ => {
                            debug!("batch rows resolve to different shards");
                            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                            return;
                        }
                    }
                    at += bind_size;
                }
            }
        }

        {
            let default_timeout = self.contexts.default_wait_timeout();
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            if ctx.shard_id != INVALID_ID && shard != INVALID_ID && ctx.shard_id != shard {
                warn!(
                    "shard cannot change within a transaction. (bound:{}, requested:{})",
                    ctx.shard_id, shard
                );
                ctx.set_error(CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                ctx.free_context = true;
                return;
            }
            if shard != INVALID_ID {
                ctx.shard_id = shard;
            }
            ctx.wait_timeout = combined_wait_timeout(default_timeout, query_timeout_ms);
        }

        match self.alloc_cas_for(handle, func) {
            CasAllocOutcome::Assigned {
                shard_id, cas_id, ..
            } => {
                self.pin_to_ctx(handle, srv_h);
                self.dispatch_execute(handle, srv_h, shard_id, cas_id, func, event);
            }
            CasAllocOutcome::Wait { .. } => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.waiting_event = Some(Box::new(event));
                    ctx.func_code = Some(func);
                }
            }
            CasAllocOutcome::Fatal => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
            }
        }
    }

    /// Sends the execute to its CAS, detouring through a dummy prepare when
    /// this worker has no server handle for the statement yet.
    fn dispatch_execute(
        &mut self,
        handle: CtxHandle,
        stmt_h: i32,
        shard_id: i32,
        cas_id: i32,
        func: FuncCode,
        mut event: ProxyEvent,
    ) {
        let real_srv_h = self.stmts.srv_h_id(stmt_h, shard_id, cas_id);
        let hint_type = self
            .stmts
            .get(stmt_h)
            .map(|s| s.hint_type())
            .unwrap_or(parser::HintType::None);

        if real_srv_h == STMT_INVALID_HANDLE_ID {
            debug!(
                "prepare before execute. (stmt_h_id:{}, shard_id:{}, cas_id:{})",
                stmt_h, shard_id, cas_id
            );
            let request = self
                .stmts
                .get(stmt_h)
                .map(|s| s.request_buffer.clone())
                .unwrap_or_default();
            if request.is_empty() {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                return;
            }
            {
                let Some(ctx) = self.contexts.get_mut(handle) else {
                    return;
                };
                ctx.is_prepare_for_execute = true;
                ctx.prepared_stmt = Some(stmt_h);
                ctx.waiting_event = Some(Box::new(event));
            }
            let prepare = ProxyEvent::with_message(EventKind::IoWrite, FROM_CAS, request);
            if self
                .forward_to_cas(handle, shard_id, cas_id, FuncCode::Prepare, prepare, false)
                .is_err()
            {
                self.set_free(handle);
            }
            return;
        }

        // park the untranslated request first so a retry can re-route
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.waiting_event = Some(Box::new(event.clone()));
            ctx.stmt_hint_type = hint_type;
            ctx.stmt_h_id = stmt_h;
        }
        self.stats.shard_request(shard_id);
        rewrite_request_handle(event.msg_mut(), real_srv_h);
        if self
            .forward_to_cas(handle, shard_id, cas_id, func, event, false)
            .is_err()
        {
            self.set_free(handle);
        }
    }

    /// Relay of a handle-based request that only makes sense inside the
    /// current transaction (cursor, fetch).
    fn relay_handle_request(
        &mut self,
        handle: CtxHandle,
        func: FuncCode,
        mut event: ProxyEvent,
    ) {
        let argv0 = frame::split_argv(event.msg())
            .ok()
            .and_then(|argv| argv.first().map(|a| a.to_vec()));
        let srv_h = match argv0.as_deref().map(frame::arg_as_i32) {
            Some(Ok(h)) => h,
            _ => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
                return;
            }
        };
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        let (in_tran, shard_id, cas_id) = (ctx.is_in_tran, ctx.shard_id, ctx.cas_id);
        if !in_tran || self.stmts.get(srv_h).is_none() {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_SRV_HANDLE);
            return;
        }
        let real = self.stmts.srv_h_id(srv_h, shard_id, cas_id);
        if real == STMT_INVALID_HANDLE_ID {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_SRV_HANDLE);
            return;
        }
        rewrite_request_handle(event.msg_mut(), real);
        if self
            .forward_to_cas(handle, shard_id, cas_id, func, event, false)
            .is_err()
        {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_fetch(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.relay_handle_request(handle, FuncCode::Fetch, event);
    }

    pub(crate) fn fn_client_cursor(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.relay_handle_request(handle, FuncCode::Cursor, event);
    }

    /// Close is idempotent: out of transaction, or with no handle bound on
    /// this worker, the proxy answers by itself.
    fn close_handle_request(&mut self, handle: CtxHandle, func: FuncCode, mut event: ProxyEvent) {
        let argv0 = frame::split_argv(event.msg())
            .ok()
            .and_then(|argv| argv.first().map(|a| a.to_vec()));
        let srv_h = match argv0.as_deref().map(frame::arg_as_i32) {
            Some(Ok(h)) => h,
            _ => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
                return;
            }
        };
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        let (in_tran, shard_id, cas_id) = (ctx.is_in_tran, ctx.shard_id, ctx.cas_id);
        if !in_tran {
            if self.send_to_client(handle, reply::make_ok()).is_err() {
                self.set_free(handle);
            }
            return;
        }
        if self.stmts.get(srv_h).is_none() {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_SRV_HANDLE);
            return;
        }
        let real = self.stmts.srv_h_id(srv_h, shard_id, cas_id);
        if real == STMT_INVALID_HANDLE_ID {
            if self.send_to_client(handle, reply::make_ok()).is_err() {
                self.set_free(handle);
            }
            return;
        }
        rewrite_request_handle(event.msg_mut(), real);
        if self
            .forward_to_cas(handle, shard_id, cas_id, func, event, false)
            .is_err()
        {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_close_req_handle(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.close_handle_request(handle, FuncCode::CloseReqHandle, event);
    }

    pub(crate) fn fn_client_cursor_close(&mut self, handle: CtxHandle, event: ProxyEvent) {
        self.close_handle_request(handle, FuncCode::CursorClose, event);
    }

    pub(crate) fn fn_client_schema_info(&mut self, handle: CtxHandle, event: ProxyEvent) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.is_client_in_tran = true;
        }
        let bucket = version::protocol_bucket(self.client_version_of(handle));
        let db_user = self
            .contexts
            .get(handle)
            .map(|c| c.database_user.clone())
            .unwrap_or_default();
        let tag = format!("schema_info:{}:{}", handle.cid, handle.uid);
        let Some(stmt_h) = self.stmts.new_statement(
            StmtType::SchemaInfo,
            tag,
            Vec::new(),
            0,
            &db_user,
            bucket,
            handle,
        ) else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
            return;
        };
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.prepared_stmt = Some(stmt_h);
        }
        self.pin_to_ctx(handle, stmt_h);

        match self.alloc_cas_for(handle, FuncCode::SchemaInfo) {
            CasAllocOutcome::Assigned {
                shard_id, cas_id, ..
            } => {
                if self
                    .forward_to_cas(handle, shard_id, cas_id, FuncCode::SchemaInfo, event, false)
                    .is_err()
                {
                    self.set_free(handle);
                }
            }
            CasAllocOutcome::Wait { .. } => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.waiting_event = Some(Box::new(event));
                    ctx.func_code = Some(FuncCode::SchemaInfo);
                }
            }
            CasAllocOutcome::Fatal => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                self.stmts.free(stmt_h);
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.prepared_stmt = None;
                }
            }
        }
    }

    pub(crate) fn fn_client_prepare_and_execute(&mut self, handle: CtxHandle, event: ProxyEvent) {
        {
            let Some(ctx) = self.contexts.get_mut(handle) else {
                return;
            };
            ctx.is_client_in_tran = true;
            if ctx.waiting_event.is_some() {
                ctx.waiting_event = None;
                ctx.free_context = true;
                return;
            }
        }
        let sql = frame::split_argv(event.msg())
            .ok()
            .and_then(|argv| argv.first().map(|a| a.to_vec()))
            .and_then(|a| frame::arg_as_str(&a).ok().map(|s| s.to_string()));
        let Some(sql) = sql else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        };
        let Ok(parsed) = parser::parse(&sql) else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
            return;
        };

        let bucket = version::protocol_bucket(self.client_version_of(handle));
        let db_user = self
            .contexts
            .get(handle)
            .map(|c| c.database_user.clone())
            .unwrap_or_default();
        let Some(stmt_h) = self.stmts.new_statement(
            StmtType::Exclusive,
            sql,
            parsed.hints.clone(),
            parsed.bind_count,
            &db_user,
            bucket,
            handle,
        ) else {
            self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
            return;
        };
        if let Some(ctx) = self.contexts.get_mut(handle) {
            ctx.prepared_stmt = Some(stmt_h);
        }
        self.pin_to_ctx(handle, stmt_h);

        if self.stmts.get(stmt_h).map(|s| s.has_static_hint()) == Some(true) {
            match self.resolve_shard_for_stmt(stmt_h, None) {
                Ok(shard) if shard != INVALID_ID => {
                    if let Some(ctx) = self.contexts.get_mut(handle) {
                        ctx.shard_id = shard;
                    }
                }
                _ => {
                    self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                    self.stmts.free(stmt_h);
                    if let Some(ctx) = self.contexts.get_mut(handle) {
                        ctx.prepared_stmt = None;
                    }
                    return;
                }
            }
        }

        match self.alloc_cas_for(handle, FuncCode::PrepareAndExecute) {
            CasAllocOutcome::Assigned {
                shard_id, cas_id, ..
            } => {
                if self
                    .forward_to_cas(
                        handle,
                        shard_id,
                        cas_id,
                        FuncCode::PrepareAndExecute,
                        event,
                        true,
                    )
                    .is_err()
                {
                    self.set_free(handle);
                }
            }
            CasAllocOutcome::Wait { .. } => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.waiting_event = Some(Box::new(event));
                    ctx.func_code = Some(FuncCode::PrepareAndExecute);
                }
            }
            CasAllocOutcome::Fatal => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                self.stmts.free(stmt_h);
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.prepared_stmt = None;
                }
            }
        }
    }

    pub(crate) fn fn_client_check_cas(&mut self, handle: CtxHandle, mut event: ProxyEvent) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        if ctx.is_connected {
            let in_tran = ctx.is_client_in_tran;
            let mut msg = reply::make_check_cas_ok();
            if in_tran {
                frame::set_con_status_in_tran(&mut msg);
            }
            if self.send_to_client(handle, msg).is_err() {
                self.set_free(handle);
            }
            return;
        }

        frame::set_force_out_tran(event.msg_mut());
        match self.alloc_cas_for(handle, FuncCode::CheckCas) {
            CasAllocOutcome::Assigned {
                shard_id, cas_id, ..
            } => {
                if self
                    .forward_to_cas(handle, shard_id, cas_id, FuncCode::CheckCas, event, true)
                    .is_err()
                {
                    self.set_free(handle);
                }
            }
            CasAllocOutcome::Wait { .. } => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.waiting_event = Some(Box::new(event));
                    ctx.func_code = Some(FuncCode::CheckCas);
                }
            }
            CasAllocOutcome::Fatal => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_INTERNAL);
                self.set_free(handle);
            }
        }
    }

    pub(crate) fn fn_client_con_close(&mut self, handle: CtxHandle, _event: ProxyEvent) {
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        ctx.is_client_in_tran = false;
        ctx.free_on_client_io_write = true;
        ctx.dont_free_statement = false;
        let in_tran = ctx.is_in_tran;
        let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
        if in_tran {
            ctx.func_code = Some(FuncCode::EndTran);
            let abort = ProxyEvent::with_message(
                EventKind::IoWrite,
                FROM_CAS,
                reply::make_end_tran_abort_request(),
            );
            if self.send_to_cas(shard_id, cas_id, abort).is_err() {
                self.set_free(handle);
                return;
            }
        } else if self
            .send_to_client(handle, reply::make_con_close_ok())
            .is_err()
        {
            self.set_free(handle);
            return;
        }
        self.free_ctx_stmt_list(handle);
    }

    pub(crate) fn fn_client_get_db_parameter(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        if ctx.is_in_tran {
            let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
            if self
                .forward_to_cas(handle, shard_id, cas_id, FuncCode::GetDbParameter, event, false)
                .is_err()
            {
                self.set_free(handle);
            }
            return;
        }
        let param = frame::split_argv(event.msg())
            .ok()
            .and_then(|argv| argv.first().map(|a| a.to_vec()))
            .and_then(|a| frame::arg_as_i32(&a).ok());
        let msg = match param {
            Some(1) => reply::make_int_reply(self.config.isolation_level),
            Some(2) => reply::make_int_reply(self.config.lock_timeout),
            _ => {
                self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_ARGS);
                return;
            }
        };
        if self.send_to_client(handle, msg).is_err() {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_set_db_parameter(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        if ctx.is_in_tran {
            let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
            if self
                .forward_to_cas(handle, shard_id, cas_id, FuncCode::SetDbParameter, event, false)
                .is_err()
            {
                self.set_free(handle);
            }
            return;
        }
        if self.send_to_client(handle, reply::make_ok()).is_err() {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_get_db_version(&mut self, handle: CtxHandle, event: ProxyEvent) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        if ctx.is_in_tran {
            let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
            if self
                .forward_to_cas(handle, shard_id, cas_id, FuncCode::GetDbVersion, event, false)
                .is_err()
            {
                self.set_free(handle);
            }
            return;
        }
        let msg = reply::make_str_reply(&self.config.db_version);
        if self.send_to_client(handle, msg).is_err() {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_get_shard_info(&mut self, handle: CtxHandle, _event: ProxyEvent) {
        let shards: Vec<(i32, i32)> = self
            .shards
            .shards()
            .iter()
            .map(|s| (s.shard_id, s.cur_num_cas as i32))
            .collect();
        if self
            .send_to_client(handle, reply::make_shard_info_reply(&shards))
            .is_err()
        {
            self.set_free(handle);
        }
    }

    pub(crate) fn fn_client_not_supported(&mut self, handle: CtxHandle, _event: ProxyEvent) {
        self.set_ctx_error(handle, CAS_ERROR_INDICATOR, CAS_ER_NOT_IMPLEMENTED);
    }

    /// Client connection died. In transaction with no request in flight the
    /// CAS gets an abort first; otherwise the context dies now.
    pub(crate) fn fn_client_conn_error(&mut self, handle: CtxHandle) {
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        if ctx.is_in_tran && ctx.func_code.is_none() {
            ctx.free_on_end_tran = true;
            ctx.func_code = Some(FuncCode::EndTran);
            let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
            let abort = ProxyEvent::with_message(
                EventKind::IoWrite,
                FROM_CAS,
                reply::make_end_tran_abort_request(),
            );
            if self.send_to_cas(shard_id, cas_id, abort).is_err() {
                self.set_free(handle);
            }
        } else {
            ctx.free_context = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_combination() {
        // both set: min
        assert_eq!(combined_wait_timeout(30, 5_000), 5);
        assert_eq!(combined_wait_timeout(3, 5_000), 3);
        // only one set: sum
        assert_eq!(combined_wait_timeout(0, 5_000), 5);
        assert_eq!(combined_wait_timeout(30, 0), 30);
        assert_eq!(combined_wait_timeout(0, 0), 0);
        // milliseconds round up
        assert_eq!(combined_wait_timeout(0, 4_001), 5);
    }

    #[test]
    fn handle_rewrite_targets_first_argument() {
        let mut msg = frame::build_request(
            FuncCode::Execute.as_u8(),
            &[&77i32.to_be_bytes(), &[0u8], &0i32.to_be_bytes()],
        );
        rewrite_request_handle(&mut msg, 1234);
        let argv = frame::split_argv(&msg).unwrap();
        assert_eq!(frame::arg_as_i32(argv[0]).unwrap(), 1234);
        assert_eq!(argv[1], &[0u8]);
    }
}
