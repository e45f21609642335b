//! The dispatcher: drains the three event queues and drives the per-request
//! state machine through the client- and CAS-side handler tables.
//!
//! Handlers communicate through context flags only: they record the first
//! error, set `free_context`, or park an event on `waiting_event`; the
//! post-dispatch steps here serialize errors and destroy doomed contexts.

mod cas;
mod client;

use log::{debug, warn};

use shardcast_proto::frame;
use shardcast_proto::func::{self, FuncCode};
use shardcast_proto::version;

use crate::context::CtxHandle;
use crate::event::{EventKind, ProxyEvent};
use crate::reactor::ProxyRuntime;
use crate::stmt::STMT_INVALID_HANDLE_ID;
use crate::INVALID_ID;

impl ProxyRuntime {
    /// Drains the CAS-response, client-retry and client-receive queues, in
    /// that order. Wakeups enqueued while draining are processed in the
    /// same call.
    pub fn process_queues(&mut self) {
        loop {
            if let Some(event) = self.cas_rcv_q.pop() {
                self.process_cas_event(event);
                continue;
            }
            if let Some(event) = self.cli_ret_q.pop() {
                self.process_client_event(event);
                continue;
            }
            if let Some(event) = self.cli_rcv_q.pop() {
                self.process_client_event(event);
                continue;
            }
            break;
        }
    }

    pub(crate) fn process_client_event(&mut self, event: ProxyEvent) {
        match event.kind {
            EventKind::ClientRequest => self.process_client_request(event),
            EventKind::ClientConnError => self.process_client_conn_error(event),
            EventKind::WakeupByShard | EventKind::WakeupByStatement => {
                self.process_client_wakeup(event)
            }
            _ => warn!("unexpected client event {:?}", event.kind),
        }
    }

    pub(crate) fn process_cas_event(&mut self, event: ProxyEvent) {
        match event.kind {
            EventKind::CasResponse => self.process_cas_response(event),
            EventKind::CasConnError => self.process_cas_conn_error(event),
            _ => warn!("unexpected cas event {:?}", event.kind),
        }
    }

    fn process_client_request(&mut self, mut event: ProxyEvent) {
        let handle = CtxHandle {
            cid: event.cid,
            uid: event.uid,
        };
        if self.contexts.get(handle).is_none() {
            debug!("dropping request for stale context. (cid:{})", event.cid);
            return;
        }

        frame::unset_force_out_tran(event.msg_mut());

        let Ok(raw_code) = frame::request_func_byte(event.msg()) else {
            warn!("request without function code. (cid:{})", event.cid);
            return;
        };
        let client_version = self.client_version_of(handle);
        let code = match FuncCode::from_u8(raw_code) {
            Ok(code) => func::remap_for_version(code, client_version),
            Err(e) => {
                warn!("{} from client. (cid:{})", e, event.cid);
                return;
            }
        };
        if code == FuncCode::CasRegister {
            warn!("register code on established client. (cid:{})", event.cid);
            return;
        }

        debug!(
            "process client request. (func_code:{:?}, cid:{}, uid:{})",
            code, event.cid, event.uid
        );
        self.dispatch_client_fn(code, handle, event);
        self.post_client_request(handle);
    }

    fn dispatch_client_fn(&mut self, code: FuncCode, handle: CtxHandle, event: ProxyEvent) {
        match code {
            FuncCode::EndTran => self.fn_client_end_tran(handle, event),
            FuncCode::Prepare => self.fn_client_prepare(handle, event),
            FuncCode::Execute => self.fn_client_execute(handle, event),
            FuncCode::GetDbParameter => self.fn_client_get_db_parameter(handle, event),
            FuncCode::SetDbParameter => self.fn_client_set_db_parameter(handle, event),
            FuncCode::CloseReqHandle => self.fn_client_close_req_handle(handle, event),
            FuncCode::Cursor => self.fn_client_cursor(handle, event),
            FuncCode::Fetch => self.fn_client_fetch(handle, event),
            FuncCode::SchemaInfo => self.fn_client_schema_info(handle, event),
            FuncCode::GetDbVersion => self.fn_client_get_db_version(handle, event),
            FuncCode::ConClose => self.fn_client_con_close(handle, event),
            FuncCode::CheckCas => self.fn_client_check_cas(handle, event),
            FuncCode::CursorClose => self.fn_client_cursor_close(handle, event),
            // only reachable from V2 drivers, where code 13 is retired
            FuncCode::CursorCloseOld => self.fn_client_not_supported(handle, event),
            FuncCode::ExecuteArray => self.fn_client_execute_array(handle, event),
            FuncCode::PrepareAndExecute => self.fn_client_prepare_and_execute(handle, event),
            FuncCode::GetShardInfo => self.fn_client_get_shard_info(handle, event),
            FuncCode::CasRegister => unreachable!("filtered before dispatch"),
        }
    }

    fn dispatch_cas_fn(&mut self, code: FuncCode, handle: CtxHandle, event: ProxyEvent) {
        match code {
            FuncCode::EndTran => self.fn_cas_end_tran(handle, event),
            FuncCode::Prepare => self.fn_cas_prepare(handle, event),
            FuncCode::Execute | FuncCode::ExecuteArray => self.fn_cas_execute(handle, event),
            FuncCode::Fetch => self.fn_cas_fetch(handle, event),
            FuncCode::SchemaInfo => self.fn_cas_schema_info(handle, event),
            FuncCode::PrepareAndExecute => self.fn_cas_prepare_and_execute(handle, event),
            FuncCode::CheckCas => self.fn_cas_check_cas(handle, event),
            _ => self.fn_cas_relay_only(handle, event),
        }
    }

    /// After every client-side dispatch: flush the recorded error, then
    /// destroy the context if the handler doomed it.
    fn post_client_request(&mut self, handle: CtxHandle) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        let has_error = ctx.has_error();
        if has_error {
            if self.send_error_to_client(handle).is_err() {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.free_context = true;
                }
            }
            if let Some(ctx) = self.contexts.get_mut(handle) {
                ctx.clear_error();
            }
        }
        let doomed = self
            .contexts
            .get(handle)
            .map(|c| c.free_context)
            .unwrap_or(false);
        if doomed {
            self.free_context(handle);
        }
    }

    fn process_cas_response(&mut self, event: ProxyEvent) {
        let handle = CtxHandle {
            cid: event.cid,
            uid: event.uid,
        };
        if self.contexts.get(handle).is_none() {
            debug!("dropping cas response for stale context. (cid:{})", event.cid);
            return;
        }

        // A header-only response carries no result code; treat it as ok.
        let result = frame::read_result_code(event.msg()).unwrap_or(0);
        let cas_in_tran = frame::con_status_is_in_tran(event.msg());

        {
            let default_timeout = self.contexts.default_wait_timeout();
            let ctx = self.contexts.get_mut(handle).unwrap();
            ctx.is_cas_in_tran = cas_in_tran;
            if result < 0 {
                ctx.wait_timeout = default_timeout;
                if !ctx.is_in_tran {
                    // unexpected error while idle, discard
                    self.finish_cas_response(handle);
                    return;
                }
                if ctx.func_code.is_none() {
                    ctx.free_context = true;
                    self.finish_cas_response(handle);
                    return;
                }
                // otherwise the handler relays the error to the client
            }
        }

        let Some(code) = self.contexts.get(handle).and_then(|c| c.func_code) else {
            warn!("cas response without pending function. (cid:{})", event.cid);
            self.finish_cas_response(handle);
            return;
        };
        debug!(
            "process cas response. (func_code:{:?}, cid:{}, uid:{})",
            code, event.cid, event.uid
        );
        self.dispatch_cas_fn(code, handle, event);

        // Transaction bookkeeping: when the CAS reports out-of-tran, the
        // borrow ends here and waiters get the slot.
        if let Some(ctx) = self.contexts.get(handle) {
            if ctx.is_in_tran && !ctx.is_cas_in_tran {
                let (shard_id, cas_id) = (ctx.shard_id, ctx.cas_id);
                self.release_cas_and_wakeup(shard_id, cas_id, handle);
                let ctx = self.contexts.get_mut(handle).unwrap();
                ctx.set_out_tran();
                ctx.prepared_stmt = None;
                ctx.stmt_h_id = STMT_INVALID_HANDLE_ID;
                if !ctx.dont_free_statement {
                    self.free_ctx_stmt_list(handle);
                }
            }
        }
        self.finish_cas_response(handle);
    }

    fn finish_cas_response(&mut self, handle: CtxHandle) {
        let default_timeout = self.contexts.default_wait_timeout();
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        ctx.func_code = None;
        ctx.wait_timeout = default_timeout;
        let has_error = ctx.has_error();
        if has_error {
            let _ = self.send_error_to_client(handle);
            if let Some(ctx) = self.contexts.get_mut(handle) {
                ctx.clear_error();
            }
        }
        let doomed = self
            .contexts
            .get(handle)
            .map(|c| c.free_context)
            .unwrap_or(false);
        if doomed {
            self.free_context(handle);
        }
    }

    /// CAS disconnect under an in-flight request. Retried once when the CAS
    /// was not yet in transaction; otherwise the context dies.
    fn process_cas_conn_error(&mut self, event: ProxyEvent) {
        let handle = CtxHandle {
            cid: event.cid,
            uid: event.uid,
        };
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        if !ctx.is_in_tran {
            self.free_context(handle);
            return;
        }
        let retryable = ctx.waiting_event.is_some()
            && !ctx.is_cas_in_tran
            && matches!(
                ctx.func_code,
                Some(FuncCode::Prepare)
                    | Some(FuncCode::Execute)
                    | Some(FuncCode::PrepareAndExecute)
                    | Some(FuncCode::CheckCas)
            );
        if retryable {
            debug!(
                "cas died before reply, retrying request. (cid:{}, uid:{})",
                handle.cid, handle.uid
            );
            // The dead slot is already torn down by the socket layer.
            ctx.set_out_tran();
            ctx.func_code = None;
            let waiting = ctx.waiting_event.take().unwrap();
            self.cli_ret_q.push(*waiting);
        } else {
            self.free_context(handle);
        }
    }

    fn process_client_conn_error(&mut self, event: ProxyEvent) {
        let handle = CtxHandle {
            cid: event.cid,
            uid: event.uid,
        };
        if self.contexts.get(handle).is_none() {
            return;
        }
        self.fn_client_conn_error(handle);
        let doomed = self
            .contexts
            .get(handle)
            .map(|c| c.free_context)
            .unwrap_or(false);
        if doomed {
            self.free_context(handle);
        }
    }

    /// A parked context got its CAS or its statement; re-drive the saved
    /// request as if it had just arrived.
    fn process_client_wakeup(&mut self, event: ProxyEvent) {
        let handle = CtxHandle {
            cid: event.cid,
            uid: event.uid,
        };
        let Some(ctx) = self.contexts.get_mut(handle) else {
            return;
        };
        let Some(waiting) = ctx.waiting_event.take() else {
            warn!(
                "wakeup for context with no saved request. (cid:{}, uid:{})",
                handle.cid, handle.uid
            );
            self.free_context(handle);
            return;
        };
        self.process_client_request(*waiting);
    }

    pub(crate) fn client_version_of(&self, handle: CtxHandle) -> version::BrokerVersion {
        self.contexts
            .get(handle)
            .map(|c| c.client_id)
            .filter(|&id| id != INVALID_ID)
            .and_then(|id| self.clients.get(id))
            .map(|c| c.client_version())
            .unwrap_or_else(|| version::proto_ver(version::CURRENT_PROTOCOL))
    }
}
