//! The reactor: one [`ProxyRuntime`] value owns every pool and the epoll
//! loop. A tick polls readiness, runs socket I/O, drains the dispatch
//! queues and fires the timer sweep. Teardown runs on this thread when the
//! shutdown flag flips.

use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use shardcast_io::broker::HANDOFF_OK;
use shardcast_io::{net, BrokerChannel, Interest, Poller};
use shardcast_proto::error::{CAS_ERROR_INDICATOR, CAS_ER_MAX_CLIENT_EXCEEDED};
use shardcast_proto::version::{self, BrokerVersion};
use shardcast_proto::{frame, reply};

use crate::cas_io::ShardIoPool;
use crate::client_io::ClientIoPool;
use crate::config::ProxyConfig;
use crate::context::{ContextPool, CtxHandle};
use crate::event::{EventKind, ProxyEvent, FROM_CAS, FROM_CLIENT};
use crate::queue::EventQueue;
use crate::router::RouterTable;
use crate::socket_io::{ReadOutcome, SockAddr, SockStatus, SocketTable, WriteOutcome};
use crate::stats::ProxyStats;
use crate::stmt::StmtPool;
use crate::{now_secs, timer, ProxyError, INVALID_ID};

/// Extra descriptors beyond clients and CAS workers: listeners, the broker
/// channel, logs, stdio.
const RESERVED_FD: usize = 64;

const TICK_MS: isize = 1000;

pub struct ProxyRuntime {
    pub config: ProxyConfig,
    pub stats: ProxyStats,
    pub contexts: ContextPool,
    pub clients: ClientIoPool,
    pub shards: ShardIoPool,
    pub stmts: StmtPool,
    pub routers: RouterTable,
    pub sockets: SocketTable,

    pub cas_rcv_q: EventQueue,
    pub cli_ret_q: EventQueue,
    pub cli_rcv_q: EventQueue,

    poller: Poller,
    client_listener: Option<TcpListener>,
    cas_listener: Option<UnixListener>,
    broker: Option<BrokerChannel>,
    shutdown: Arc<AtomicBool>,
    last_sweep: i64,
}

impl ProxyRuntime {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let routers = RouterTable::from_config(&config)?;
        let max_socket =
            config.max_clients + config.shard_count() * config.max_cas_per_shard() + RESERVED_FD;
        let shard_count = config.shard_count();
        let runtime = Self {
            stats: ProxyStats::new(shard_count),
            contexts: ContextPool::new(config.max_clients, config.wait_timeout),
            clients: ClientIoPool::new(config.max_clients),
            shards: ShardIoPool::new(&config.shards),
            stmts: StmtPool::new(
                config.max_prepared_stmts,
                shard_count,
                config.max_cas_per_shard(),
                config.appl_server.case_sensitive_users(),
            ),
            routers,
            sockets: SocketTable::new(max_socket),
            cas_rcv_q: EventQueue::default(),
            cli_ret_q: EventQueue::default(),
            cli_rcv_q: EventQueue::default(),
            poller: Poller::new()?,
            client_listener: None,
            cas_listener: None,
            broker: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_sweep: 0,
            config,
        };
        Ok(runtime)
    }

    /// Flag the signal handler flips; the loop re-checks it every tick.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn listen_clients(&mut self, addr: &str) -> Result<(), ProxyError> {
        let listener = net::tcp_listener(addr)?;
        self.poller.register(listener.as_raw_fd(), Interest::READ)?;
        self.client_listener = Some(listener);
        Ok(())
    }

    pub fn client_listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.client_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn listen_cas(&mut self, path: &Path) -> Result<(), ProxyError> {
        let listener = net::unix_listener(path)?;
        self.poller.register(listener.as_raw_fd(), Interest::READ)?;
        self.cas_listener = Some(listener);
        Ok(())
    }

    pub fn connect_broker(&mut self, path: &Path) -> Result<(), ProxyError> {
        let channel = BrokerChannel::connect(path, self.config.proxy_id)?;
        self.poller.register(channel.fd(), Interest::READ)?;
        self.broker = Some(channel);
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), ProxyError> {
        info!(
            "proxy {} running. (shards:{}, max_clients:{})",
            self.config.proxy_id,
            self.config.shard_count(),
            self.config.max_clients
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick(TICK_MS)?;
        }
        info!("shutdown flag set, tearing down");
        self.teardown();
        Ok(())
    }

    /// One reactor cycle: poll, socket I/O, queue drain, timer.
    pub fn tick(&mut self, timeout_ms: isize) -> Result<(), ProxyError> {
        let mut ready = Vec::new();
        self.poller.wait(&mut ready, timeout_ms)?;

        let client_lsnr = self.client_listener.as_ref().map(|l| l.as_raw_fd());
        let cas_lsnr = self.cas_listener.as_ref().map(|l| l.as_raw_fd());
        let broker_fd = self.broker.as_ref().map(|b| b.fd());

        for (fd, readiness) in ready {
            if Some(fd) == client_lsnr {
                self.accept_clients();
            } else if Some(fd) == cas_lsnr {
                self.accept_cas_workers();
            } else if Some(fd) == broker_fd {
                self.drain_broker();
            } else if readiness.error {
                self.socket_error(fd);
            } else {
                if readiness.readable {
                    self.socket_read(fd);
                }
                if readiness.writable {
                    self.socket_write(fd);
                }
            }
        }

        self.process_queues();

        let now = now_secs();
        if now != self.last_sweep {
            timer::sweep(self, now);
            self.last_sweep = now;
        }
        Ok(())
    }

    fn accept_clients(&mut self) {
        let Some(listener) = self.client_listener.take() else {
            return;
        };
        loop {
            match net::accept_tcp(&listener) {
                Ok(Some(fd)) => self.install_client_fd(fd),
                Ok(None) => break,
                Err(e) => {
                    warn!("client accept failed: {}", e);
                    break;
                }
            }
        }
        self.client_listener = Some(listener);
    }

    fn accept_cas_workers(&mut self) {
        let Some(listener) = self.cas_listener.take() else {
            return;
        };
        loop {
            match net::accept_unix(&listener) {
                Ok(Some(fd)) => self.install_cas_fd(fd),
                Ok(None) => break,
                Err(e) => {
                    warn!("cas accept failed: {}", e);
                    break;
                }
            }
        }
        self.cas_listener = Some(listener);
    }

    fn drain_broker(&mut self) {
        let Some(mut broker) = self.broker.take() else {
            return;
        };
        loop {
            match broker.recv_client_fd() {
                Ok(Some(fd)) => {
                    if net::set_nonblocking(fd).is_err() {
                        net::close_fd(fd);
                        let _ = broker.send_status(shardcast_io::broker::HANDOFF_REFUSED);
                        continue;
                    }
                    self.install_client_fd(fd);
                    if broker.send_status(HANDOFF_OK).is_err() {
                        error!("broker ack failed, dropping broker channel");
                        let _ = self.poller.deregister(broker.fd());
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("broker channel lost: {}", e);
                    let _ = self.poller.deregister(broker.fd());
                    return;
                }
            }
        }
        self.broker = Some(broker);
    }

    /// Installs an accepted (or handed-off) client fd in `RegWait`.
    pub fn install_client_fd(&mut self, fd: RawFd) {
        if self.sockets.add(fd, FROM_CLIENT).is_err() {
            warn!("socket table full, refusing client fd {}", fd);
            net::close_fd(fd);
            return;
        }
        if let Err(e) = self.poller.register(fd, Interest::READ) {
            error!("failed to register client fd {}: {}", fd, e);
            self.sockets.remove(fd);
            net::close_fd(fd);
        }
    }

    pub fn install_cas_fd(&mut self, fd: RawFd) {
        if self.sockets.add(fd, FROM_CAS).is_err() {
            warn!("socket table full, refusing cas fd {}", fd);
            net::close_fd(fd);
            return;
        }
        if let Err(e) = self.poller.register(fd, Interest::READ) {
            error!("failed to register cas fd {}: {}", fd, e);
            self.sockets.remove(fd);
            net::close_fd(fd);
        }
    }

    pub(crate) fn socket_read(&mut self, fd: RawFd) {
        let Some(sock) = self.sockets.get_mut(fd) else {
            return;
        };
        if sock.status == SockStatus::CloseWait {
            return;
        }
        match sock.read_step() {
            ReadOutcome::Message(event) => self.route_message(fd, event),
            ReadOutcome::Pending => {}
            ReadOutcome::Closed => self.socket_error(fd),
            ReadOutcome::Error(e) => {
                debug!("read error on fd {}: {}", fd, e);
                self.socket_error(fd);
            }
        }
    }

    fn route_message(&mut self, fd: RawFd, mut event: ProxyEvent) {
        let (status, addr, from_cas) = {
            let Some(sock) = self.sockets.get(fd) else {
                return;
            };
            (sock.status, sock.addr, sock.from_cas)
        };
        match (status, addr) {
            (SockStatus::RegWait, _) if !from_cas => self.process_client_register(fd, event),
            (SockStatus::RegWait, _) => self.process_cas_register(fd, event),
            (SockStatus::Established, SockAddr::Client { client_id }) => {
                let Some(client) = self.clients.get(client_id) else {
                    warn!("message from unbound client socket fd {}", fd);
                    return;
                };
                let ctx = client.context();
                event.set_context(ctx.cid, ctx.uid);
                self.cli_rcv_q.push(event);
            }
            (SockStatus::Established, SockAddr::Cas { shard_id, cas_id }) => {
                let Some(cas) = self.shards.cas(shard_id, cas_id) else {
                    return;
                };
                if !cas.is_in_tran {
                    debug!(
                        "dropping response from idle cas. (shard_id:{}, cas_id:{})",
                        shard_id, cas_id
                    );
                    return;
                }
                let owner = cas.owner();
                event.set_context(owner.cid, owner.uid);
                event.set_shard(shard_id, cas_id);
                self.cas_rcv_q.push(event);
            }
            _ => warn!("message on socket in unexpected state. (fd:{})", fd),
        }
    }

    pub(crate) fn socket_write(&mut self, fd: RawFd) {
        let Some(sock) = self.sockets.get_mut(fd) else {
            return;
        };
        match sock.write_step() {
            WriteOutcome::Done => {
                let addr = sock.addr;
                let status = sock.status;
                if self.poller.rearm(fd, Interest::READ).is_err() {
                    debug!("rearm failed after write on fd {}", fd);
                }
                match addr {
                    SockAddr::Client { client_id } => {
                        if let Some(handle) =
                            self.clients.get(client_id).map(|c| c.context())
                        {
                            let free = self
                                .contexts
                                .get(handle)
                                .map(|c| c.free_on_client_io_write)
                                .unwrap_or(false);
                            if free {
                                self.free_context(handle);
                            }
                        }
                    }
                    SockAddr::Unbound if status == SockStatus::CloseWait => {
                        // refusal reply flushed, nothing owns this socket
                        self.close_socket(fd);
                    }
                    _ => {}
                }
            }
            WriteOutcome::Pending => {}
            WriteOutcome::Error(e) => {
                debug!("write error on fd {}: {}", fd, e);
                self.socket_error(fd);
            }
        }
    }

    /// Transport failure or EOF. Client sockets linger in `CloseWait` until
    /// their context is freed; CAS sockets are torn down immediately.
    pub(crate) fn socket_error(&mut self, fd: RawFd) {
        let Some(sock) = self.sockets.get_mut(fd) else {
            return;
        };
        if sock.status == SockStatus::CloseWait && !sock.from_cas {
            return;
        }
        let addr = sock.addr;
        let from_cas = sock.from_cas;
        sock.status = SockStatus::CloseWait;
        sock.read_event = None;
        let _ = self.poller.deregister(fd);

        match addr {
            SockAddr::Client { client_id } => {
                let Some(handle) = self.clients.get(client_id).map(|c| c.context()) else {
                    self.close_socket(fd);
                    return;
                };
                let mut event = ProxyEvent::new(EventKind::ClientConnError, FROM_CLIENT);
                event.set_context(handle.cid, handle.uid);
                self.cli_rcv_q.push(event);
            }
            SockAddr::Cas { shard_id, cas_id } => {
                info!("cas disconnected. (shard_id:{}, cas_id:{})", shard_id, cas_id);
                self.stmts.reset_srv_h_ids_for_cas(shard_id, cas_id);
                let owner = self.shards.close_cas(shard_id, cas_id);
                self.close_socket(fd);
                if let Some(owner) = owner {
                    let mut event = ProxyEvent::new(EventKind::CasConnError, FROM_CAS);
                    event.set_context(owner.cid, owner.uid);
                    event.set_shard(shard_id, cas_id);
                    self.cas_rcv_q.push(event);
                }
            }
            SockAddr::Unbound => {
                debug!("dropping unregistered socket. (fd:{}, from_cas:{})", fd, from_cas);
                self.close_socket(fd);
            }
        }
    }

    pub(crate) fn close_socket(&mut self, fd: RawFd) {
        if self.sockets.remove(fd).is_some() {
            let _ = self.poller.deregister(fd);
            net::close_fd(fd);
        }
    }

    /// First message on a client socket: `db_name, db_user, db_passwd,
    /// driver_info`. Authenticates against the configured user table.
    fn process_client_register(&mut self, fd: RawFd, event: ProxyEvent) {
        let parsed = frame::split_argv(event.msg()).ok().and_then(|argv| {
            if argv.len() < 4 || argv[3].len() < version::DRIVER_INFO_SIZE {
                return None;
            }
            let db_name = frame::arg_as_str(argv[0]).ok()?.to_string();
            let db_user = frame::arg_as_str(argv[1]).ok()?.to_string();
            let db_passwd = frame::arg_as_str(argv[2]).ok()?.to_string();
            let mut driver_info = [0u8; version::DRIVER_INFO_SIZE];
            driver_info.copy_from_slice(&argv[3][..version::DRIVER_INFO_SIZE]);
            Some((db_name, db_user, db_passwd, driver_info))
        });
        let Some((db_name, db_user, db_passwd, driver_info)) = parsed else {
            warn!("malformed connect message on fd {}", fd);
            self.close_socket(fd);
            return;
        };
        let client_version = version::version_from_driver_info(&driver_info);

        let Some(client_id) = self.clients.alloc(fd) else {
            warn!("max_client exceeded, refusing fd {}", fd);
            self.refuse_client(fd, client_version, CAS_ER_MAX_CLIENT_EXCEEDED);
            return;
        };
        let Some(handle) = self.contexts.alloc() else {
            self.clients.free(client_id);
            self.refuse_client(fd, client_version, CAS_ER_MAX_CLIENT_EXCEEDED);
            return;
        };

        {
            let client = self.clients.get_mut(client_id).unwrap();
            client.driver_info = driver_info;
            client.bind_context(handle);
        }
        {
            let ctx = self.contexts.get_mut(handle).unwrap();
            ctx.client_id = client_id;
            ctx.database_user = db_user.clone();
            ctx.database_passwd = db_passwd.clone();
        }
        {
            let sock = self.sockets.get_mut(fd).unwrap();
            sock.status = SockStatus::Established;
            sock.addr = SockAddr::Client { client_id };
        }
        self.stats.client_delta(1);

        let authorized = self
            .config
            .find_user(&db_user)
            .map(|u| u.password == db_passwd)
            .unwrap_or(false);
        if !authorized {
            info!(
                "authentication failed. (db:{}, user:{}, fd:{})",
                db_name, db_user, fd
            );
            let ctx = self.contexts.get_mut(handle).unwrap();
            ctx.set_error(
                CAS_ERROR_INDICATOR,
                shardcast_proto::error::CAS_ER_NOT_AUTHORIZED_CLIENT,
            );
            ctx.free_on_client_io_write = true;
            let _ = self.send_error_to_client(handle);
            if let Some(ctx) = self.contexts.get_mut(handle) {
                ctx.clear_error();
            }
            return;
        }

        debug!(
            "client registered. (client_id:{}, db:{}, user:{})",
            client_id, db_name, db_user
        );
        // Validate the backend before acknowledging the driver: the dbinfo
        // reply is sent by the check-cas response handler.
        let check = frame::build_request(shardcast_proto::func::FuncCode::CheckCas.as_u8(), &[]);
        let mut event = ProxyEvent::with_message(EventKind::ClientRequest, FROM_CLIENT, check);
        event.set_context(handle.cid, handle.uid);
        self.cli_rcv_q.push(event);
    }

    /// Sends a refusal reply on a socket that never got a context and lets
    /// the write-complete path close it.
    fn refuse_client(&mut self, fd: RawFd, client_version: BrokerVersion, error_code: i32) {
        let msg = reply::make_error_reply(client_version, CAS_ERROR_INDICATOR, error_code, "", false);
        let Some(sock) = self.sockets.get_mut(fd) else {
            return;
        };
        sock.status = SockStatus::CloseWait;
        sock.write_event = Some(ProxyEvent::with_message(EventKind::IoWrite, FROM_CLIENT, msg));
        if self.poller.rearm(fd, Interest::READ_WRITE).is_err() {
            self.close_socket(fd);
        }
    }

    /// First message on a CAS socket: `FN_REGISTER, shard_id, cas_id`.
    fn process_cas_register(&mut self, fd: RawFd, event: ProxyEvent) {
        let parsed = frame::request_func_byte(event.msg())
            .ok()
            .filter(|&f| f == shardcast_proto::func::FuncCode::CasRegister.as_u8())
            .and_then(|_| frame::split_argv(event.msg()).ok())
            .and_then(|argv| {
                if argv.len() < 2 {
                    return None;
                }
                let shard_id = frame::arg_as_i32(argv[0]).ok()?;
                let cas_id = frame::arg_as_i32(argv[1]).ok()?;
                Some((shard_id, cas_id))
            });
        let Some((shard_id, cas_id)) = parsed else {
            warn!("malformed cas registration on fd {}", fd);
            self.close_socket(fd);
            return;
        };
        if self.shards.register_cas(shard_id, cas_id, fd).is_err() {
            self.close_socket(fd);
            return;
        }
        let sock = self.sockets.get_mut(fd).unwrap();
        sock.status = SockStatus::Established;
        sock.addr = SockAddr::Cas { shard_id, cas_id };
        // A fresh worker may satisfy parked contexts.
        self.wake_shard_waiters(shard_id);
    }

    /// Queues a reply on the context's client socket. At most one write is
    /// pending per socket; a second reply in the same tick is a bug upstream.
    pub(crate) fn send_to_client(&mut self, handle: CtxHandle, msg: Vec<u8>) -> Result<(), ()> {
        let client_id = self.contexts.get(handle).map(|c| c.client_id).ok_or(())?;
        let fd = self.clients.get(client_id).map(|c| c.fd).ok_or(())?;
        let Some(sock) = self.sockets.get_mut(fd) else {
            return Err(());
        };
        if sock.status == SockStatus::CloseWait {
            // connection already failed; the conn-error event will clean up
            return Ok(());
        }
        if sock.write_event.is_some() {
            error!("client write slot busy. (fd:{}, client_id:{})", fd, client_id);
            return Err(());
        }
        sock.write_event = Some(ProxyEvent::with_message(EventKind::IoWrite, FROM_CLIENT, msg));
        self.poller.rearm(fd, Interest::READ_WRITE).map_err(|e| {
            error!("rearm for write failed. (fd:{}, error:{})", fd, e);
        })
    }

    /// Queues a request on a CAS socket.
    pub(crate) fn send_to_cas(
        &mut self,
        shard_id: i32,
        cas_id: i32,
        mut event: ProxyEvent,
    ) -> Result<(), ()> {
        let fd = self.shards.cas(shard_id, cas_id).map(|c| c.fd).ok_or(())?;
        let Some(sock) = self.sockets.get_mut(fd) else {
            return Err(());
        };
        if sock.status != SockStatus::Established {
            return Err(());
        }
        if sock.write_event.is_some() {
            error!(
                "cas write slot busy. (shard_id:{}, cas_id:{}, fd:{})",
                shard_id, cas_id, fd
            );
            return Err(());
        }
        event.kind = EventKind::IoWrite;
        event.from_cas = FROM_CAS;
        event.buffer.offset = 0;
        sock.write_event = Some(event);
        self.poller.rearm(fd, Interest::READ_WRITE).map_err(|e| {
            error!("rearm for cas write failed. (fd:{}, error:{})", fd, e);
        })
    }

    /// Serializes the context's recorded error into a driver error frame.
    pub(crate) fn send_error_to_client(&mut self, handle: CtxHandle) -> Result<(), ()> {
        let Some(ctx) = self.contexts.get(handle) else {
            return Err(());
        };
        let (error_ind, error_code, error_msg, in_tran, client_id) = (
            ctx.error_ind,
            ctx.error_code,
            ctx.error_msg.clone(),
            ctx.is_client_in_tran,
            ctx.client_id,
        );
        let (client_version, renewed) = self
            .clients
            .get(client_id)
            .map(|c| (c.client_version(), c.renewed_error_capability()))
            .unwrap_or((version::proto_ver(version::CURRENT_PROTOCOL), true));
        self.stats.inc(&self.stats.num_proxy_errors);
        let wire_code =
            shardcast_proto::error::code_for_client(error_ind, error_code, client_version, renewed);
        let msg = reply::make_error_reply(client_version, error_ind, wire_code, &error_msg, in_tran);
        self.send_to_client(handle, msg)
    }

    /// Releases a context's CAS slot and hands it to the first live waiter.
    pub(crate) fn release_cas_and_wakeup(
        &mut self,
        shard_id: i32,
        cas_id: i32,
        owner: CtxHandle,
    ) {
        if !self.shards.release_by_ctx(shard_id, cas_id, owner) {
            return;
        }
        self.wake_one_waiter(shard_id, cas_id);
    }

    /// Offers every idle slot of a shard to parked waiters, e.g. after a
    /// worker registers.
    fn wake_shard_waiters(&mut self, shard_id: i32) {
        loop {
            let Some(shard) = self.shards.shard(shard_id) else {
                return;
            };
            if shard.waitq.is_empty() {
                return;
            }
            let idle = shard
                .cas_entries()
                .iter()
                .find(|c| !c.is_in_tran && c.status == crate::cas_io::CasStatus::Connected)
                .map(|c| c.cas_id);
            let Some(cas_id) = idle else {
                return;
            };
            if !self.wake_one_waiter(shard_id, cas_id) {
                return;
            }
        }
    }

    /// Pops waiters until one resolves to a live context, then assigns it
    /// the freed slot and queues a wakeup event. Never calls a handler
    /// directly.
    fn wake_one_waiter(&mut self, shard_id: i32, cas_id: i32) -> bool {
        loop {
            let Some(waiter) = self.shards.pop_waiter(shard_id) else {
                return false;
            };
            self.stats.shard_waiter_delta(shard_id, -1);
            let handle = CtxHandle {
                cid: waiter.ctx_cid,
                uid: waiter.ctx_uid,
            };
            let Some(ctx) = self.contexts.get(handle) else {
                continue; // stale waiter, context already gone
            };
            let timeout = ctx.wait_timeout;
            let func_code = ctx
                .func_code
                .unwrap_or(shardcast_proto::func::FuncCode::Prepare);
            let db_user = ctx.database_user.clone();
            let db_passwd = ctx.database_passwd.clone();
            let request = crate::cas_io::AllocRequest {
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
            match self.shards.alloc_by_ctx(&request) {
                crate::cas_io::CasAllocOutcome::Assigned {
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
                    let mut event = ProxyEvent::new(EventKind::WakeupByShard, FROM_CLIENT);
                    event.set_context(handle.cid, handle.uid);
                    event.set_shard(shard_id, cas_id);
                    self.cli_ret_q.push(event);
                    return true;
                }
                _ => {
                    error!(
                        "failed to hand freed cas to waiter. (shard_id:{}, cas_id:{}, cid:{})",
                        shard_id, cas_id, handle.cid
                    );
                    self.free_context(handle);
                    continue;
                }
            }
        }
    }

    /// Unpins every statement the context holds, freeing the non-cacheable
    /// and invalidated ones.
    pub(crate) fn free_ctx_stmt_list(&mut self, handle: CtxHandle) {
        let list = match self.contexts.get_mut(handle) {
            Some(ctx) => ctx.take_stmt_list(),
            None => return,
        };
        for stmt_h in list {
            self.stmts.unpin(stmt_h);
        }
    }

    /// Full context teardown: CAS release, statement pins, client slot and
    /// socket, then the slot itself.
    pub(crate) fn free_context(&mut self, handle: CtxHandle) {
        let Some(ctx) = self.contexts.get(handle) else {
            return;
        };
        let (is_in_tran, shard_id, cas_id, client_id, prepared) = (
            ctx.is_in_tran,
            ctx.shard_id,
            ctx.cas_id,
            ctx.client_id,
            ctx.prepared_stmt,
        );
        debug!(
            "free context. (cid:{}, uid:{}, in_tran:{})",
            handle.cid, handle.uid, is_in_tran
        );

        if is_in_tran && shard_id != INVALID_ID {
            self.release_cas_and_wakeup(shard_id, cas_id, handle);
        }

        if let Some(stmt_h) = prepared {
            let abandoned = self
                .stmts
                .get(stmt_h)
                .map(|s| {
                    s.status == crate::stmt::StmtStatus::InProgress && s.owner() == handle
                })
                .unwrap_or(false);
            if abandoned {
                let waiters = self.stmts.abandon(stmt_h);
                self.wake_stmt_waiters(waiters);
                self.stmts.free(stmt_h);
            }
        }

        self.free_ctx_stmt_list(handle);

        if let Some(fd) = self.clients.free(client_id) {
            self.close_socket(fd);
            self.stats.client_delta(-1);
        }

        self.contexts.release(handle);
    }

    /// Queues `WakeupByStatement` for each waiter that still resolves.
    pub(crate) fn wake_stmt_waiters(&mut self, waiters: Vec<crate::queue::WaitContext>) {
        for waiter in waiters {
            self.stats.stmt_waiter_delta(-1);
            let handle = CtxHandle {
                cid: waiter.ctx_cid,
                uid: waiter.ctx_uid,
            };
            if self.contexts.get(handle).is_none() {
                continue;
            }
            let mut event = ProxyEvent::new(EventKind::WakeupByStatement, FROM_CLIENT);
            event.set_context(handle.cid, handle.uid);
            self.cli_ret_q.push(event);
        }
    }

    /// Ordered teardown, on the reactor thread: contexts (which abort their
    /// transactions), then sockets, then listeners.
    fn teardown(&mut self) {
        for handle in self.contexts.busy_handles() {
            self.free_context(handle);
        }
        for fd in self.sockets.fds() {
            self.close_socket(fd);
        }
        self.client_listener = None;
        self.cas_listener = None;
        self.broker = None;
        info!("proxy {} stopped", self.config.proxy_id);
    }
}
