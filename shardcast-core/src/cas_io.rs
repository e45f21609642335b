//! Per-shard CAS worker tables and the allocator.
//!
//! A CAS slot is borrowed by at most one context at a time; `is_in_tran`
//! marks the borrow. Contexts that find no idle CAS are parked on the
//! shard's deadline-ordered wait queue and woken when a slot frees up.

use std::os::unix::io::RawFd;

use log::{debug, error, warn};
use rand::Rng;

use shardcast_proto::func::FuncCode;

use crate::config::ShardConfig;
use crate::context::CtxHandle;
use crate::queue::{WaitContext, WaitQueue};
use crate::INVALID_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasStatus {
    NotConnected,
    Connected,
    CloseWait,
}

#[derive(Debug)]
pub struct CasIo {
    pub shard_id: i32,
    pub cas_id: i32,
    pub status: CasStatus,
    pub is_in_tran: bool,
    pub ctx_cid: i32,
    pub ctx_uid: u32,
    pub fd: RawFd,
    /// Credentials last reflected into this worker. A mismatch at allocation
    /// forces the worker to reconnect and drops its server handles.
    pub database_user: String,
    pub database_passwd: String,
}

impl CasIo {
    fn idle_connected(&self) -> bool {
        !self.is_in_tran && self.status == CasStatus::Connected
    }

    pub fn owner(&self) -> CtxHandle {
        CtxHandle {
            cid: self.ctx_cid,
            uid: self.ctx_uid,
        }
    }
}

pub struct ShardIo {
    pub shard_id: i32,
    pub max_num_cas: usize,
    pub cur_num_cas: usize,
    pub num_cas_in_tran: usize,
    pub waitq: WaitQueue,
    ents: Vec<CasIo>,
}

impl ShardIo {
    pub fn cas(&self, cas_id: i32) -> Option<&CasIo> {
        self.ents.get(cas_id as usize)
    }

    pub fn cas_entries(&self) -> &[CasIo] {
        &self.ents
    }
}

/// Result of an allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasAllocOutcome {
    Assigned {
        shard_id: i32,
        cas_id: i32,
        credentials_changed: bool,
    },
    /// Parked on the given shard's wait queue; the caller saves the request
    /// event.
    Wait { shard_id: i32 },
    Fatal,
}

pub struct AllocRequest<'a> {
    pub shard_id: i32,
    pub cas_id: i32,
    pub ctx: CtxHandle,
    pub timeout: i32,
    pub func_code: FuncCode,
    pub db_user: &'a str,
    pub db_passwd: &'a str,
    pub case_sensitive_users: bool,
    pub now: i64,
}

pub struct ShardIoPool {
    shards: Vec<ShardIo>,
    alloc_cursor: usize,
    wait_cursor: usize,
}

impl ShardIoPool {
    pub fn new(shard_configs: &[ShardConfig]) -> Self {
        let shards = shard_configs
            .iter()
            .map(|cfg| ShardIo {
                shard_id: cfg.shard_id,
                max_num_cas: cfg.max_cas,
                cur_num_cas: 0,
                num_cas_in_tran: 0,
                waitq: WaitQueue::default(),
                ents: (0..cfg.max_cas)
                    .map(|i| CasIo {
                        shard_id: cfg.shard_id,
                        cas_id: i as i32,
                        status: CasStatus::NotConnected,
                        is_in_tran: false,
                        ctx_cid: INVALID_ID,
                        ctx_uid: 0,
                        fd: -1,
                        database_user: String::new(),
                        database_passwd: String::new(),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        // Stagger the round-robin start so restarted proxies do not all
        // converge on shard zero.
        let seed = if shards.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..shards.len())
        };
        Self {
            shards,
            alloc_cursor: seed,
            wait_cursor: seed,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, shard_id: i32) -> Option<&ShardIo> {
        self.shards.get(shard_id as usize)
    }

    pub fn shards(&self) -> &[ShardIo] {
        &self.shards
    }

    pub fn cas(&self, shard_id: i32, cas_id: i32) -> Option<&CasIo> {
        self.shards.get(shard_id as usize)?.cas(cas_id)
    }

    pub fn cas_mut(&mut self, shard_id: i32, cas_id: i32) -> Option<&mut CasIo> {
        self.shards
            .get_mut(shard_id as usize)?
            .ents
            .get_mut(cas_id as usize)
    }

    /// Looks up a connected CAS by fd, for socket-level addressing checks.
    pub fn find_by_fd(&self, fd: RawFd) -> Option<(i32, i32)> {
        for shard in &self.shards {
            for cas in &shard.ents {
                if cas.fd == fd && cas.status != CasStatus::NotConnected {
                    return Some((cas.shard_id, cas.cas_id));
                }
            }
        }
        None
    }

    /// Handles a worker registration message.
    pub fn register_cas(&mut self, shard_id: i32, cas_id: i32, fd: RawFd) -> Result<(), ()> {
        let Some(shard) = self.shards.get_mut(shard_id as usize) else {
            error!("cas register for unknown shard. (shard_id:{})", shard_id);
            return Err(());
        };
        let Some(cas) = shard.ents.get_mut(cas_id as usize) else {
            error!(
                "cas register for unknown slot. (shard_id:{}, cas_id:{})",
                shard_id, cas_id
            );
            return Err(());
        };
        if cas.status != CasStatus::NotConnected {
            warn!(
                "duplicate cas registration. (shard_id:{}, cas_id:{})",
                shard_id, cas_id
            );
            return Err(());
        }
        cas.status = CasStatus::Connected;
        cas.fd = fd;
        cas.is_in_tran = false;
        cas.ctx_cid = INVALID_ID;
        cas.ctx_uid = 0;
        shard.cur_num_cas += 1;
        debug!("cas registered. (shard_id:{}, cas_id:{}, fd:{})", shard_id, cas_id, fd);
        Ok(())
    }

    /// Handles a worker disconnect. Returns the owning context, if the slot
    /// was borrowed, so the caller can drive the retry-or-free policy.
    pub fn close_cas(&mut self, shard_id: i32, cas_id: i32) -> Option<CtxHandle> {
        let shard = self.shards.get_mut(shard_id as usize)?;
        let cas = shard.ents.get_mut(cas_id as usize)?;
        if cas.status == CasStatus::NotConnected {
            return None;
        }
        let was_in_tran = cas.is_in_tran;
        let owner = was_in_tran.then(|| cas.owner());
        cas.status = CasStatus::NotConnected;
        cas.is_in_tran = false;
        cas.ctx_cid = INVALID_ID;
        cas.ctx_uid = 0;
        cas.fd = -1;
        cas.database_user.clear();
        cas.database_passwd.clear();
        if was_in_tran {
            shard.num_cas_in_tran = shard.num_cas_in_tran.saturating_sub(1);
        }
        shard.cur_num_cas = shard.cur_num_cas.saturating_sub(1);
        owner
    }

    /// The allocator. Policy, in order:
    /// 1. in-tran affinity when both shard and cas are given;
    /// 2. check-cas traffic scans descending to keep low slots free;
    /// 3. otherwise prefer a CAS whose last credentials match, then any idle
    ///    slot ascending, round-robin over shards when none is preferred.
    pub fn alloc_by_ctx(&mut self, req: &AllocRequest) -> CasAllocOutcome {
        if (req.shard_id < 0 && req.cas_id >= 0) || req.shard_id >= self.shards.len() as i32 {
            error!(
                "invalid shard/cas id requested. (shard_id:{}, cas_id:{})",
                req.shard_id, req.cas_id
            );
            return CasAllocOutcome::Fatal;
        }

        let found = if req.shard_id >= 0 && req.cas_id >= 0 {
            match self.alloc_by_shard_and_cas(req.shard_id, req.cas_id, req.ctx) {
                Ok(pair) => Some(pair),
                Err(()) => return CasAllocOutcome::Fatal,
            }
        } else if req.func_code == FuncCode::CheckCas {
            self.alloc_anything(req.shard_id, |shard| Self::find_idle_desc(shard))
        } else {
            self.alloc_anything(req.shard_id, |shard| {
                Self::find_idle_by_conn_info(
                    shard,
                    req.db_user,
                    req.db_passwd,
                    req.case_sensitive_users,
                )
            })
            .or_else(|| self.alloc_anything(req.shard_id, |shard| Self::find_idle_asc(shard)))
        };

        let Some((shard_id, cas_id)) = found else {
            return self.add_waiter(req);
        };

        let shard = &mut self.shards[shard_id as usize];
        if !shard.ents[cas_id as usize].is_in_tran {
            shard.num_cas_in_tran += 1;
        }
        let cas = &mut shard.ents[cas_id as usize];
        cas.is_in_tran = true;
        cas.ctx_cid = req.ctx.cid;
        cas.ctx_uid = req.ctx.uid;

        let credentials_changed =
            cas.database_user != req.db_user || cas.database_passwd != req.db_passwd;
        if credentials_changed {
            cas.database_user = req.db_user.to_string();
            cas.database_passwd = req.db_passwd.to_string();
        }

        CasAllocOutcome::Assigned {
            shard_id,
            cas_id,
            credentials_changed,
        }
    }

    /// Releases a borrowed slot. The caller wakes the shard's waiters.
    pub fn release_by_ctx(&mut self, shard_id: i32, cas_id: i32, ctx: CtxHandle) -> bool {
        let Some(shard) = self.shards.get_mut(shard_id as usize) else {
            debug!("release for invalid shard. (shard_id:{})", shard_id);
            return false;
        };
        let Some(cas) = shard.ents.get_mut(cas_id as usize) else {
            error!("release for invalid cas. (shard_id:{}, cas_id:{})", shard_id, cas_id);
            return false;
        };
        if !cas.is_in_tran || cas.ctx_cid != ctx.cid || cas.ctx_uid != ctx.uid {
            error!(
                "release by non-owner. (shard_id:{}, cas_id:{}, cid:{}, uid:{})",
                shard_id, cas_id, ctx.cid, ctx.uid
            );
            return false;
        }
        cas.is_in_tran = false;
        cas.ctx_cid = INVALID_ID;
        cas.ctx_uid = 0;
        shard.num_cas_in_tran = shard.num_cas_in_tran.saturating_sub(1);
        debug!(
            "shard status. (num_cas_in_tran:{}, shard_id:{})",
            shard.num_cas_in_tran, shard_id
        );
        true
    }

    pub fn pop_waiter(&mut self, shard_id: i32) -> Option<WaitContext> {
        self.shards.get_mut(shard_id as usize)?.waitq.dequeue()
    }

    pub fn pop_expired_waiters(&mut self, shard_id: i32, now: i64) -> Vec<WaitContext> {
        match self.shards.get_mut(shard_id as usize) {
            Some(shard) => shard.waitq.pop_expired(now),
            None => Vec::new(),
        }
    }

    fn add_waiter(&mut self, req: &AllocRequest) -> CasAllocOutcome {
        let shard_id = if req.shard_id >= 0 {
            req.shard_id as usize
        } else {
            self.wait_cursor = (self.wait_cursor + 1) % self.shards.len();
            self.wait_cursor
        };
        let shard = &mut self.shards[shard_id];
        if shard.cur_num_cas == 0 {
            warn!(
                "no cas connected in shard, waiting. (shard_id:{}, max_num_cas:{})",
                shard.shard_id, shard.max_num_cas
            );
        }
        shard
            .waitq
            .ordered_insert(WaitContext::new(req.ctx.cid, req.ctx.uid, req.timeout, req.now));
        debug!(
            "context is waiting on shard. (cid:{}, uid:{}, shard_id:{})",
            req.ctx.cid, req.ctx.uid, shard.shard_id
        );
        CasAllocOutcome::Wait {
            shard_id: shard.shard_id,
        }
    }

    /// In-tran affinity path: the context must get its own slot back.
    fn alloc_by_shard_and_cas(
        &mut self,
        shard_id: i32,
        cas_id: i32,
        ctx: CtxHandle,
    ) -> Result<(i32, i32), ()> {
        let shard = self.shards.get(shard_id as usize).ok_or(())?;
        let cas = shard.cas(cas_id).ok_or(())?;
        if (cas.ctx_cid != INVALID_ID && cas.ctx_cid != ctx.cid)
            || (cas.ctx_uid != 0 && cas.ctx_uid != ctx.uid)
        {
            error!(
                "cas slot owned by another context. (shard_id:{}, cas_id:{}, owner:{}/{})",
                shard_id, cas_id, cas.ctx_cid, cas.ctx_uid
            );
            return Err(());
        }
        if cas.status != CasStatus::Connected {
            debug!(
                "cas slot not connected. (shard_id:{}, cas_id:{})",
                shard_id, cas_id
            );
            return Err(());
        }
        Ok((shard_id, cas_id))
    }

    fn alloc_anything(
        &mut self,
        shard_id: i32,
        find: impl Fn(&ShardIo) -> Option<i32>,
    ) -> Option<(i32, i32)> {
        if shard_id >= 0 {
            let shard = &self.shards[shard_id as usize];
            return find(shard).map(|cas_id| (shard_id, cas_id));
        }
        let mut candidate = self.alloc_cursor;
        for _ in 0..self.shards.len() {
            candidate = (candidate + 1) % self.shards.len();
            let shard = &self.shards[candidate];
            if shard.cur_num_cas == shard.num_cas_in_tran {
                continue;
            }
            if let Some(cas_id) = find(shard) {
                self.alloc_cursor = candidate;
                return Some((candidate as i32, cas_id));
            }
        }
        None
    }

    fn find_idle_asc(shard: &ShardIo) -> Option<i32> {
        shard.ents.iter().find(|c| c.idle_connected()).map(|c| c.cas_id)
    }

    fn find_idle_desc(shard: &ShardIo) -> Option<i32> {
        shard
            .ents
            .iter()
            .rev()
            .find(|c| c.idle_connected())
            .map(|c| c.cas_id)
    }

    fn find_idle_by_conn_info(
        shard: &ShardIo,
        db_user: &str,
        db_passwd: &str,
        case_sensitive: bool,
    ) -> Option<i32> {
        shard
            .ents
            .iter()
            .find(|c| {
                if !c.idle_connected() {
                    return false;
                }
                let user_match = if case_sensitive {
                    c.database_user == db_user
                } else {
                    c.database_user.eq_ignore_ascii_case(db_user)
                };
                user_match && c.database_passwd == db_passwd
            })
            .map(|c| c.cas_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn pool(shards: usize, cas: usize) -> ShardIoPool {
        let config = test_config(shards, cas);
        let mut pool = ShardIoPool::new(&config.shards);
        for s in 0..shards {
            for c in 0..cas {
                pool.register_cas(s as i32, c as i32, (100 + s * 10 + c) as RawFd)
                    .unwrap();
            }
        }
        pool
    }

    fn req<'a>(shard_id: i32, cas_id: i32, ctx: CtxHandle, func: FuncCode) -> AllocRequest<'a> {
        AllocRequest {
            shard_id,
            cas_id,
            ctx,
            timeout: 10,
            func_code: func,
            db_user: "shard",
            db_passwd: "shard123",
            case_sensitive_users: false,
            now: 1000,
        }
    }

    const CTX: CtxHandle = CtxHandle { cid: 0, uid: 1 };
    const CTX2: CtxHandle = CtxHandle { cid: 1, uid: 2 };

    #[test]
    fn alloc_specific_shard_prefers_ascending() {
        let mut p = pool(2, 3);
        let out = p.alloc_by_ctx(&req(1, -1, CTX, FuncCode::Prepare));
        assert_eq!(
            out,
            CasAllocOutcome::Assigned {
                shard_id: 1,
                cas_id: 0,
                credentials_changed: true
            }
        );
        assert_eq!(p.shard(1).unwrap().num_cas_in_tran, 1);
    }

    #[test]
    fn check_cas_scans_descending() {
        let mut p = pool(1, 3);
        let out = p.alloc_by_ctx(&req(0, -1, CTX, FuncCode::CheckCas));
        assert!(matches!(out, CasAllocOutcome::Assigned { cas_id: 2, .. }));
    }

    #[test]
    fn affinity_reuses_owned_slot() {
        let mut p = pool(1, 2);
        let CasAllocOutcome::Assigned { shard_id, cas_id, .. } =
            p.alloc_by_ctx(&req(0, -1, CTX, FuncCode::Prepare))
        else {
            panic!("expected assignment");
        };
        // same context asks again with explicit (shard, cas): reuse
        let out = p.alloc_by_ctx(&req(shard_id, cas_id, CTX, FuncCode::Execute));
        assert!(matches!(out, CasAllocOutcome::Assigned { credentials_changed: false, .. }));
        assert_eq!(p.shard(0).unwrap().num_cas_in_tran, 1);

        // another context asking for the same slot is a fatal mismatch
        let out = p.alloc_by_ctx(&req(shard_id, cas_id, CTX2, FuncCode::Execute));
        assert_eq!(out, CasAllocOutcome::Fatal);
    }

    #[test]
    fn same_credentials_slot_is_preferred() {
        let mut p = pool(1, 3);
        // bind cas 1 to the user, then release it
        p.cas_mut(0, 1).unwrap().database_user = "shard".into();
        p.cas_mut(0, 1).unwrap().database_passwd = "shard123".into();
        let out = p.alloc_by_ctx(&req(-1, -1, CTX, FuncCode::Prepare));
        assert!(matches!(
            out,
            CasAllocOutcome::Assigned { cas_id: 1, credentials_changed: false, .. }
        ));
    }

    #[test]
    fn exhausted_shard_parks_waiter_in_deadline_order() {
        let mut p = pool(1, 1);
        assert!(matches!(
            p.alloc_by_ctx(&req(0, -1, CTX, FuncCode::Prepare)),
            CasAllocOutcome::Assigned { .. }
        ));
        let mut r2 = req(0, -1, CTX2, FuncCode::Prepare);
        r2.timeout = 5;
        assert_eq!(p.alloc_by_ctx(&r2), CasAllocOutcome::Wait { shard_id: 0 });
        let mut r3 = req(0, -1, CtxHandle { cid: 2, uid: 3 }, FuncCode::Prepare);
        r3.timeout = 1;
        assert_eq!(p.alloc_by_ctx(&r3), CasAllocOutcome::Wait { shard_id: 0 });

        // earlier deadline first
        assert_eq!(p.pop_waiter(0).unwrap().ctx_cid, 2);
        assert_eq!(p.pop_waiter(0).unwrap().ctx_cid, 1);
        assert!(p.pop_waiter(0).is_none());
    }

    #[test]
    fn release_requires_owner() {
        let mut p = pool(1, 1);
        let CasAllocOutcome::Assigned { shard_id, cas_id, .. } =
            p.alloc_by_ctx(&req(0, -1, CTX, FuncCode::Prepare))
        else {
            panic!();
        };
        assert!(!p.release_by_ctx(shard_id, cas_id, CTX2));
        assert!(p.release_by_ctx(shard_id, cas_id, CTX));
        assert_eq!(p.shard(0).unwrap().num_cas_in_tran, 0);
        // double release is rejected
        assert!(!p.release_by_ctx(shard_id, cas_id, CTX));
    }

    #[test]
    fn close_cas_reports_owner_and_drops_counts() {
        let mut p = pool(1, 2);
        let CasAllocOutcome::Assigned { shard_id, cas_id, .. } =
            p.alloc_by_ctx(&req(0, -1, CTX, FuncCode::Prepare))
        else {
            panic!();
        };
        let owner = p.close_cas(shard_id, cas_id).unwrap();
        assert_eq!(owner, CTX);
        let shard = p.shard(0).unwrap();
        assert_eq!(shard.cur_num_cas, 1);
        assert_eq!(shard.num_cas_in_tran, 0);
        assert_eq!(shard.cas(cas_id).unwrap().status, CasStatus::NotConnected);
    }

    #[test]
    fn round_robin_skips_full_shards() {
        let mut p = pool(3, 1);
        // fill shard the cursor would pick first by occupying everything
        for cid in 0..3 {
            let ctx = CtxHandle { cid, uid: cid as u32 + 1 };
            assert!(matches!(
                p.alloc_by_ctx(&req(-1, -1, ctx, FuncCode::Prepare)),
                CasAllocOutcome::Assigned { .. }
            ));
        }
        // all shards now busy
        assert!(matches!(
            p.alloc_by_ctx(&req(-1, -1, CtxHandle { cid: 9, uid: 9 }, FuncCode::Prepare)),
            CasAllocOutcome::Wait { .. }
        ));
    }
}
