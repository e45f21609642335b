//! The prepared-statement cache.
//!
//! Entries are keyed by rewritten SQL + database user + protocol bucket.
//! Unpinned entries sit on an intrusive LRU list and are evicted from its
//! tail; pinned entries leave the list until the last pin drops. A statement
//! being prepared is `InProgress` and owns a wait queue of contexts that
//! asked for the same key; the first successful prepare completes the entry
//! and wakes them all.

use std::collections::{HashMap, VecDeque};

use log::{debug, error};

use shardcast_proto::version::BrokerVersion;

use crate::context::CtxHandle;
use crate::parser::{Hint, HintType};
use crate::queue::{WaitContext, WaitQueue};
use crate::INVALID_ID;

pub const STMT_INVALID_HANDLE_ID: i32 = -1;

const STMT_INDEX_BITS: u32 = 20;
const STMT_INDEX_MASK: i32 = (1 << STMT_INDEX_BITS) - 1;
const STMT_GEN_MAX: u32 = (1 << (31 - STMT_INDEX_BITS)) - 1;

fn pack_handle(index: usize, generation: u32) -> i32 {
    ((generation as i32) << STMT_INDEX_BITS) | index as i32
}

fn unpack_index(handle: i32) -> Option<usize> {
    (handle > 0).then_some((handle & STMT_INDEX_MASK) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtStatus {
    Unused,
    InProgress,
    Complete,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtType {
    /// Cached and shared across contexts.
    Prepared,
    /// Schema-info request; per-context, freed at end of transaction.
    SchemaInfo,
    /// Prepare-and-execute or a duplicate prepare in one transaction;
    /// per-context, bypasses the cache.
    Exclusive,
}

#[derive(Debug)]
pub struct Stmt {
    index: usize,
    pub stmt_h_id: i32,
    pub status: StmtStatus,
    pub stmt_type: StmtType,
    pub client_version: BrokerVersion,
    pub sql_stmt: String,
    pub hints: Vec<Hint>,
    pub bind_count: usize,
    pub database_user: String,

    /// Owning context while `InProgress`.
    pub ctx_cid: i32,
    pub ctx_uid: u32,

    pub num_pinned: i32,
    lru_prev: Option<usize>,
    lru_next: Option<usize>,

    /// Saved prepare request, replayed for prepare-for-execute.
    pub request_buffer: Vec<u8>,
    /// Saved prepare reply, served to later clients of the same key.
    pub reply_buffer: Vec<u8>,

    srv_h_ids: Vec<i32>,
    pub waitq: WaitQueue,
}

impl Stmt {
    pub fn hint_type(&self) -> HintType {
        self.hints.first().map(|h| h.hint_type).unwrap_or(HintType::None)
    }

    pub fn has_static_hint(&self) -> bool {
        self.hints.iter().any(|h| h.is_static())
    }

    pub fn owner(&self) -> CtxHandle {
        CtxHandle {
            cid: self.ctx_cid,
            uid: self.ctx_uid,
        }
    }
}

pub struct StmtPool {
    max_num_shard: usize,
    num_cas_per_shard: usize,
    ents: Vec<Stmt>,
    /// sql text -> entry indices with that text (user/version disambiguate).
    map: HashMap<String, Vec<usize>>,
    freeq: VecDeque<usize>,
    lru: Option<usize>,
    mru: Option<usize>,
    next_gen: u32,
    case_sensitive_users: bool,
}

impl StmtPool {
    pub fn new(
        max_num_stmt: usize,
        max_num_shard: usize,
        num_cas_per_shard: usize,
        case_sensitive_users: bool,
    ) -> Self {
        let max_num_stmt = max_num_stmt.min(STMT_INDEX_MASK as usize);
        Self {
            max_num_shard,
            num_cas_per_shard,
            ents: (0..max_num_stmt)
                .map(|index| Stmt {
                    index,
                    stmt_h_id: STMT_INVALID_HANDLE_ID,
                    status: StmtStatus::Unused,
                    stmt_type: StmtType::Prepared,
                    client_version: 0,
                    sql_stmt: String::new(),
                    hints: Vec::new(),
                    bind_count: 0,
                    database_user: String::new(),
                    ctx_cid: INVALID_ID,
                    ctx_uid: 0,
                    num_pinned: 0,
                    lru_prev: None,
                    lru_next: None,
                    request_buffer: Vec::new(),
                    reply_buffer: Vec::new(),
                    srv_h_ids: vec![STMT_INVALID_HANDLE_ID; max_num_shard * num_cas_per_shard],
                    waitq: WaitQueue::default(),
                })
                .collect(),
            map: HashMap::new(),
            freeq: (0..max_num_stmt).collect(),
            lru: None,
            mru: None,
            next_gen: 0,
            case_sensitive_users,
        }
    }

    pub fn get(&self, handle: i32) -> Option<&Stmt> {
        let index = unpack_index(handle)?;
        let stmt = self.ents.get(index)?;
        (stmt.status != StmtStatus::Unused && stmt.stmt_h_id == handle).then_some(stmt)
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut Stmt> {
        let index = unpack_index(handle)?;
        let stmt = self.ents.get_mut(index)?;
        (stmt.status != StmtStatus::Unused && stmt.stmt_h_id == handle).then_some(stmt)
    }

    /// Cache lookup. Unused and invalidated entries never match.
    pub fn find_by_sql(
        &self,
        sql: &str,
        db_user: &str,
        version_bucket: BrokerVersion,
    ) -> Option<i32> {
        let bucket = self.map.get(sql)?;
        for &index in bucket {
            let stmt = &self.ents[index];
            if stmt.stmt_type != StmtType::Prepared {
                continue;
            }
            if matches!(stmt.status, StmtStatus::Unused | StmtStatus::Invalid) {
                continue;
            }
            if stmt.client_version != version_bucket {
                continue;
            }
            let user_match = if self.case_sensitive_users {
                stmt.database_user == db_user
            } else {
                stmt.database_user.eq_ignore_ascii_case(db_user)
            };
            if !user_match {
                continue;
            }
            debug_assert_eq!(stmt.sql_stmt, sql);
            return Some(stmt.stmt_h_id);
        }
        None
    }

    /// Creates a statement in `InProgress`, reusing an unused slot or
    /// evicting the LRU tail. `None` means the pool is exhausted by pinned
    /// entries, which is fatal for the requesting context.
    #[allow(clippy::too_many_arguments)]
    pub fn new_statement(
        &mut self,
        stmt_type: StmtType,
        sql: String,
        hints: Vec<Hint>,
        bind_count: usize,
        db_user: &str,
        version_bucket: BrokerVersion,
        owner: CtxHandle,
    ) -> Option<i32> {
        let index = match self.freeq.pop_front() {
            Some(index) => index,
            None => {
                let victim = self.lru?;
                debug!(
                    "evicting lru statement. (index:{}, sql:{})",
                    victim, self.ents[victim].sql_stmt
                );
                self.free_index(victim);
                self.freeq.pop_front()?
            }
        };

        self.next_gen += 1;
        if self.next_gen > STMT_GEN_MAX {
            self.next_gen = 1;
        }
        let handle = pack_handle(index, self.next_gen);

        let map_slot = matches!(stmt_type, StmtType::Prepared).then(|| sql.clone());

        let stmt = &mut self.ents[index];
        debug_assert_eq!(stmt.status, StmtStatus::Unused);
        debug_assert!(stmt.waitq.is_empty());
        stmt.stmt_h_id = handle;
        stmt.status = StmtStatus::InProgress;
        stmt.stmt_type = stmt_type;
        stmt.client_version = version_bucket;
        stmt.sql_stmt = sql;
        stmt.hints = hints;
        stmt.bind_count = bind_count;
        stmt.database_user = db_user.to_string();
        stmt.ctx_cid = owner.cid;
        stmt.ctx_uid = owner.uid;
        stmt.num_pinned = 0;
        stmt.request_buffer.clear();
        stmt.reply_buffer.clear();
        stmt.srv_h_ids.fill(STMT_INVALID_HANDLE_ID);

        if let Some(sql_key) = map_slot {
            self.map.entry(sql_key).or_default().push(index);
        }
        // A fresh statement is immediately pinned by its owner, so it starts
        // outside the LRU.
        Some(handle)
    }

    pub fn pin(&mut self, handle: i32) -> Result<(), ()> {
        let Some(index) = self.valid_index(handle) else {
            error!("pin of invalid statement handle. (stmt_h_id:{})", handle);
            return Err(());
        };
        self.ents[index].num_pinned += 1;
        if self.in_lru(index) {
            self.lru_delete(index);
        }
        Ok(())
    }

    /// Drops one pin. Frees the entry outright when the last pin leaves a
    /// non-cacheable or invalidated statement behind.
    pub fn unpin(&mut self, handle: i32) {
        let Some(index) = self.valid_index(handle) else {
            return;
        };
        let stmt = &mut self.ents[index];
        stmt.num_pinned -= 1;
        debug_assert!(stmt.num_pinned >= 0);
        if stmt.num_pinned > 0 {
            return;
        }
        stmt.num_pinned = 0;
        if stmt.status == StmtStatus::Invalid || stmt.stmt_type != StmtType::Prepared {
            self.free_index(index);
        } else {
            self.lru_insert(index);
        }
    }

    fn srv_pos(&self, shard_id: i32, cas_id: i32) -> Option<usize> {
        if !(0..self.max_num_shard as i32).contains(&shard_id)
            || !(0..self.num_cas_per_shard as i32).contains(&cas_id)
        {
            error!(
                "invalid shard/cas for server handle map. (shard_id:{}, cas_id:{})",
                shard_id, cas_id
            );
            return None;
        }
        Some(shard_id as usize * self.num_cas_per_shard + cas_id as usize)
    }

    pub fn srv_h_id(&self, handle: i32, shard_id: i32, cas_id: i32) -> i32 {
        let Some(stmt) = self.get(handle) else {
            return STMT_INVALID_HANDLE_ID;
        };
        match self.srv_pos(shard_id, cas_id) {
            Some(pos) => stmt.srv_h_ids[pos],
            None => STMT_INVALID_HANDLE_ID,
        }
    }

    /// Stores a server handle for `(shard, cas)`. The first store on an
    /// in-progress statement completes it; the drained waiters are returned
    /// for the caller to wake.
    pub fn add_srv_h_id(
        &mut self,
        handle: i32,
        shard_id: i32,
        cas_id: i32,
        srv_h_id: i32,
    ) -> Result<Vec<WaitContext>, ()> {
        let pos = self.srv_pos(shard_id, cas_id).ok_or(())?;
        let Some(index) = self.valid_index(handle) else {
            return Err(());
        };
        let stmt = &mut self.ents[index];
        stmt.srv_h_ids[pos] = srv_h_id;
        if stmt.status != StmtStatus::InProgress {
            return Ok(Vec::new());
        }
        stmt.status = StmtStatus::Complete;
        stmt.ctx_cid = INVALID_ID;
        stmt.ctx_uid = 0;
        let mut waiters = Vec::new();
        while let Some(w) = stmt.waitq.dequeue() {
            waiters.push(w);
        }
        Ok(waiters)
    }

    pub fn del_srv_h_id(&mut self, handle: i32, shard_id: i32, cas_id: i32) {
        if let Some(pos) = self.srv_pos(shard_id, cas_id) {
            if let Some(index) = self.valid_index(handle) {
                self.ents[index].srv_h_ids[pos] = STMT_INVALID_HANDLE_ID;
            }
        }
    }

    /// Drops every server handle bound through `(shard, cas)`, after a CAS
    /// disconnect or credential change.
    pub fn reset_srv_h_ids_for_cas(&mut self, shard_id: i32, cas_id: i32) {
        let Some(pos) = self.srv_pos(shard_id, cas_id) else {
            return;
        };
        for stmt in &mut self.ents {
            if stmt.status != StmtStatus::Unused {
                stmt.srv_h_ids[pos] = STMT_INVALID_HANDLE_ID;
            }
        }
    }

    /// Marks a statement invalid. Freed immediately when unpinned, else on
    /// the last unpin.
    pub fn invalidate(&mut self, handle: i32) {
        let Some(index) = self.valid_index(handle) else {
            return;
        };
        let stmt = &mut self.ents[index];
        stmt.status = StmtStatus::Invalid;
        if stmt.num_pinned == 0 {
            self.free_index(index);
        }
    }

    /// Clears the owner and drains the wait queue of an in-progress
    /// statement whose prepare will never complete.
    pub fn abandon(&mut self, handle: i32) -> Vec<WaitContext> {
        let Some(index) = self.valid_index(handle) else {
            return Vec::new();
        };
        let stmt = &mut self.ents[index];
        stmt.ctx_cid = INVALID_ID;
        stmt.ctx_uid = 0;
        let mut waiters = Vec::new();
        while let Some(w) = stmt.waitq.dequeue() {
            waiters.push(w);
        }
        waiters
    }

    /// Frees a statement regardless of status. Only correct when no context
    /// still pins it.
    pub fn free(&mut self, handle: i32) {
        if let Some(index) = self.valid_index(handle) {
            self.free_index(index);
        }
    }

    /// Pops expired prepare waiters across all statements.
    pub fn pop_expired_waiters(&mut self, now: i64) -> Vec<WaitContext> {
        let mut expired = Vec::new();
        for stmt in &mut self.ents {
            if stmt.status != StmtStatus::Unused && !stmt.waitq.is_empty() {
                expired.extend(stmt.waitq.pop_expired(now));
            }
        }
        expired
    }

    /// Recycles invalidated entries that nobody pins anymore.
    pub fn recycle_invalid(&mut self) {
        let victims: Vec<usize> = self
            .ents
            .iter()
            .filter(|s| s.status == StmtStatus::Invalid && s.num_pinned == 0)
            .map(|s| s.index)
            .collect();
        for index in victims {
            self.free_index(index);
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.ents
            .iter()
            .filter(|s| s.status != StmtStatus::Unused)
            .count()
    }

    pub fn lru_len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.lru;
        while let Some(index) = cursor {
            n += 1;
            cursor = self.ents[index].lru_next;
        }
        n
    }

    fn valid_index(&self, handle: i32) -> Option<usize> {
        let index = unpack_index(handle)?;
        let stmt = self.ents.get(index)?;
        (stmt.status != StmtStatus::Unused && stmt.stmt_h_id == handle).then_some(index)
    }

    fn in_lru(&self, index: usize) -> bool {
        let stmt = &self.ents[index];
        stmt.lru_prev.is_some() || stmt.lru_next.is_some() || self.lru == Some(index)
    }

    fn lru_insert(&mut self, index: usize) {
        debug_assert!(!self.in_lru(index));
        debug_assert_eq!(self.ents[index].num_pinned, 0);
        self.ents[index].lru_next = None;
        self.ents[index].lru_prev = self.mru;
        if let Some(mru) = self.mru {
            self.ents[mru].lru_next = Some(index);
        } else {
            self.lru = Some(index);
        }
        self.mru = Some(index);
    }

    fn lru_delete(&mut self, index: usize) {
        let (prev, next) = {
            let stmt = &self.ents[index];
            (stmt.lru_prev, stmt.lru_next)
        };
        match next {
            Some(next) => self.ents[next].lru_prev = prev,
            None => self.mru = prev,
        }
        match prev {
            Some(prev) => self.ents[prev].lru_next = next,
            None => self.lru = next,
        }
        self.ents[index].lru_prev = None;
        self.ents[index].lru_next = None;
    }

    fn free_index(&mut self, index: usize) {
        if self.in_lru(index) {
            self.lru_delete(index);
        }
        let (sql, is_prepared) = {
            let stmt = &self.ents[index];
            (stmt.sql_stmt.clone(), stmt.stmt_type == StmtType::Prepared)
        };
        if is_prepared {
            if let Some(bucket) = self.map.get_mut(&sql) {
                bucket.retain(|&i| i != index);
                if bucket.is_empty() {
                    self.map.remove(&sql);
                }
            }
        }
        let stmt = &mut self.ents[index];
        stmt.stmt_h_id = STMT_INVALID_HANDLE_ID;
        stmt.status = StmtStatus::Unused;
        stmt.stmt_type = StmtType::Prepared;
        stmt.sql_stmt.clear();
        stmt.hints.clear();
        stmt.bind_count = 0;
        stmt.database_user.clear();
        stmt.ctx_cid = INVALID_ID;
        stmt.ctx_uid = 0;
        stmt.num_pinned = 0;
        stmt.request_buffer.clear();
        stmt.reply_buffer.clear();
        stmt.srv_h_ids.fill(STMT_INVALID_HANDLE_ID);
        stmt.waitq.clear();
        self.freeq.push_back(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcast_proto::version;

    const OWNER: CtxHandle = CtxHandle { cid: 0, uid: 1 };
    const OTHER: CtxHandle = CtxHandle { cid: 1, uid: 2 };

    fn bucket() -> BrokerVersion {
        version::protocol_bucket(version::proto_ver(version::PROTOCOL_V2))
    }

    fn pool(size: usize) -> StmtPool {
        StmtPool::new(size, 2, 2, false)
    }

    fn new_prepared(pool: &mut StmtPool, sql: &str, owner: CtxHandle) -> i32 {
        pool.new_statement(
            StmtType::Prepared,
            sql.to_string(),
            Vec::new(),
            0,
            "shard",
            bucket(),
            owner,
        )
        .unwrap()
    }

    #[test]
    fn find_skips_invalid_and_matches_user_case_insensitively() {
        let mut p = pool(4);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        assert_eq!(p.find_by_sql("SELECT 1", "SHARD", bucket()), Some(h));
        assert_eq!(p.find_by_sql("SELECT 1", "other", bucket()), None);
        assert_eq!(p.find_by_sql("SELECT 2", "shard", bucket()), None);

        p.pin(h).unwrap();
        p.invalidate(h);
        assert_eq!(p.find_by_sql("SELECT 1", "shard", bucket()), None);
    }

    #[test]
    fn version_buckets_are_distinct_keys() {
        let mut p = pool(4);
        let old_bucket = version::protocol_bucket(version::make_ver(8, 2, 0));
        let h = p
            .new_statement(
                StmtType::Prepared,
                "SELECT 1".into(),
                Vec::new(),
                0,
                "shard",
                old_bucket,
                OWNER,
            )
            .unwrap();
        assert_eq!(p.find_by_sql("SELECT 1", "shard", old_bucket), Some(h));
        assert_eq!(p.find_by_sql("SELECT 1", "shard", bucket()), None);
    }

    #[test]
    fn complete_transition_wakes_waiters_once() {
        let mut p = pool(4);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        p.get_mut(h)
            .unwrap()
            .waitq
            .ordered_insert(WaitContext::new(OTHER.cid, OTHER.uid, 10, 100));

        let waiters = p.add_srv_h_id(h, 0, 0, 42).unwrap();
        assert_eq!(waiters.len(), 1);
        assert_eq!(p.get(h).unwrap().status, StmtStatus::Complete);
        assert_eq!(p.srv_h_id(h, 0, 0), 42);
        assert_eq!(p.srv_h_id(h, 1, 1), STMT_INVALID_HANDLE_ID);

        // second store on another cas: no transition, no waiters
        let waiters = p.add_srv_h_id(h, 1, 0, 43).unwrap();
        assert!(waiters.is_empty());
    }

    #[test]
    fn pin_count_and_lru_membership_are_complementary() {
        let mut p = pool(4);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        p.add_srv_h_id(h, 0, 0, 42).unwrap();
        assert_eq!(p.lru_len(), 0);

        p.pin(h).unwrap();
        p.pin(h).unwrap();
        p.unpin(h);
        assert_eq!(p.lru_len(), 0); // still pinned once
        p.unpin(h);
        assert_eq!(p.lru_len(), 1); // pin count zero -> in LRU
        p.pin(h).unwrap();
        assert_eq!(p.lru_len(), 0);
        p.unpin(h);
    }

    #[test]
    fn eviction_takes_lru_tail_and_stale_handles_die() {
        let mut p = pool(2);
        let h1 = new_prepared(&mut p, "SELECT 1", OWNER);
        let h2 = new_prepared(&mut p, "SELECT 2", OWNER);
        for &h in &[h1, h2] {
            p.add_srv_h_id(h, 0, 0, 7).unwrap();
            p.pin(h).unwrap();
            p.unpin(h);
        }
        // h1 is the LRU tail; creating a third statement evicts it.
        let h3 = new_prepared(&mut p, "SELECT 3", OWNER);
        assert!(p.get(h1).is_none());
        assert!(p.get(h2).is_some());
        assert!(p.get(h3).is_some());
        assert_eq!(p.find_by_sql("SELECT 1", "shard", bucket()), None);
    }

    #[test]
    fn pool_of_pinned_statements_cannot_grow() {
        let mut p = pool(1);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        p.pin(h).unwrap();
        assert!(p
            .new_statement(
                StmtType::Prepared,
                "SELECT 2".into(),
                Vec::new(),
                0,
                "shard",
                bucket(),
                OWNER,
            )
            .is_none());
    }

    #[test]
    fn invalid_statement_is_freed_when_last_pin_drops() {
        let mut p = pool(2);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        p.add_srv_h_id(h, 0, 0, 7).unwrap();
        p.pin(h).unwrap();
        p.pin(h).unwrap();
        p.invalidate(h);
        assert!(p.get(h).is_some()); // pinned, stays
        p.unpin(h);
        assert!(p.get(h).is_some());
        p.unpin(h);
        assert!(p.get(h).is_none());
        assert_eq!(p.in_use_count(), 0);
    }

    #[test]
    fn exclusive_statement_dies_on_unpin() {
        let mut p = pool(2);
        let h = p
            .new_statement(
                StmtType::Exclusive,
                "SELECT 1".into(),
                Vec::new(),
                0,
                "shard",
                bucket(),
                OWNER,
            )
            .unwrap();
        // exclusive statements never enter the lookup map
        assert_eq!(p.find_by_sql("SELECT 1", "shard", bucket()), None);
        p.pin(h).unwrap();
        p.unpin(h);
        assert!(p.get(h).is_none());
    }

    #[test]
    fn cas_disconnect_clears_server_handles() {
        let mut p = pool(2);
        let h = new_prepared(&mut p, "SELECT 1", OWNER);
        p.add_srv_h_id(h, 0, 1, 42).unwrap();
        p.add_srv_h_id(h, 1, 1, 43).unwrap();
        p.reset_srv_h_ids_for_cas(0, 1);
        assert_eq!(p.srv_h_id(h, 0, 1), STMT_INVALID_HANDLE_ID);
        assert_eq!(p.srv_h_id(h, 1, 1), 43);
    }
}
