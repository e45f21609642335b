//! Client slot table. One slot per driver connection, bound to its context
//! for the connection's lifetime.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use shardcast_proto::version::{self, BrokerVersion, DRIVER_INFO_SIZE};

use crate::context::CtxHandle;
use crate::INVALID_ID;

#[derive(Debug)]
pub struct ClientIo {
    pub client_id: i32,
    pub is_busy: bool,
    pub fd: RawFd,
    pub ctx_cid: i32,
    pub ctx_uid: u32,
    pub driver_info: [u8; DRIVER_INFO_SIZE],
}

impl ClientIo {
    pub fn client_version(&self) -> BrokerVersion {
        version::version_from_driver_info(&self.driver_info)
    }

    pub fn renewed_error_capability(&self) -> bool {
        version::has_capability(&self.driver_info, version::CAP_RENEWED_ERROR_CODE)
    }

    pub fn bind_context(&mut self, handle: CtxHandle) {
        self.ctx_cid = handle.cid;
        self.ctx_uid = handle.uid;
    }

    pub fn context(&self) -> CtxHandle {
        CtxHandle {
            cid: self.ctx_cid,
            uid: self.ctx_uid,
        }
    }
}

pub struct ClientIoPool {
    ents: Vec<ClientIo>,
    freeq: VecDeque<usize>,
}

impl ClientIoPool {
    pub fn new(max_client: usize) -> Self {
        Self {
            ents: (0..max_client)
                .map(|i| ClientIo {
                    client_id: i as i32,
                    is_busy: false,
                    fd: -1,
                    ctx_cid: INVALID_ID,
                    ctx_uid: 0,
                    driver_info: [0; DRIVER_INFO_SIZE],
                })
                .collect(),
            freeq: (0..max_client).collect(),
        }
    }

    /// Binds a new client fd to a slot. `None` when max_client is reached.
    pub fn alloc(&mut self, fd: RawFd) -> Option<i32> {
        let slot = self.freeq.pop_front()?;
        let ent = &mut self.ents[slot];
        ent.is_busy = true;
        ent.fd = fd;
        ent.ctx_cid = INVALID_ID;
        ent.ctx_uid = 0;
        ent.driver_info = [0; DRIVER_INFO_SIZE];
        Some(ent.client_id)
    }

    pub fn get(&self, client_id: i32) -> Option<&ClientIo> {
        let ent = self.ents.get(client_id as usize)?;
        ent.is_busy.then_some(ent)
    }

    pub fn get_mut(&mut self, client_id: i32) -> Option<&mut ClientIo> {
        let ent = self.ents.get_mut(client_id as usize)?;
        ent.is_busy.then_some(ent)
    }

    /// Releases the slot and hands back the fd for the caller to close.
    pub fn free(&mut self, client_id: i32) -> Option<RawFd> {
        let ent = self.ents.get_mut(client_id as usize)?;
        if !ent.is_busy {
            return None;
        }
        let fd = ent.fd;
        ent.is_busy = false;
        ent.fd = -1;
        ent.ctx_cid = INVALID_ID;
        ent.ctx_uid = 0;
        self.freeq.push_back(client_id as usize);
        Some(fd)
    }

    pub fn busy_count(&self) -> usize {
        self.ents.iter().filter(|e| e.is_busy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let mut pool = ClientIoPool::new(2);
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(11).unwrap();
        assert!(pool.alloc(12).is_none());

        assert_eq!(pool.free(a), Some(10));
        assert!(pool.get(a).is_none());
        let c = pool.alloc(13).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.get(b).unwrap().fd, 11);
    }

    #[test]
    fn context_binding() {
        let mut pool = ClientIoPool::new(1);
        let id = pool.alloc(9).unwrap();
        let handle = CtxHandle { cid: 4, uid: 77 };
        pool.get_mut(id).unwrap().bind_context(handle);
        assert_eq!(pool.get(id).unwrap().context(), handle);
    }
}
