//! Proxy events. One event owns one message buffer; ownership moves between
//! the socket read slot, handler locals, the dispatch queues, a context's
//! parked `waiting_event` and a socket write slot, never shared.

use crate::INVALID_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    IoRead,
    IoWrite,
    ClientRequest,
    CasResponse,
    ClientConnError,
    CasConnError,
    WakeupByShard,
    WakeupByStatement,
}

/// A message buffer with a read/write cursor. `data.len()` is the expected
/// total length; `offset` is how much has been transferred so far.
#[derive(Debug, Clone, Default)]
pub struct IoBuffer {
    pub data: Vec<u8>,
    pub offset: usize,
}

impl IoBuffer {
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            offset: 0,
        }
    }

    pub fn from_message(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.data.len()
    }

    /// Extends the expected length, keeping already-read bytes.
    pub fn grow_to(&mut self, len: usize) {
        debug_assert!(len >= self.data.len());
        self.data.resize(len, 0);
    }
}

#[derive(Debug, Clone)]
pub struct ProxyEvent {
    pub kind: EventKind,
    pub from_cas: bool,
    pub cid: i32,
    pub uid: u32,
    pub shard_id: i32,
    pub cas_id: i32,
    pub buffer: IoBuffer,
}

pub const FROM_CAS: bool = true;
pub const FROM_CLIENT: bool = false;

impl ProxyEvent {
    pub fn new(kind: EventKind, from_cas: bool) -> Self {
        Self {
            kind,
            from_cas,
            cid: INVALID_ID,
            uid: 0,
            shard_id: INVALID_ID,
            cas_id: INVALID_ID,
            buffer: IoBuffer::default(),
        }
    }

    pub fn with_message(kind: EventKind, from_cas: bool, message: Vec<u8>) -> Self {
        let mut event = Self::new(kind, from_cas);
        event.buffer = IoBuffer::from_message(message);
        event
    }

    pub fn set_context(&mut self, cid: i32, uid: u32) {
        self.cid = cid;
        self.uid = uid;
    }

    pub fn set_shard(&mut self, shard_id: i32, cas_id: i32) {
        self.shard_id = shard_id;
        self.cas_id = cas_id;
    }

    pub fn msg(&self) -> &[u8] {
        &self.buffer.data
    }

    pub fn msg_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }
}
