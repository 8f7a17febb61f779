use super::*;
use common::*;

/// Per-buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufStatus {
    /// content idle, recyclable once unreferenced
    Free,
    /// a read or a write is in flight, the caller that set it owns the I/O
    Busy,
    /// modified, written back when the last holder releases it
    Dirty,
    /// modified, written back before the buffer is recycled or on sync
    DelayedWrite,
}

impl BufStatus {
    /// content newer than the disk copy?
    pub fn needs_writeback(self) -> bool {
        matches!(self, BufStatus::Dirty | BufStatus::DelayedWrite)
    }
}

/// Hash chain links. Chains are not circular: `prev == None` means bucket head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashLinks {
    pub prev: Option<SlotId>,
    pub next: Option<SlotId>,
}

/// Free ring links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLinks {
    pub prev: SlotId,
    pub next: SlotId,
}

/// Metadata of one buffer slot; the payload lives next to it in the pool.
/// All fields are guarded by the cache lock.
#[derive(Debug)]
pub struct Buffer {
    pub dev: DevId,
    pub blockno: BlockNo,
    pub status: BufStatus,
    /// has data been read from disk?
    pub valid: bool,
    /// state to return to: marked again while a write of it was in flight
    pub redirty: Option<BufStatus>,
    refcnt: u32,
    /// Some iff the buffer is in the hash index
    pub(crate) hash: Option<HashLinks>,
    /// Some iff the buffer is on the free list
    pub(crate) free: Option<RingLinks>,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer {
            dev: NODEV,
            blockno: 0,
            status: BufStatus::Free,
            valid: false,
            redirty: None,
            refcnt: 0,
            hash: None,
            free: None,
        }
    }
}

impl Buffer {
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn is_bound(&self) -> bool {
        self.hash.is_some()
    }

    pub fn on_free_list(&self) -> bool {
        self.free.is_some()
    }

    pub fn bpin(&mut self) {
        self.refcnt += 1;
    }

    pub fn bunpin(&mut self) {
        match self.refcnt.checked_sub(1) {
            Some(refcnt) => self.refcnt = refcnt,
            None => panic!(
                "InvariantViolation: refcnt underflow on dev={} blockno={}",
                self.dev, self.blockno
            ),
        }
    }

    /// Take over the buffer for another block. The content is not valid yet.
    pub fn rebind(&mut self, dev: DevId, blockno: BlockNo) {
        debug_assert!(!self.is_bound() && !self.on_free_list());
        self.dev = dev;
        self.blockno = blockno;
        self.valid = false;
        self.redirty = None;
    }

    /// Leave `Busy` after a write. A failed write keeps the content dirty,
    /// otherwise a mark made during the write is restored.
    pub fn finish_write(&mut self, ok: bool) {
        debug_assert_eq!(self.status, BufStatus::Busy);
        let redirty = self.redirty.take();
        self.status = match redirty {
            _ if !ok => BufStatus::Dirty,
            Some(status) => status,
            None => BufStatus::Free,
        };
    }
}
