//! Buffer cache.
//!
//! A fixed pool of block-sized buffers holding cached copies of disk blocks,
//! shared by every caller. At most one buffer holds a given (dev, blockno).
//!
//! Interface:
//! * `get_block` returns a pinned buffer with the block's content.
//! * `data_mut` (or `mark_dirty`) after changing the content.
//! * `release_block` when done; the last holder of a dirty buffer writes it back.
//! * `sync_device` writes back everything still dirty on a device.
//!
//! Hash index, free list and buffer states are guarded by one lock. Device I/O
//! runs without it: the buffer is `Busy` meanwhile, and whoever set `Busy` does the I/O.

use super::*;
use blk_dev::BlockDevice;
use buf::{BufStatus, Buffer};
use common::*;
use config::CacheConfig;
use error::{Error, Result};
use free_list::FreeList;
use hash::HashIndex;

use log::{debug, trace, warn};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// get_block served from the cache
    pub hits: u64,
    /// get_block that had to read the device
    pub misses: u64,
    /// device reads issued
    pub reads: u64,
    /// device writes issued
    pub writes: u64,
    /// dirty buffers written back before being recycled
    pub recycle_flushes: u64,
    /// of those, writes that failed and left the buffer dirty
    pub recycle_flush_failures: u64,
    /// times a caller slept on an empty free list
    pub exhausted_waits: u64,
    /// times a caller slept on a busy buffer
    pub busy_waits: u64,
}

struct Inner {
    bufs: Vec<Buffer>,
    hash: HashIndex,
    free: FreeList,
    stats: CacheStats,
}

struct Slot {
    data: RwLock<Box<[u8]>>,
    /// signalled whenever the buffer leaves `Busy`
    idle: Condvar,
}

enum Acquired {
    /// content valid
    Cached(SlotId),
    /// freshly bound and `Busy`, the caller reads it in
    Fresh(SlotId),
}

pub struct BufCache {
    config: CacheConfig,
    blk_dev: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
    slots: Vec<Slot>,
    /// signalled whenever a buffer reaches the free list
    freed: Condvar,
}

impl BufCache {
    pub fn new(config: CacheConfig, blk_dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        config.validate()?;

        let mut bufs: Vec<Buffer> = (0..config.pool_capacity)
            .map(|_| Buffer::default())
            .collect();
        let mut free = FreeList::new();
        for id in 0..config.pool_capacity {
            free.push_back(&mut bufs, id);
        }
        let slots = (0..config.pool_capacity)
            .map(|_| Slot {
                data: RwLock::new(vec![0u8; config.block_size].into_boxed_slice()),
                idle: Condvar::new(),
            })
            .collect();
        debug!(
            "bcache: {} buffers of {} bytes, {} hash buckets",
            config.pool_capacity, config.block_size, config.hash_table_size
        );

        Ok(Arc::new(Self {
            config,
            blk_dev,
            inner: Mutex::new(Inner {
                bufs,
                hash: HashIndex::new(config.hash_table_size),
                free,
                stats: CacheStats::default(),
            }),
            slots,
            freed: Condvar::new(),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Return a pinned buffer holding the content of (dev, blockno), reading it
    /// from the device on a miss. Blocks while the buffer is busy or the pool is
    /// fully pinned.
    pub fn get_block(&self, dev: DevId, blockno: BlockNo) -> Result<BufferHandle<'_>> {
        if dev == NODEV {
            return Err(Error::invalid_input("device 0 is reserved"));
        }
        match self.bget(dev, blockno)? {
            Acquired::Cached(id) => Ok(BufferHandle::new(self, id, dev, blockno)),
            Acquired::Fresh(id) => {
                self.bread(id, dev, blockno)?;
                Ok(BufferHandle::new(self, id, dev, blockno))
            }
        }
    }

    fn bget(&self, dev: DevId, blockno: BlockNo) -> Result<Acquired> {
        let mut inner = self.lock();
        // dirty buffers whose write-back failed during this lookup
        let mut failed: Vec<(SlotId, Error)> = Vec::new();
        loop {
            // Is the block already cached?
            if let Some(id) = inner.hash.lookup(&inner.bufs, dev, blockno) {
                let Inner { bufs, free, .. } = &mut *inner;
                free.remove(bufs, id);
                // the pin keeps it bound while we sleep
                bufs[id].bpin();
                if bufs[id].status == BufStatus::Busy {
                    inner.stats.busy_waits += 1;
                    trace!("bget: dev={} blockno={} busy, waiting", dev, blockno);
                    inner = self.wait_idle(inner, id);
                }
                if inner.bufs[id].valid {
                    inner.stats.hits += 1;
                    trace!("bget: hit dev={} blockno={} buf={}", dev, blockno, id);
                    return Ok(Acquired::Cached(id));
                }
                // the read we waited for failed, start over
                inner.bufs[id].bunpin();
                if inner.bufs[id].refcnt() == 0 {
                    self.make_free(&mut inner, id);
                }
                continue;
            }

            // Not cached. Recycle the least recently released buffer.
            let popped = {
                let Inner { bufs, free, .. } = &mut *inner;
                free.pop_front(bufs)
            };
            let Some(id) = popped else {
                inner.stats.exhausted_waits += 1;
                warn!(
                    "bget: all {} buffers pinned, waiting for dev={} blockno={}",
                    self.config.pool_capacity, dev, blockno
                );
                inner = self.freed.wait(inner).unwrap();
                continue;
            };

            if inner.bufs[id].status.needs_writeback() {
                if let Some(pos) = failed.iter().position(|(f, _)| *f == id) {
                    // went around the whole list, nothing recyclable is left
                    self.make_free(&mut inner, id);
                    let (_, err) = failed.swap_remove(pos);
                    return Err(err);
                }
                // old content goes to its own block first, then look again:
                // someone may have cached our block while the lock was dropped
                let (guard, res) = self.flush_recycled(inner, id);
                inner = guard;
                if let Err(err) = res {
                    failed.push((id, err));
                }
                continue;
            }

            let Inner {
                bufs, hash, stats, ..
            } = &mut *inner;
            if bufs[id].is_bound() {
                debug!(
                    "bget: recycle buf={} dev={} blockno={} -> dev={} blockno={}",
                    id, bufs[id].dev, bufs[id].blockno, dev, blockno
                );
            }
            hash.bind(bufs, id, dev, blockno);
            bufs[id].status = BufStatus::Busy;
            bufs[id].bpin();
            stats.misses += 1;
            return Ok(Acquired::Fresh(id));
        }
    }

    /// Read a freshly bound buffer in and clear `Busy`.
    fn bread(&self, id: SlotId, dev: DevId, blockno: BlockNo) -> Result<()> {
        let res = {
            let mut data = self.slots[id].data.write().unwrap();
            self.blk_dev.read_block(dev, blockno, &mut data)
        };

        let mut inner = self.lock();
        inner.stats.reads += 1;
        inner.bufs[id].status = BufStatus::Free;
        match res {
            Ok(()) => {
                inner.bufs[id].valid = true;
                self.slots[id].idle.notify_all();
                Ok(())
            }
            Err(err) => {
                warn!("bread: dev={} blockno={} failed: {}", dev, blockno, err);
                let Inner { bufs, hash, .. } = &mut *inner;
                hash.unbind(bufs, id);
                bufs[id].valid = false;
                self.slots[id].idle.notify_all();
                bufs[id].bunpin();
                if bufs[id].refcnt() == 0 {
                    self.make_free(&mut inner, id);
                }
                Err(err)
            }
        }
    }

    /// Write back the dirty content of a buffer just taken off the free list.
    /// On failure it stays dirty at the tail of the free list.
    fn flush_recycled<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        id: SlotId,
    ) -> (MutexGuard<'a, Inner>, Result<()>) {
        inner.stats.recycle_flushes += 1;
        debug!(
            "bget: buf={} carries dirty dev={} blockno={}, writing before reuse",
            id, inner.bufs[id].dev, inner.bufs[id].blockno
        );
        let (mut inner, res) = self.bwrite(inner, id);
        if inner.bufs[id].refcnt() == 0 {
            if inner.bufs[id].status == BufStatus::Free {
                // next in line for recycling
                let Inner { bufs, free, .. } = &mut *inner;
                free.push_front(bufs, id);
                self.freed.notify_all();
            } else {
                self.make_free(&mut inner, id);
            }
        }
        if let Err(err) = &res {
            inner.stats.recycle_flush_failures += 1;
            warn!(
                "bget: buf={} dev={} blockno={} kept dirty, write-back failed: {}",
                id, inner.bufs[id].dev, inner.bufs[id].blockno, err
            );
        }
        (inner, res)
    }

    /// Write a buffer to its block with the cache unlocked. Must not be `Busy`.
    fn bwrite<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        id: SlotId,
    ) -> (MutexGuard<'a, Inner>, Result<()>) {
        let buf = &mut inner.bufs[id];
        assert_ne!(buf.status, BufStatus::Busy);
        assert!(buf.valid && buf.is_bound());
        let (dev, blockno) = (buf.dev, buf.blockno);
        buf.status = BufStatus::Busy;
        drop(inner);

        let res = {
            let data = self.slots[id].data.read().unwrap();
            self.blk_dev.write_block(dev, blockno, &data)
        };

        let mut inner = self.lock();
        inner.stats.writes += 1;
        inner.bufs[id].finish_write(res.is_ok());
        self.slots[id].idle.notify_all();
        if let Err(err) = &res {
            warn!("bwrite: dev={} blockno={} failed: {}", dev, blockno, err);
        }
        (inner, res)
    }

    fn wait_idle<'a>(&self, inner: MutexGuard<'a, Inner>, id: SlotId) -> MutexGuard<'a, Inner> {
        self.slots[id]
            .idle
            .wait_while(inner, |inner| inner.bufs[id].status == BufStatus::Busy)
            .unwrap()
    }

    /// Put an unreferenced, idle buffer on the free list and wake anyone starved.
    /// Unbound buffers hold nothing worth keeping and go first.
    fn make_free(&self, inner: &mut Inner, id: SlotId) {
        let Inner { bufs, free, .. } = inner;
        debug_assert_eq!(bufs[id].refcnt(), 0);
        debug_assert_ne!(bufs[id].status, BufStatus::Busy);
        if bufs[id].is_bound() {
            free.push_back(bufs, id);
        } else {
            free.push_front(bufs, id);
        }
        self.freed.notify_all();
    }

    /// Drop a handle's pin. Blocks while the buffer is busy, and writes it back
    /// if it is dirty and this was the last pin.
    pub fn release_block(&self, mut handle: BufferHandle<'_>) -> Result<()> {
        assert!(
            std::ptr::eq(handle.cache, self),
            "InvariantViolation: handle for dev={} blockno={} belongs to another cache",
            handle.dev,
            handle.blockno
        );
        handle.released = true;
        self.brelse(handle.id, handle.dev, handle.blockno)
    }

    fn brelse(&self, id: SlotId, dev: DevId, blockno: BlockNo) -> Result<()> {
        let mut inner = self.lock();
        let buf = &mut inner.bufs[id];
        if buf.refcnt() == 0 || buf.dev != dev || buf.blockno != blockno {
            panic!(
                "InvariantViolation: release of dev={} blockno={} not held in buf={}",
                dev, blockno, id
            );
        }
        buf.bunpin();
        if buf.refcnt() > 0 {
            return Ok(());
        }

        loop {
            // a buffer is never recycled mid I/O
            inner = self.wait_idle(inner, id);
            if inner.bufs[id].refcnt() > 0 {
                // pinned again while we slept, the new holder owns it
                return Ok(());
            }
            if inner.bufs[id].on_free_list() {
                // whoever did the I/O already put it back
                return Ok(());
            }
            match inner.bufs[id].status {
                BufStatus::Dirty => {
                    let (guard, res) = self.bwrite(inner, id);
                    inner = guard;
                    if res.is_err() {
                        if inner.bufs[id].refcnt() == 0 {
                            self.make_free(&mut inner, id);
                        }
                        return res;
                    }
                }
                BufStatus::Free | BufStatus::DelayedWrite => {
                    self.make_free(&mut inner, id);
                    return Ok(());
                }
                BufStatus::Busy => unreachable!(),
            }
        }
    }

    /// Content changed, write it back on the last release.
    pub fn mark_dirty(&self, handle: &BufferHandle<'_>) {
        let mut inner = self.lock();
        let buf = &mut inner.bufs[handle.id];
        assert!(buf.refcnt() > 0, "InvariantViolation: mark_dirty on unpinned buffer");
        match buf.status {
            // a write of it is in flight
            BufStatus::Busy => buf.redirty = Some(BufStatus::Dirty),
            _ => buf.status = BufStatus::Dirty,
        }
    }

    /// Content changed, write it back only when the buffer gets recycled or synced.
    pub fn mark_delayed_write(&self, handle: &BufferHandle<'_>) {
        let mut inner = self.lock();
        let buf = &mut inner.bufs[handle.id];
        assert!(
            buf.refcnt() > 0,
            "InvariantViolation: mark_delayed_write on unpinned buffer"
        );
        match buf.status {
            BufStatus::Busy => buf.redirty = Some(BufStatus::DelayedWrite),
            _ => buf.status = BufStatus::DelayedWrite,
        }
    }

    /// Write a held buffer to disk now.
    pub fn write_block(&self, handle: &BufferHandle<'_>) -> Result<()> {
        let inner = self.wait_idle(self.lock(), handle.id);
        let (_inner, res) = self.bwrite(inner, handle.id);
        res
    }

    /// Write back every dirty buffer of `dev`, held or not, and wait for I/O
    /// already in flight on it. Returns the first error after trying all of
    /// them; failed buffers stay dirty.
    pub fn sync_device(&self, dev: DevId) -> Result<()> {
        let mut inner = self.lock();
        let ids = inner.hash.bound_to(&inner.bufs, dev);
        let mut first_err = None;
        let mut flushed = 0;

        for id in ids {
            if inner.bufs[id].dev == dev && inner.bufs[id].status == BufStatus::Busy {
                // someone else's write may fail and leave it dirty
                inner = self.wait_idle(inner, id);
            }
            // state may have moved on while the lock was dropped for I/O
            let buf = &inner.bufs[id];
            if buf.dev != dev || !buf.status.needs_writeback() {
                continue;
            }
            // off the free list while the write is in flight
            let Inner { bufs, free, .. } = &mut *inner;
            free.remove(bufs, id);

            let (guard, res) = self.bwrite(inner, id);
            inner = guard;
            flushed += 1;
            if inner.bufs[id].refcnt() == 0 {
                self.make_free(&mut inner, id);
            }
            if let Err(err) = res {
                first_err.get_or_insert(err);
            }
        }

        debug!("sync_device: dev={} wrote {} buffers", dev, flushed);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// `sync_device` for every device with cached blocks.
    pub fn sync_all(&self) -> Result<()> {
        let devs = {
            let inner = self.lock();
            inner.hash.devices(&inner.bufs)
        };
        let mut first_err = None;
        for dev in devs {
            if let Err(err) = self.sync_device(dev) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Forget the clean, unreferenced blocks of `dev` so they are read again next
    /// time. Held or dirty buffers are left alone. Returns how many were dropped.
    pub fn invalidate_device(&self, dev: DevId) -> usize {
        let mut inner = self.lock();
        let Inner {
            bufs, hash, free, ..
        } = &mut *inner;
        let mut dropped = 0;
        for id in hash.bound_to(bufs, dev) {
            let buf = &bufs[id];
            if buf.refcnt() > 0 || buf.status != BufStatus::Free || !buf.on_free_list() {
                continue;
            }
            hash.unbind(bufs, id);
            bufs[id].valid = false;
            free.remove(bufs, id);
            free.push_front(bufs, id);
            dropped += 1;
        }
        debug!("invalidate_device: dev={} dropped {} buffers", dev, dropped);
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    /// # of buffers on the free list
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn status_of(&self, dev: DevId, blockno: BlockNo) -> Option<BufStatus> {
        let inner = self.lock();
        inner
            .hash
            .lookup(&inner.bufs, dev, blockno)
            .map(|id| inner.bufs[id].status)
    }

    /// Panic if the bookkeeping is inconsistent. Only meaningful while no
    /// device I/O is in flight.
    pub fn check_invariants(&self) {
        let inner = self.lock();
        let listed = inner.free.ids(&inner.bufs);
        assert_eq!(listed.len(), inner.free.len());

        for (id, buf) in inner.bufs.iter().enumerate() {
            let idle = buf.refcnt() == 0 && buf.status != BufStatus::Busy;
            assert_eq!(
                buf.on_free_list(),
                idle,
                "InvariantViolation: buf={} refcnt={} status={:?} on_free_list={}",
                id,
                buf.refcnt(),
                buf.status,
                buf.on_free_list()
            );
            if buf.is_bound() {
                assert_eq!(
                    inner.hash.lookup(&inner.bufs, buf.dev, buf.blockno),
                    Some(id),
                    "InvariantViolation: dev={} blockno={} cached twice",
                    buf.dev,
                    buf.blockno
                );
            }
        }
    }
}

/// A pinned buffer. Release it with [`BufCache::release_block`]; dropping it
/// releases it as well but can only log a failed write-back.
pub struct BufferHandle<'a> {
    cache: &'a BufCache,
    id: SlotId,
    dev: DevId,
    blockno: BlockNo,
    released: bool,
}

impl<'a> BufferHandle<'a> {
    fn new(cache: &'a BufCache, id: SlotId, dev: DevId, blockno: BlockNo) -> Self {
        Self {
            cache,
            id,
            dev,
            blockno,
            released: false,
        }
    }

    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn blockno(&self) -> BlockNo {
        self.blockno
    }

    /// index of the pool buffer backing this handle
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.cache.slots[self.id].data.read().unwrap()
    }

    /// Writable content. The buffer counts as dirty from here on.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        // lock first: a write-back that starts after mark_dirty must see our bytes
        let data = self.cache.slots[self.id].data.write().unwrap();
        self.cache.mark_dirty(self);
        data
    }
}

impl fmt::Debug for BufferHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("dev", &self.dev)
            .field("blockno", &self.blockno)
            .field("slot", &self.id)
            .finish()
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.cache.brelse(self.id, self.dev, self.blockno) {
            warn!(
                "dropped handle dev={} blockno={}: write-back failed: {}",
                self.dev, self.blockno, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blk_dev::MemDisk;

    fn cache(pool_capacity: usize, hash_table_size: usize) -> Arc<BufCache> {
        let config = CacheConfig::default()
            .with_pool_capacity(pool_capacity)
            .with_hash_table_size(hash_table_size);
        BufCache::new(config, Arc::new(MemDisk::new(BSIZE))).unwrap()
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let cache = cache(5, 3);
        assert_eq!(cache.config().pool_capacity, 5);
        assert_eq!(cache.free_count(), 5);
        let inner = cache.lock();
        assert_eq!(inner.free.ids(&inner.bufs), vec![0, 1, 2, 3, 4]);
        assert!(inner.bufs.iter().all(|buf| !buf.is_bound()));
    }

    #[test]
    fn test_first_misses_use_slots_in_order() {
        let cache = cache(3, 3);
        let a = cache.get_block(1, 0).unwrap();
        let b = cache.get_block(1, 1).unwrap();
        assert_eq!(a.slot_id(), 0);
        assert_eq!(b.slot_id(), 1);
    }

    #[test]
    fn test_same_blockno_on_two_devices() {
        // a single bucket, so both land in one chain
        let cache = cache(4, 1);
        let a = cache.get_block(1, 42).unwrap();
        let b = cache.get_block(2, 42).unwrap();
        assert_ne!(a.slot_id(), b.slot_id());
        a.data_mut()[0] = 1;
        assert_eq!(b.data()[0], 0);
        cache.release_block(a).unwrap();
        cache.release_block(b).unwrap();
        cache.check_invariants();
    }

    #[test]
    fn test_pinned_buffer_is_not_recycled() {
        let cache = cache(2, 3);
        let held = cache.get_block(1, 1).unwrap();
        for blockno in 2..10 {
            let buf = cache.get_block(1, blockno).unwrap();
            assert_ne!(buf.slot_id(), held.slot_id());
            cache.release_block(buf).unwrap();
        }
        assert_eq!(cache.status_of(1, 1), Some(BufStatus::Free));
        assert_eq!(cache.lock().bufs[held.slot_id()].refcnt(), 1);
    }
}
