#![allow(dead_code)]

use bcache::{BlockDevice, BlockNo, BufCache, CacheConfig, DevId, Error, MemDisk, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BLOCK: usize = 512;

/// MemDisk that counts I/O per block, can be slowed down and can fail on demand.
pub struct TestDisk {
    disk: MemDisk,
    pub reads: Mutex<HashMap<(DevId, BlockNo), u32>>,
    pub writes: Mutex<HashMap<(DevId, BlockNo), u32>>,
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
    /// # of upcoming reads to fail
    pub fail_reads: AtomicU32,
    /// # of upcoming writes to fail
    pub fail_writes: AtomicU32,
    pub read_delay: Mutex<Duration>,
    pub write_delay: Mutex<Duration>,
}

impl TestDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            disk: MemDisk::new(BLOCK),
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
            fail_reads: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
            read_delay: Mutex::new(Duration::ZERO),
            write_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn reads_of(&self, dev: DevId, blockno: BlockNo) -> u32 {
        *self.reads.lock().unwrap().get(&(dev, blockno)).unwrap_or(&0)
    }

    pub fn writes_of(&self, dev: DevId, blockno: BlockNo) -> u32 {
        *self.writes.lock().unwrap().get(&(dev, blockno)).unwrap_or(&0)
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::SeqCst)
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads.load(Ordering::SeqCst)
    }

    /// Bypass the cache: what is on "disk" right now.
    pub fn peek(&self, dev: DevId, blockno: BlockNo) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK];
        self.disk.read_block(dev, blockno, &mut buf).unwrap();
        buf
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn slow_reads(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub fn slow_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn poke(&self, dev: DevId, blockno: BlockNo, byte: u8) {
        self.disk.write_block(dev, blockno, &[byte; BLOCK]).unwrap();
    }
}

fn take_failure(left: &AtomicU32) -> bool {
    left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl BlockDevice for TestDisk {
    fn read_block(&self, dev: DevId, blockno: BlockNo, buf: &mut [u8]) -> Result<()> {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        *self.reads.lock().unwrap().entry((dev, blockno)).or_default() += 1;
        if take_failure(&self.fail_reads) {
            return Err(Error::device(format!("read dev={} blockno={}", dev, blockno)));
        }
        self.disk.read_block(dev, blockno, buf)
    }

    fn write_block(&self, dev: DevId, blockno: BlockNo, buf: &[u8]) -> Result<()> {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.total_writes.fetch_add(1, Ordering::SeqCst);
        *self.writes.lock().unwrap().entry((dev, blockno)).or_default() += 1;
        if take_failure(&self.fail_writes) {
            return Err(Error::device(format!("write dev={} blockno={}", dev, blockno)));
        }
        self.disk.write_block(dev, blockno, buf)
    }
}

pub fn cache_with(disk: &Arc<TestDisk>, pool_capacity: usize) -> Arc<BufCache> {
    let config = CacheConfig::default()
        .with_block_size(BLOCK)
        .with_pool_capacity(pool_capacity)
        .with_hash_table_size(7);
    BufCache::new(config, disk.clone()).unwrap()
}
