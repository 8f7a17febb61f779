//! (dev, blockno) -> buffer index.
//!
//! Buckets are picked from the block number only; chains are doubly linked
//! through `Buffer::hash` so a buffer can be spliced out without a scan.

use super::*;
use buf::{Buffer, HashLinks};
use common::*;

pub struct HashIndex {
    /// chain head of every bucket
    heads: Vec<Option<SlotId>>,
    magic: u64,
}

impl HashIndex {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            heads: vec![None; size],
            // golden ratio of the table size
            magic: (size as u64 * 1000 / 618).max(1),
        }
    }

    pub fn bucket(&self, blockno: BlockNo) -> usize {
        ((blockno as u64).wrapping_mul(self.magic) % self.heads.len() as u64) as usize
    }

    pub fn lookup(&self, bufs: &[Buffer], dev: DevId, blockno: BlockNo) -> Option<SlotId> {
        let mut cur = self.heads[self.bucket(blockno)];
        while let Some(id) = cur {
            let buf = &bufs[id];
            if buf.dev == dev && buf.blockno == blockno {
                return Some(id);
            }
            cur = buf.hash.and_then(|links| links.next);
        }
        None
    }

    /// Bind `id` to (dev, blockno). Whatever `id` was bound to before, and any other
    /// buffer bound to (dev, blockno), leave the index first.
    pub fn bind(&mut self, bufs: &mut [Buffer], id: SlotId, dev: DevId, blockno: BlockNo) {
        self.unbind(bufs, id);
        if let Some(stale) = self.lookup(bufs, dev, blockno) {
            log::warn!(
                "hash: displacing stale buffer {} for dev={} blockno={}",
                stale,
                dev,
                blockno
            );
            self.unbind(bufs, stale);
        }

        bufs[id].rebind(dev, blockno);
        let bucket = self.bucket(blockno);
        let head = self.heads[bucket];
        if let Some(head) = head {
            if let Some(links) = bufs[head].hash.as_mut() {
                links.prev = Some(id);
            }
        }
        bufs[id].hash = Some(HashLinks {
            prev: None,
            next: head,
        });
        self.heads[bucket] = Some(id);
    }

    /// Splice `id` out of its chain, no-op if it is not bound.
    pub fn unbind(&mut self, bufs: &mut [Buffer], id: SlotId) {
        let Some(links) = bufs[id].hash.take() else {
            return;
        };
        match links.prev {
            Some(prev) => {
                if let Some(prev_links) = bufs[prev].hash.as_mut() {
                    prev_links.next = links.next;
                }
            }
            None => {
                let bucket = self.bucket(bufs[id].blockno);
                self.heads[bucket] = links.next;
            }
        }
        if let Some(next) = links.next {
            if let Some(next_links) = bufs[next].hash.as_mut() {
                next_links.prev = links.prev;
            }
        }
        bufs[id].dev = NODEV;
    }

    /// Every buffer bound to `dev`, in bucket order.
    pub fn bound_to(&self, bufs: &[Buffer], dev: DevId) -> Vec<SlotId> {
        let mut ids = Vec::new();
        for head in self.heads.iter() {
            let mut cur = *head;
            while let Some(id) = cur {
                if bufs[id].dev == dev {
                    ids.push(id);
                }
                cur = bufs[id].hash.and_then(|links| links.next);
            }
        }
        ids
    }

    /// Every device with at least one bound buffer.
    pub fn devices(&self, bufs: &[Buffer]) -> Vec<DevId> {
        let mut devs: Vec<DevId> = bufs
            .iter()
            .filter(|buf| buf.is_bound())
            .map(|buf| buf.dev)
            .collect();
        devs.sort_unstable();
        devs.dedup();
        devs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Vec<Buffer> {
        (0..n).map(|_| Buffer::default()).collect()
    }

    #[test]
    fn test_bind_lookup() {
        let mut bufs = pool(4);
        let mut index = HashIndex::new(7);
        index.bind(&mut bufs, 0, 1, 10);
        index.bind(&mut bufs, 1, 1, 11);
        index.bind(&mut bufs, 2, 2, 10);

        assert_eq!(index.lookup(&bufs, 1, 10), Some(0));
        assert_eq!(index.lookup(&bufs, 1, 11), Some(1));
        assert_eq!(index.lookup(&bufs, 2, 10), Some(2));
        assert_eq!(index.lookup(&bufs, 3, 10), None);
        assert!(bufs[0].is_bound());
        assert!(!bufs[3].is_bound());
    }

    #[test]
    fn test_chain_splice() {
        // one bucket: everything collides
        let mut bufs = pool(3);
        let mut index = HashIndex::new(1);
        index.bind(&mut bufs, 0, 1, 1);
        index.bind(&mut bufs, 1, 1, 2);
        index.bind(&mut bufs, 2, 1, 3);

        // middle of the chain
        index.unbind(&mut bufs, 1);
        assert_eq!(index.lookup(&bufs, 1, 2), None);
        assert_eq!(index.lookup(&bufs, 1, 1), Some(0));
        assert_eq!(index.lookup(&bufs, 1, 3), Some(2));
        assert_eq!(bufs[1].dev, NODEV);

        // head of the chain
        index.unbind(&mut bufs, 2);
        assert_eq!(index.lookup(&bufs, 1, 1), Some(0));
        index.unbind(&mut bufs, 0);
        assert_eq!(index.lookup(&bufs, 1, 1), None);

        // unbinding twice is harmless
        index.unbind(&mut bufs, 0);
    }

    #[test]
    fn test_rebind_moves_buffer() {
        let mut bufs = pool(2);
        let mut index = HashIndex::new(5);
        index.bind(&mut bufs, 0, 1, 4);
        index.bind(&mut bufs, 0, 1, 9);
        assert_eq!(index.lookup(&bufs, 1, 4), None);
        assert_eq!(index.lookup(&bufs, 1, 9), Some(0));
    }

    #[test]
    fn test_one_buffer_per_block() {
        let mut bufs = pool(2);
        let mut index = HashIndex::new(5);
        index.bind(&mut bufs, 0, 1, 4);
        index.bind(&mut bufs, 1, 1, 4);
        assert_eq!(index.lookup(&bufs, 1, 4), Some(1));
        assert!(!bufs[0].is_bound());
    }

    #[test]
    fn test_bound_to() {
        let mut bufs = pool(4);
        let mut index = HashIndex::new(3);
        index.bind(&mut bufs, 0, 1, 0);
        index.bind(&mut bufs, 1, 2, 0);
        index.bind(&mut bufs, 2, 1, 5);
        let mut ids = index.bound_to(&bufs, 1);
        ids.sort();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(index.devices(&bufs), vec![1, 2]);
    }
}
