/// device id
pub type DevId = u32;

/// block number inside a device
pub type BlockNo = u32;

/// index of a buffer slot in the pool
pub type SlotId = usize;

/// device id of an unbound slot, never a valid device
pub const NODEV: DevId = 0;

/// default block size
pub const BSIZE: usize = 1024;

/// default size of disk block cache
pub const NBUF: usize = 64;

/// default # of hash buckets
pub const NHASH: usize = 100;

/// magic number at the start of a disk image
pub const IMAGE_MAGIC: u32 = 0x10203040;
