mod blk_cch; // buffer cache
mod blk_dev; // block device gateway
mod buf; // per-buffer metadata
mod common;
mod config;
mod disk; // file backed devices
mod error;
mod free_list;
mod hash;

pub use blk_cch::{BufCache, BufferHandle, CacheStats};
pub use blk_dev::{BlockDevice, MemDisk};
pub use buf::BufStatus;
pub use common::{BlockNo, DevId, SlotId, BSIZE, IMAGE_MAGIC, NBUF, NHASH, NODEV};
pub use config::CacheConfig;
pub use disk::{FileDisk, ImageHeader};
pub use error::{Error, ErrorKind, Result};
