use super::*;
use common::*;
use error::{Error, Result};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;

/// Raw block I/O underneath the cache. Both calls are synchronous.
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, dev: DevId, blockno: BlockNo, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, dev: DevId, blockno: BlockNo, buf: &[u8]) -> Result<()>;
}

/// Sparse in-memory disk, any device id is accepted.
/// Blocks that were never written read as zeros.
pub struct MemDisk {
    block_size: usize,
    blocks: Mutex<HashMap<(DevId, BlockNo), Box<[u8]>>>,
}

impl MemDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.block_size {
            return Err(Error::invalid_input(format!(
                "buffer of {} bytes for a {} byte block",
                len, self.block_size
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, dev: DevId, blockno: BlockNo, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let blocks = self.blocks.lock().unwrap();
        match blocks.get(&(dev, blockno)) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, dev: DevId, blockno: BlockNo, buf: &[u8]) -> Result<()> {
        self.check_len(buf.len())?;
        self.blocks
            .lock()
            .unwrap()
            .insert((dev, blockno), buf.to_vec().into_boxed_slice());
        Ok(())
    }
}
