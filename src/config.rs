use super::*;
use common::*;
use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Sizes fixed when the cache is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// bytes per block
    pub block_size: usize,
    /// # of buffers in the pool
    pub pool_capacity: usize,
    /// # of hash buckets
    pub hash_table_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            block_size: BSIZE,
            pool_capacity: NBUF,
            hash_table_size: NHASH,
        }
    }
}

impl CacheConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_hash_table_size(mut self, hash_table_size: usize) -> Self {
        self.hash_table_size = hash_table_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::invalid_input(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.pool_capacity == 0 {
            return Err(Error::invalid_input("pool_capacity must be > 0"));
        }
        if self.hash_table_size == 0 {
            return Err(Error::invalid_input("hash_table_size must be > 0"));
        }
        Ok(())
    }
}
