//! Disk image layout:
//! [ header block | block 0 | block 1 | ... | block nblocks-1 ]
//! every slot is `block_size` bytes, the header is bincode encoded.

use super::*;
use blk_dev::BlockDevice;
use common::*;
use error::{Error, ErrorKind, Result};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Must be IMAGE_MAGIC
    pub magic: u32,
    /// Size of one block (bytes)
    pub block_size: u32,
    /// Number of data blocks
    pub nblocks: u32,
}

struct Image {
    file: File,
    nblocks: BlockNo,
}

/// Block devices backed by image files, one file per device id.
pub struct FileDisk {
    block_size: usize,
    images: RwLock<HashMap<DevId, Image>>,
}

impl FileDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            images: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or truncate) an image of `nblocks` zeroed blocks at `path`.
    pub fn format(path: impl AsRef<Path>, block_size: usize, nblocks: BlockNo) -> Result<()> {
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            block_size: block_size as u32,
            nblocks,
        };
        let encoded = bincode::serialize(&header)?;
        if encoded.len() > block_size {
            return Err(Error::invalid_input(format!(
                "block_size {} cannot hold the image header",
                block_size
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((nblocks as u64 + 1) * block_size as u64)?;
        file.write_all_at(&encoded, 0)?;
        file.sync_all()?;
        info!(
            "formatted {} ({} blocks of {} bytes)",
            path.as_ref().display(),
            nblocks,
            block_size
        );
        Ok(())
    }

    /// Attach the image at `path` as device `dev`.
    pub fn attach(&self, dev: DevId, path: impl AsRef<Path>) -> Result<ImageHeader> {
        if dev == NODEV {
            return Err(Error::invalid_input("device 0 is reserved"));
        }
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut raw = vec![0u8; self.block_size];
        file.read_exact_at(&mut raw, 0)?;
        let header: ImageHeader = bincode::deserialize(&raw)?;
        if header.magic != IMAGE_MAGIC {
            return Err(Error::new(
                ErrorKind::Corrupted,
                format!("bad magic {:#x}", header.magic),
            ));
        }
        if header.block_size as usize != self.block_size {
            return Err(Error::invalid_input(format!(
                "image has {} byte blocks, disk uses {}",
                header.block_size, self.block_size
            )));
        }
        debug!("attach dev={} path={}", dev, path.as_ref().display());
        self.images.write().unwrap().insert(
            dev,
            Image {
                file,
                nblocks: header.nblocks,
            },
        );
        Ok(header)
    }

    /// byte offset of `blockno`, the header occupies slot 0
    fn offset(&self, image: &Image, dev: DevId, blockno: BlockNo, len: usize) -> Result<u64> {
        if len != self.block_size {
            return Err(Error::invalid_input(format!(
                "buffer of {} bytes for a {} byte block",
                len, self.block_size
            )));
        }
        if blockno >= image.nblocks {
            return Err(Error::invalid_input(format!(
                "block {} out of range on dev {} ({} blocks)",
                blockno, dev, image.nblocks
            )));
        }
        Ok((blockno as u64 + 1) * self.block_size as u64)
    }

    /// Flush every attached image to stable storage.
    pub fn sync(&self) -> Result<()> {
        for image in self.images.read().unwrap().values() {
            image.file.sync_data()?;
        }
        Ok(())
    }
}

fn no_such_device(dev: DevId) -> Error {
    Error::device(format!("no image attached as dev {}", dev))
}

impl BlockDevice for FileDisk {
    fn read_block(&self, dev: DevId, blockno: BlockNo, buf: &mut [u8]) -> Result<()> {
        let images = self.images.read().unwrap();
        let image = images.get(&dev).ok_or_else(|| no_such_device(dev))?;
        let offset = self.offset(image, dev, blockno, buf.len())?;
        image.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, dev: DevId, blockno: BlockNo, buf: &[u8]) -> Result<()> {
        let images = self.images.read().unwrap();
        let image = images.get(&dev).ok_or_else(|| no_such_device(dev))?;
        let offset = self.offset(image, dev, blockno, buf.len())?;
        image.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bcache-{}-{}.img", name, std::process::id()))
    }

    #[test]
    fn test_format_attach_rw() {
        let path = scratch("rw");
        FileDisk::format(&path, BSIZE, 16).unwrap();

        let disk = FileDisk::new(BSIZE);
        let header = disk.attach(1, &path).unwrap();
        assert_eq!(header.nblocks, 16);
        assert_eq!(header.magic, IMAGE_MAGIC);

        let mut buf = [0u8; BSIZE];
        disk.read_block(1, 15, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        disk.write_block(1, 15, &[0x5au8; BSIZE]).unwrap();
        disk.read_block(1, 15, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5a));
        disk.sync().unwrap();

        // the header survives data writes
        disk.write_block(1, 0, &[0xffu8; BSIZE]).unwrap();
        let again = FileDisk::new(BSIZE);
        assert_eq!(again.attach(2, &path).unwrap(), header);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_out_of_range_and_unknown_dev() {
        let path = scratch("range");
        FileDisk::format(&path, BSIZE, 4).unwrap();
        let disk = FileDisk::new(BSIZE);
        disk.attach(3, &path).unwrap();

        let mut buf = [0u8; BSIZE];
        let err = disk.read_block(3, 4, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = disk.read_block(9, 0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_block_size_mismatch() {
        let path = scratch("bsize");
        FileDisk::format(&path, 4096, 2).unwrap();
        let disk = FileDisk::new(BSIZE);
        assert!(disk.attach(1, &path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
