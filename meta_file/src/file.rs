//! File-backed metadata file.
//!
//! The image is one superblock page followed by the metadata blocks, block
//! `b` living at byte offset `(1 + b) * block_size`. An all-zero page on disk
//! is a hole; a freshly initialized checkpoint block is never all-zero
//! because every slot carries an invalid flag, so the two cannot be confused.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::{Block, FsError, MetaFile, Result};

pub const META_MAGIC: [u8; 4] = *b"mdtf";
pub const META_VERSION: u32 = 1;
/// magic + version + block_size + entry_size + header_bytes + pad + next_cno + uuid
pub const META_SUPER_BYTES: usize = 4 + 4 + 4 + 4 + 4 + 4 + 8 + 16;

struct FileInner {
    blocks: BTreeMap<u64, Vec<u8>>,
    next_cno: u64,
    entry_size: usize,
    header_bytes: usize,
    uuid: [u8; 16],
    dirty: bool,
}

pub struct FileMetaFile {
    path: PathBuf,
    block_size: usize,
    read_only: bool,
    inner: Mutex<FileInner>,
}

impl FileMetaFile {
    /// Create a fresh image holding no metadata blocks.
    pub fn format<P: AsRef<Path>>(path: P, block_size: usize, uuid: [u8; 16]) -> Result<()> {
        if block_size < META_SUPER_BYTES || block_size % 512 != 0 {
            return Err(FsError::Invalid(format!(
                "unusable block size {}",
                block_size
            )));
        }
        let meta = Self {
            path: path.as_ref().to_path_buf(),
            block_size,
            read_only: false,
            inner: Mutex::new(FileInner {
                blocks: BTreeMap::new(),
                next_cno: 1,
                entry_size: 0,
                header_bytes: 0,
                uuid,
                dirty: true,
            }),
        };
        meta.flush()
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let data = fs::read(&path)?;
        if data.len() < META_SUPER_BYTES {
            return Err(FsError::Corrupted(format!(
                "{}: too short for a metadata image",
                path.as_ref().display()
            )));
        }
        if data[0..4] != META_MAGIC {
            return Err(FsError::Corrupted(format!(
                "{}: bad magic, not a metadata image",
                path.as_ref().display()
            )));
        }
        let version = read_u32(&data, 4);
        if version != META_VERSION {
            return Err(FsError::Corrupted(format!(
                "{}: unsupported image version {}",
                path.as_ref().display(),
                version
            )));
        }
        let block_size = read_u32(&data, 8) as usize;
        if block_size < META_SUPER_BYTES {
            return Err(FsError::Corrupted(format!(
                "{}: unusable block size {}",
                path.as_ref().display(),
                block_size
            )));
        }
        let entry_size = read_u32(&data, 12) as usize;
        let header_bytes = read_u32(&data, 16) as usize;
        let next_cno = read_u64(&data, 24);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[32..48]);

        let mut blocks = BTreeMap::new();
        let mut offset = block_size;
        let mut blkoff = 0u64;
        while offset + block_size <= data.len() {
            let page = &data[offset..offset + block_size];
            if page.iter().any(|&b| b != 0) {
                blocks.insert(blkoff, page.to_vec());
            }
            offset += block_size;
            blkoff += 1;
        }
        debug!(
            "opened {}: {} blocks, next cno {}",
            path.as_ref().display(),
            blocks.len(),
            next_cno
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            block_size,
            read_only,
            inner: Mutex::new(FileInner {
                blocks,
                next_cno,
                entry_size,
                header_bytes,
                uuid,
                dirty: false,
            }),
        })
    }

    /// Entry size recorded in the image, 0 when never set.
    pub fn entry_size(&self) -> usize {
        self.inner.lock().unwrap().entry_size
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.inner.lock().unwrap().uuid
    }

    fn write_super(&self, inner: &FileInner, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.block_size as u32).to_le_bytes());
        buf.extend_from_slice(&(inner.entry_size as u32).to_le_bytes());
        buf.extend_from_slice(&(inner.header_bytes as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&inner.next_cno.to_le_bytes());
        buf.extend_from_slice(&inner.uuid);
        buf.resize(self.block_size, 0);
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

impl MetaFile for FileMetaFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn cno(&self) -> u64 {
        self.inner.lock().unwrap().next_cno
    }

    fn set_cno(&self, cno: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_cno = cno;
        inner.dirty = true;
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn set_entry_size(&self, entry_size: usize, header_bytes: usize) -> Result<()> {
        if entry_size == 0 || entry_size > self.block_size {
            return Err(FsError::Invalid(format!(
                "entry size {} does not fit a {} byte block",
                entry_size, self.block_size
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.entry_size != 0 && inner.entry_size != entry_size {
            return Err(FsError::Invalid(format!(
                "image already carries entry size {}",
                inner.entry_size
            )));
        }
        if inner.entry_size != entry_size || inner.header_bytes != header_bytes {
            inner.entry_size = entry_size;
            inner.header_bytes = header_bytes;
            if !self.read_only {
                inner.dirty = true;
            }
        }
        Ok(())
    }

    fn get_block(
        &self,
        blkoff: u64,
        create: bool,
        init: Option<&dyn Fn(&mut [u8])>,
    ) -> Result<Block> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(data) = inner.blocks.get(&blkoff) {
            return Ok(Block {
                blkoff,
                data: data.clone(),
            });
        }
        if !create {
            return Err(FsError::NoEntry);
        }
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let mut data = vec![0u8; self.block_size];
        if let Some(init) = init {
            init(&mut data);
        }
        inner.blocks.insert(blkoff, data.clone());
        inner.dirty = true;
        Ok(Block { blkoff, data })
    }

    fn find_block(&self, start_blkoff: u64, end_blkoff: u64) -> Result<(u64, Block)> {
        let inner = self.inner.lock().unwrap();
        match inner.blocks.range(start_blkoff..=end_blkoff).next() {
            Some((&blkoff, data)) => Ok((
                blkoff,
                Block {
                    blkoff,
                    data: data.clone(),
                },
            )),
            None => Err(FsError::NoEntry),
        }
    }

    fn write_block(&self, block: &Block) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.insert(block.blkoff, block.data.clone());
        inner.dirty = true;
        Ok(())
    }

    fn delete_block(&self, blkoff: u64) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.blocks.remove(&blkoff) {
            Some(_) => {
                inner.dirty = true;
                Ok(())
            }
            None => Err(FsError::NoEntry),
        }
    }

    fn mark_dirty(&self) {
        self.inner.lock().unwrap().dirty = true;
    }

    fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.dirty {
            return Ok(());
        }
        let mut superblock = Vec::with_capacity(self.block_size);
        self.write_super(&inner, &mut superblock);

        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        f.write_all(&superblock)?;
        if let Some(&last) = inner.blocks.keys().next_back() {
            // holes stay zero: extend first, then write the allocated blocks
            f.set_len(((last + 2) * self.block_size as u64) as u64)?;
            for (blkoff, data) in &inner.blocks {
                f.seek(SeekFrom::Start((1 + blkoff) * self.block_size as u64))?;
                f.write_all(data)?;
            }
        }
        f.sync_all()?;
        inner.dirty = false;
        debug!(
            "flushed {}: {} blocks",
            self.path.display(),
            inner.blocks.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("meta_file_{}_{}.img", name, std::process::id()))
    }

    #[test]
    fn format_open_roundtrip() -> Result<()> {
        let path = scratch("roundtrip");
        FileMetaFile::format(&path, 1024, [7u8; 16])?;

        let meta = FileMetaFile::open(&path, false)?;
        assert_eq!(meta.block_size(), 1024);
        assert_eq!(meta.cno(), 1);
        assert_eq!(meta.uuid(), [7u8; 16]);

        let init = |data: &mut [u8]| data[0] = 1;
        let mut block = meta.get_block(2, true, Some(&init))?;
        block.data[100] = 0xcc;
        meta.write_block(&block)?;
        meta.set_cno(5);
        meta.set_entry_size(256, 32)?;
        meta.flush()?;

        let again = FileMetaFile::open(&path, true)?;
        assert_eq!(again.cno(), 5);
        assert_eq!(again.entry_size(), 256);
        let block = again.get_block(2, false, None)?;
        assert_eq!(block.data[100], 0xcc);
        // blocks 0 and 1 were never written and stay holes
        assert!(matches!(
            again.get_block(0, false, None),
            Err(FsError::NoEntry)
        ));
        assert!(matches!(
            again.get_block(1, false, None),
            Err(FsError::NoEntry)
        ));

        fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn delete_persists_as_hole() -> Result<()> {
        let path = scratch("delete");
        FileMetaFile::format(&path, 1024, [0u8; 16])?;
        let meta = FileMetaFile::open(&path, false)?;
        let init = |data: &mut [u8]| data[0] = 1;
        meta.get_block(0, true, Some(&init))?;
        meta.get_block(3, true, Some(&init))?;
        meta.flush()?;
        meta.delete_block(0)?;
        meta.flush()?;

        let again = FileMetaFile::open(&path, false)?;
        assert!(matches!(
            again.get_block(0, false, None),
            Err(FsError::NoEntry)
        ));
        let (blkoff, _) = again.find_block(0, 10)?;
        assert_eq!(blkoff, 3);

        fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn open_rejects_garbage() -> Result<()> {
        let path = scratch("garbage");
        fs::write(&path, vec![0x5au8; 2048])?;
        assert!(matches!(
            FileMetaFile::open(&path, false),
            Err(FsError::Corrupted(_))
        ));
        fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn entry_size_is_sticky() -> Result<()> {
        let path = scratch("sticky");
        FileMetaFile::format(&path, 1024, [0u8; 16])?;
        let meta = FileMetaFile::open(&path, false)?;
        meta.set_entry_size(256, 32)?;
        meta.set_entry_size(256, 32)?;
        assert!(matches!(
            meta.set_entry_size(512, 32),
            Err(FsError::Invalid(_))
        ));
        fs::remove_file(&path).ok();
        Ok(())
    }
}
