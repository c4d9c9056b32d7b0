//! In-memory metadata file, mainly for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{Block, FsError, MetaFile, Result};

struct MemInner {
    blocks: BTreeMap<u64, Vec<u8>>,
    next_cno: u64,
    entry_size: usize,
    header_bytes: usize,
    dirty: bool,
}

pub struct MemMetaFile {
    block_size: usize,
    read_only: AtomicBool,
    inner: Mutex<MemInner>,
}

impl MemMetaFile {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            read_only: AtomicBool::new(false),
            inner: Mutex::new(MemInner {
                blocks: BTreeMap::new(),
                next_cno: 1,
                entry_size: 0,
                header_bytes: 0,
                dirty: false,
            }),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Number of allocated (non-hole) blocks.
    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }
}

impl MetaFile for MemMetaFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn cno(&self) -> u64 {
        self.inner.lock().unwrap().next_cno
    }

    fn set_cno(&self, cno: u64) {
        self.inner.lock().unwrap().next_cno = cno;
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    fn set_entry_size(&self, entry_size: usize, header_bytes: usize) -> Result<()> {
        if entry_size == 0 || entry_size > self.block_size {
            return Err(FsError::Invalid(format!(
                "entry size {} does not fit a {} byte block",
                entry_size, self.block_size
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.entry_size = entry_size;
        inner.header_bytes = header_bytes;
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
        if self.read_only() {
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
        if self.read_only() {
            return Err(FsError::ReadOnly);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.insert(block.blkoff, block.data.clone());
        inner.dirty = true;
        Ok(())
    }

    fn delete_block(&self, blkoff: u64) -> Result<()> {
        if self.read_only() {
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
        self.inner.lock().unwrap().dirty = false;
        Ok(())
    }
}
