//! Checkpoint file core.
//!
//! The checkpoint file (cpfile) is a dense metadata table recording every
//! checkpoint of the filesystem. It is a hybrid of a packed array, giving
//! O(1) lookup by checkpoint number, and an intrusive doubly-linked list
//! threading all snapshots in ascending cno order through the entries and a
//! header sentinel.

use std::collections::HashSet;
use std::mem::size_of;
use std::sync::{Mutex, RwLock};

use log::*;
use zerocopy::{AsBytes, FromBytes};

pub use meta_file;
use meta_file::{Block, FsError, MetaFile, Result};

pub mod desc;
pub mod types;
pub mod utils;

mod fs;
mod snapshot;
mod verify;

pub use fs::Root;
pub use verify::VerifyReport;

use desc::{CheckpointEntry, CpfileHeader, RawInode, CPFILE_INO, CP_FLAG_INVALID, MIN_CHECKPOINT_SIZE};

/// Handle to one checkpoint file.
///
/// All state is guarded by a single per-file reader/writer lock; enumeration
/// and stat take the read side, every mutation takes the write side.
pub struct Cpfile<T: MetaFile> {
    meta: RwLock<T>,
    /// on-disk size of one checkpoint slot, fixed at mount
    entry_size: usize,
    entries_per_block: usize,
    /// leading slots reserved for the header record (1 for the cpfile)
    first_entry_offset: u64,
    /// bytes reserved for the header record in block 0
    header_bytes: usize,
    /// raw inode this handle was materialized from
    inode: RawInode,
    /// checkpoints currently mounted read-only by the host
    mounted: Mutex<HashSet<u64>>,
}

impl<T: MetaFile> Cpfile<T> {
    /// Bind a cpfile handle to its on-disk inode record.
    pub fn read(meta: T, cpsize: usize, raw_inode: &RawInode) -> Result<Self> {
        let block_size = meta.block_size();
        if cpsize < MIN_CHECKPOINT_SIZE || cpsize > block_size {
            return Err(FsError::Invalid(format!(
                "checkpoint size {} out of range [{}, {}]",
                cpsize, MIN_CHECKPOINT_SIZE, block_size
            )));
        }
        let header_bytes = size_of::<CpfileHeader>();
        meta.set_entry_size(cpsize, header_bytes)?;
        let entries_per_block = block_size / cpsize;
        let first_entry_offset = ((header_bytes + cpsize - 1) / cpsize) as u64;
        debug!(
            "cpfile: entry size {}, {} entries per block",
            cpsize, entries_per_block
        );
        Ok(Self {
            meta: RwLock::new(meta),
            entry_size: cpsize,
            entries_per_block,
            first_entry_offset,
            header_bytes,
            inode: *raw_inode,
            mounted: Mutex::new(HashSet::new()),
        })
    }

    /// Lay down the header block of a fresh cpfile: every slot invalid, then
    /// a zeroed header record over slot 0.
    pub fn initialize(&self) -> Result<()> {
        let meta = self.meta.write().unwrap();
        if meta.get_block(0, false, None).is_ok() {
            return Err(FsError::Already);
        }
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        let mut block = self.get_cp_block(&*meta, 1, true)?;
        self.write_header(&mut block, &CpfileHeader::zeroed());
        meta.write_block(&block)?;
        meta.mark_dirty();
        if meta.cno() < 1 {
            meta.set_cno(1);
        }
        info!("cpfile (ino={}): initialized", CPFILE_INO);
        Ok(())
    }

    pub fn entry_size(self: &Self) -> usize {
        self.entry_size
    }

    pub fn entries_per_block(self: &Self) -> usize {
        self.entries_per_block
    }

    /// Bytes reserved for the header record in block 0.
    pub fn header_bytes(self: &Self) -> usize {
        self.header_bytes
    }

    /// The raw inode this handle was materialized from.
    pub fn inode(self: &Self) -> &RawInode {
        &self.inode
    }

    /// Register a checkpoint as mounted by the host; a mounted snapshot
    /// cannot revert to a plain checkpoint.
    pub fn set_mounted(&self, cno: u64) {
        self.mounted.lock().unwrap().insert(cno);
    }

    pub fn clear_mounted(&self, cno: u64) {
        self.mounted.lock().unwrap().remove(&cno);
    }

    pub fn is_mounted(&self, cno: u64) -> bool {
        self.mounted.lock().unwrap().contains(&cno)
    }

    /*
     * Block-layout calculator. Slot 0 of block 0 belongs to the header, so
     * checkpoint cno lives `first_entry_offset` slots past the packed-array
     * position it would otherwise have.
     */

    pub(crate) fn cp_blkoff(&self, cno: u64) -> u64 {
        (cno + self.first_entry_offset - 1) / self.entries_per_block as u64
    }

    pub(crate) fn cp_slot(&self, cno: u64) -> u64 {
        (cno + self.first_entry_offset - 1) % self.entries_per_block as u64
    }

    pub(crate) fn first_cno_of_block(&self, blkoff: u64) -> u64 {
        self.entries_per_block as u64 * blkoff + 1 - self.first_entry_offset
    }

    /// Number of slots from `cno` to the end of its block, capped by the
    /// exclusive bound `max_cno`.
    pub(crate) fn cp_in_range(&self, cno: u64, max_cno: u64) -> u64 {
        let to_block_end = self.entries_per_block as u64 - self.cp_slot(cno);
        to_block_end.min(max_cno - cno)
    }

    /// Block 0 carries the header instead of a census; every census update
    /// must be gated on this.
    pub(crate) fn in_first_block(&self, cno: u64) -> bool {
        self.cp_blkoff(cno) == 0
    }

    /*
     * Block accessor, a thin wrapper over the metadata-file store.
     */

    pub(crate) fn get_header_block(&self, meta: &T) -> Result<Block> {
        meta.get_block(0, false, None).map_err(|err| match err {
            FsError::NoEntry => {
                error!("cpfile (ino={}): header block is missing", CPFILE_INO);
                FsError::Corrupted("missing cpfile header block".to_string())
            }
            err => err,
        })
    }

    /// Fetch the block holding `cno`. A freshly allocated block gets every
    /// slot marked invalid before it is first seen.
    pub(crate) fn get_cp_block(&self, meta: &T, cno: u64, create: bool) -> Result<Block> {
        let blkoff = self.cp_blkoff(cno);
        if !create {
            return meta.get_block(blkoff, false, None);
        }
        let entry_size = self.entry_size;
        let entries_per_block = self.entries_per_block;
        let init = move |data: &mut [u8]| {
            for slot in 0..entries_per_block {
                let off = slot * entry_size;
                data[off..off + 4].copy_from_slice(&CP_FLAG_INVALID.to_le_bytes());
            }
        };
        meta.get_block(blkoff, true, Some(&init))
    }

    /// Next existing checkpoint block for `[start_cno, end_cno]`; reports the
    /// cno the caller should continue from along with the block.
    pub(crate) fn find_cp_block(
        &self,
        meta: &T,
        start_cno: u64,
        end_cno: u64,
    ) -> Result<(u64, Block)> {
        let start_blkoff = self.cp_blkoff(start_cno);
        let (blkoff, block) = meta.find_block(start_blkoff, self.cp_blkoff(end_cno))?;
        let cno = if blkoff == start_blkoff {
            start_cno
        } else {
            self.first_cno_of_block(blkoff)
        };
        Ok((cno, block))
    }

    pub(crate) fn delete_cp_block(&self, meta: &T, blkoff: u64) -> Result<()> {
        debug!("cpfile: reclaiming empty block {}", blkoff);
        meta.delete_block(blkoff)
    }

    /*
     * Entry codec over fetched blocks.
     */

    fn entry_offset(&self, cno: u64) -> usize {
        self.cp_slot(cno) as usize * self.entry_size
    }

    pub(crate) fn read_entry(&self, block: &Block, cno: u64) -> Result<CheckpointEntry> {
        let off = self.entry_offset(cno);
        CheckpointEntry::read_from_prefix(&block.data[off..])
            .ok_or_else(|| self.corrupted(cno, "checkpoint entry does not fit its block"))
    }

    pub(crate) fn write_entry(&self, block: &mut Block, cno: u64, entry: &CheckpointEntry) {
        let off = self.entry_offset(cno);
        block.data[off..off + size_of::<CheckpointEntry>()].copy_from_slice(entry.as_bytes());
    }

    pub(crate) fn read_header(&self, block: &Block) -> Result<CpfileHeader> {
        CpfileHeader::read_from_prefix(&block.data[..])
            .ok_or_else(|| self.corrupted(0, "cpfile header does not fit its block"))
    }

    pub(crate) fn write_header(&self, block: &mut Block, header: &CpfileHeader) {
        block.data[..size_of::<CpfileHeader>()].copy_from_slice(header.as_bytes());
    }

    /*
     * Per-block census, kept in the first slot of every block but block 0.
     */

    pub(crate) fn census(&self, block: &Block) -> Result<u32> {
        let first = CheckpointEntry::read_from_prefix(&block.data[..])
            .ok_or_else(|| self.corrupted(0, "census slot does not fit its block"))?;
        Ok(first.cp_checkpoints_count.get())
    }

    pub(crate) fn census_add(&self, block: &mut Block, n: u32) -> Result<u32> {
        let mut first = CheckpointEntry::read_from_prefix(&block.data[..])
            .ok_or_else(|| self.corrupted(0, "census slot does not fit its block"))?;
        let count = first.cp_checkpoints_count.get() + n;
        first.cp_checkpoints_count.set(count);
        block.data[..size_of::<CheckpointEntry>()].copy_from_slice(first.as_bytes());
        Ok(count)
    }

    pub(crate) fn census_sub(&self, block: &mut Block, n: u32) -> Result<u32> {
        let mut first = CheckpointEntry::read_from_prefix(&block.data[..])
            .ok_or_else(|| self.corrupted(0, "census slot does not fit its block"))?;
        let old = first.cp_checkpoints_count.get();
        if n > old {
            warn!(
                "cpfile (ino={}): census underflow in block {} ({} - {})",
                CPFILE_INO, block.blkoff, old, n
            );
        }
        let count = old.saturating_sub(n);
        first.cp_checkpoints_count.set(count);
        block.data[..size_of::<CheckpointEntry>()].copy_from_slice(first.as_bytes());
        Ok(count)
    }

    pub(crate) fn corrupted(&self, cno: u64, what: &str) -> FsError {
        error!("cpfile (ino={}): {} (cno={})", CPFILE_INO, what, cno);
        FsError::Corrupted(format!("{} (cno={})", what, cno))
    }
}
