//! On-disk layout of the checkpoint file.
#![allow(dead_code)]

use std::mem::size_of;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::cpfs_lib::types::{Le16, Le32, Le64};

/*
 * Special inode numbers
 */
pub const ROOT_INO: u64 = 2     /* Root directory inode */;
pub const CPFILE_INO: u64 = 3   /* Checkpoint file inode */;
pub const IFILE_INO: u64 = 4    /* Inode file inode */;

/// cno 0 is reserved, it stands for "none" and for the header sentinel in
/// snapshot-list links.
pub const CNO_NONE: u64 = 0;
/// Iteration terminator handed back by snapshot enumeration.
pub const CNO_TERMINATOR: u64 = u64::MAX;

/*
 * Checkpoint entry flags
 */
pub const CP_FLAG_INVALID: u32 = 0x0001;
pub const CP_FLAG_SNAPSHOT: u32 = 0x0002;
pub const CP_FLAG_MINOR: u32 = 0x0004;

/// Snapshot-list links threaded through checkpoint entries and the header.
/// A zero cno on either side means the header sentinel is the neighbor.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct SnapshotList {
    pub ssl_next: Le64, /* next (larger) snapshot cno */
    pub ssl_prev: Le64, /* previous (smaller) snapshot cno */
}

/// Raw on-disk inode, as embedded for the ifile root of each checkpoint.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct RawInode {
    pub i_blocks: Le64,
    pub i_size: Le64,
    pub i_ctime: Le64,
    pub i_mtime: Le64,
    pub i_mode: Le16,
    pub i_links_count: Le16,
    pub i_flags: Le32,
    pub i_uid: Le32,
    pub i_gid: Le32,
    pub i_generation: Le32,
    pub i_pad: Le32,
    pub i_bmap: [Le64; 7], /* block mapping root */
}

impl RawInode {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Fresh inode for an internal metadata file.
    pub fn metadata_file(ctime: u64) -> Self {
        let mut inode = Self::zeroed();
        inode.i_mode.set(0o100600);
        inode.i_links_count.set(1);
        inode.i_ctime.set(ctime);
        inode.i_mtime.set(ctime);
        inode
    }
}

/// One checkpoint slot.
///
/// `cp_checkpoints_count` is the per-block census: it is meaningful only in
/// the entry occupying the first slot of a block, and block 0 (whose first
/// slot holds the header) does not carry one at all.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct CheckpointEntry {
    pub cp_flags: Le32,
    pub cp_checkpoints_count: Le32, /* valid entries in this block */
    pub cp_cno: Le64,
    pub cp_create: Le64,        /* creation time, UNIX seconds */
    pub cp_nblk_inc: Le64,      /* blocks added by this checkpoint */
    pub cp_inodes_count: Le64,
    pub cp_blocks_count: Le64,
    pub cp_snapshot_list: SnapshotList,
    pub cp_ifile_inode: RawInode, /* ifile root of this checkpoint */
}

/// Header entry occupying slot 0 of block 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct CpfileHeader {
    pub ch_ncheckpoints: Le64,
    pub ch_nsnapshots: Le64,
    pub ch_snapshot_list: SnapshotList, /* sentinel: next = smallest, prev = largest */
}

/// Smallest admissible checkpoint entry size; the upper bound is one block.
pub const MIN_CHECKPOINT_SIZE: usize = size_of::<CheckpointEntry>();

impl CheckpointEntry {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    fn flag(&self, flag: u32) -> bool {
        self.cp_flags.get() & flag != 0
    }

    fn set_flag(&mut self, flag: u32) {
        let flags = self.cp_flags.get();
        self.cp_flags.set(flags | flag);
    }

    fn clear_flag(&mut self, flag: u32) {
        let flags = self.cp_flags.get();
        self.cp_flags.set(flags & !flag);
    }

    pub fn is_invalid(&self) -> bool {
        self.flag(CP_FLAG_INVALID)
    }

    pub fn set_invalid(&mut self) {
        self.set_flag(CP_FLAG_INVALID);
    }

    pub fn clear_invalid(&mut self) {
        self.clear_flag(CP_FLAG_INVALID);
    }

    pub fn is_snapshot(&self) -> bool {
        self.flag(CP_FLAG_SNAPSHOT)
    }

    pub fn set_snapshot(&mut self) {
        self.set_flag(CP_FLAG_SNAPSHOT);
    }

    pub fn clear_snapshot(&mut self) {
        self.clear_flag(CP_FLAG_SNAPSHOT);
    }

    pub fn is_minor(&self) -> bool {
        self.flag(CP_FLAG_MINOR)
    }

    pub fn set_minor(&mut self) {
        self.set_flag(CP_FLAG_MINOR);
    }

    pub fn clear_minor(&mut self) {
        self.clear_flag(CP_FLAG_MINOR);
    }
}

impl CpfileHeader {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// Checkpoint mode, the numeric ABI of mode-change requests.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum CpMode {
    Checkpoint = 0,
    Snapshot = 1,
}

/// Summary of one checkpoint as handed out by enumeration.
#[derive(Debug, Clone, Default)]
pub struct Cpinfo {
    pub ci_cno: u64,
    pub ci_create: u64,
    pub ci_nblk_inc: u64,
    pub ci_inodes_count: u64,
    pub ci_blocks_count: u64,
    pub ci_flags: u32,
    pub ci_next: u64, /* next snapshot cno, 0 at the tail */
}

impl Cpinfo {
    pub fn is_snapshot(&self) -> bool {
        self.ci_flags & CP_FLAG_SNAPSHOT != 0
    }

    pub fn is_minor(&self) -> bool {
        self.ci_flags & CP_FLAG_MINOR != 0
    }
}

/// Aggregate counters returned by `get_stat`.
#[derive(Debug, Clone, Copy)]
pub struct CpStat {
    pub cs_cno: u64,  /* next checkpoint number */
    pub cs_ncps: u64, /* valid checkpoints */
    pub cs_nsss: u64, /* snapshots */
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn on_disk_sizes() {
        assert_eq!(size_of::<SnapshotList>(), 16);
        assert_eq!(size_of::<RawInode>(), 112);
        assert_eq!(size_of::<CheckpointEntry>(), 176);
        assert_eq!(size_of::<CpfileHeader>(), 32);
        assert_eq!(MIN_CHECKPOINT_SIZE, 176);
    }

    #[test]
    fn flag_accessors() {
        let mut e = CheckpointEntry::zeroed();
        assert!(!e.is_invalid());
        e.set_invalid();
        e.set_minor();
        assert!(e.is_invalid());
        assert!(e.is_minor());
        assert!(!e.is_snapshot());
        e.clear_invalid();
        assert!(!e.is_invalid());
        assert!(e.is_minor());
        assert_eq!(e.cp_flags.get(), CP_FLAG_MINOR);
    }

    #[test]
    fn entry_codec_roundtrip() {
        use zerocopy::FromBytes;

        let mut e = CheckpointEntry::zeroed();
        e.cp_cno.set(0x1122334455667788);
        e.cp_create.set(1669521656);
        e.cp_snapshot_list.ssl_next.set(9);
        e.cp_ifile_inode.i_mode.set(0o100600);

        let bytes = e.as_bytes();
        // little-endian on disk
        assert_eq!(&bytes[8..16], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);

        let back = CheckpointEntry::read_from_prefix(bytes).unwrap();
        assert_eq!(back.cp_cno.get(), 0x1122334455667788);
        assert_eq!(back.cp_create.get(), 1669521656);
        assert_eq!(back.cp_snapshot_list.ssl_next.get(), 9);
        assert_eq!(back.cp_ifile_inode.i_mode.get(), 0o100600);
    }

    #[test]
    fn cp_mode_numeric() {
        assert_eq!(CpMode::try_from(0u32).unwrap(), CpMode::Checkpoint);
        assert_eq!(CpMode::try_from(1u32).unwrap(), CpMode::Snapshot);
        assert!(CpMode::try_from(2u32).is_err());
        let m: u32 = CpMode::Snapshot.into();
        assert_eq!(m, 1);
    }
}
