//! Block-addressed sparse metadata files.
//!
//! A metadata file is a lazily allocated array of fixed-size blocks. Blocks
//! that were never written (or were deleted) are holes; reading a hole is an
//! error unless the caller asks for creation, in which case the fresh block
//! runs through an init callback before it is first returned. The store also
//! carries the monotone next-checkpoint-number counter for the file.

use std::sync::Arc;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileMetaFile;
pub use memory::MemMetaFile;

pub type Result<T> = std::result::Result<T, FsError>;

/// Error taxonomy shared by the metadata-file stack.
///
/// Every variant maps onto one POSIX errno, see [`FsError::errno`]. Callers
/// dispatch on the class (a hole is not a corruption, busy is not a failure),
/// so this is a typed enum rather than an opaque error chain.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("no such entry")]
    NoEntry,
    #[error("resource busy: {0}")]
    Busy(&'static str),
    #[error("metadata corrupted: {0}")]
    Corrupted(String),
    #[error("read-only metadata file")]
    ReadOnly,
    #[error("out of memory")]
    NoMemory,
    #[error("already exists")]
    Already,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno this error surfaces as.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Invalid(_) => libc::EINVAL,
            FsError::NoEntry => libc::ENOENT,
            FsError::Busy(_) => libc::EBUSY,
            FsError::Corrupted(_) => libc::EIO,
            FsError::ReadOnly => libc::EROFS,
            FsError::NoMemory => libc::ENOMEM,
            FsError::Already => libc::EALREADY,
            FsError::Io(_) => libc::EIO,
        }
    }
}

/// An owned snapshot of one block, the short-lived "mapping" of its bytes.
///
/// Mutations are read-modify-write: fetch a block, edit the copy, hand it
/// back with [`MetaFile::write_block`]. Two live copies of the same block
/// must never both be written back; operations that touch one block through
/// several logical positions do sequential single-field rewrites instead.
#[derive(Debug, Clone)]
pub struct Block {
    pub blkoff: u64,
    pub data: Vec<u8>,
}

/// Storage seam for one metadata file.
pub trait MetaFile {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Monotone next checkpoint number for this file.
    fn cno(&self) -> u64;

    /// Record a new next checkpoint number (done by the commit layer).
    fn set_cno(&self, cno: u64);

    fn read_only(&self) -> bool;

    /// Record the entry size and the header-reserved bytes at init time.
    fn set_entry_size(&self, entry_size: usize, header_bytes: usize) -> Result<()>;

    /// Fetch one block. A hole yields `NoEntry` unless `create` is set, in
    /// which case a zeroed block runs through `init` before first return.
    fn get_block(
        &self,
        blkoff: u64,
        create: bool,
        init: Option<&dyn Fn(&mut [u8])>,
    ) -> Result<Block>;

    /// Next existing block in the inclusive range `[start_blkoff, end_blkoff]`.
    fn find_block(&self, start_blkoff: u64, end_blkoff: u64) -> Result<(u64, Block)>;

    /// Store a fetched copy back and mark the block dirty.
    fn write_block(&self, block: &Block) -> Result<()>;

    /// Drop a block, turning its offset back into a hole.
    fn delete_block(&self, blkoff: u64) -> Result<()>;

    /// Mark the file's inode dirty.
    fn mark_dirty(&self);

    /// Persist dirty state. Stand-in for the segment writer.
    fn flush(&self) -> Result<()>;
}

impl<M: MetaFile + ?Sized> MetaFile for Arc<M> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn cno(&self) -> u64 {
        (**self).cno()
    }

    fn set_cno(&self, cno: u64) {
        (**self).set_cno(cno)
    }

    fn read_only(&self) -> bool {
        (**self).read_only()
    }

    fn set_entry_size(&self, entry_size: usize, header_bytes: usize) -> Result<()> {
        (**self).set_entry_size(entry_size, header_bytes)
    }

    fn get_block(
        &self,
        blkoff: u64,
        create: bool,
        init: Option<&dyn Fn(&mut [u8])>,
    ) -> Result<Block> {
        (**self).get_block(blkoff, create, init)
    }

    fn find_block(&self, start_blkoff: u64, end_blkoff: u64) -> Result<(u64, Block)> {
        (**self).find_block(start_blkoff, end_blkoff)
    }

    fn write_block(&self, block: &Block) -> Result<()> {
        (**self).write_block(block)
    }

    fn delete_block(&self, blkoff: u64) -> Result<()> {
        (**self).delete_block(blkoff)
    }

    fn mark_dirty(&self) {
        (**self).mark_dirty()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NoEntry.errno(), libc::ENOENT);
        assert_eq!(FsError::Busy("test").errno(), libc::EBUSY);
        assert_eq!(FsError::Corrupted("test".to_string()).errno(), libc::EIO);
        assert_eq!(FsError::Invalid("test".to_string()).errno(), libc::EINVAL);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(FsError::Already.errno(), libc::EALREADY);
    }
}
