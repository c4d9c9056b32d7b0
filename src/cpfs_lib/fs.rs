//! Checkpoint file operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::*;

use meta_file::{FsError, MetaFile, Result};

use crate::cpfs_lib::desc::{CheckpointEntry, CpMode, CpStat, Cpinfo, RawInode};
use crate::cpfs_lib::Cpfile;

/// Root object of one filesystem tree.
///
/// The counters are read by paths that do not take the cpfile lock, so they
/// are published with 64-bit atomic stores.
pub struct Root {
    pub inodes_count: AtomicU64,
    pub blocks_count: AtomicU64,
    ifile: Mutex<RawInode>,
}

impl Root {
    pub fn new(ifile: RawInode) -> Self {
        Self {
            inodes_count: AtomicU64::new(0),
            blocks_count: AtomicU64::new(0),
            ifile: Mutex::new(ifile),
        }
    }

    pub fn attach_ifile(&self, inode: RawInode) {
        *self.ifile.lock().unwrap() = inode;
    }

    pub fn ifile(&self) -> RawInode {
        *self.ifile.lock().unwrap()
    }
}

impl<T: MetaFile> Cpfile<T> {
    /// Bring the entry for `cno` into existence (still unpopulated).
    /// Re-creating an existing entry is a success.
    pub fn create_checkpoint(&self, cno: u64) -> Result<()> {
        if cno == 0 {
            return Err(FsError::Invalid("checkpoint number 0 is reserved".to_string()));
        }
        let meta = self.meta.write().unwrap();
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        // the header must exist before any checkpoint does
        self.get_header_block(&*meta)?;
        let mut block = self.get_cp_block(&*meta, cno, true)?;
        let mut entry = self.read_entry(&block, cno)?;
        if entry.is_invalid() {
            entry.clear_invalid();
            self.write_entry(&mut block, cno, &entry);
            if !self.in_first_block(cno) {
                self.census_add(&mut block, 1)?;
            }
            meta.write_block(&block)?;

            let mut header_block = self.get_header_block(&*meta)?;
            let mut header = self.read_header(&header_block)?;
            let ncheckpoints = header.ch_ncheckpoints.get();
            header.ch_ncheckpoints.set(ncheckpoints + 1);
            self.write_header(&mut header_block, &header);
            meta.write_block(&header_block)?;
            debug!("cpfile: created checkpoint {}", cno);
        } else {
            // already valid after an earlier attempt
            meta.write_block(&block)?;
        }
        meta.mark_dirty();
        Ok(())
    }

    /// Fill the populated portion of an existing entry at write-out time.
    pub fn finalize_checkpoint(
        &self,
        cno: u64,
        root: &Root,
        blkinc: u64,
        ctime: u64,
        minor: bool,
    ) -> Result<()> {
        if cno == 0 {
            return Err(FsError::Invalid("checkpoint number 0 is reserved".to_string()));
        }
        let meta = self.meta.write().unwrap();
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        // create has established the block; absence can only mean corruption
        let mut block = match self.get_cp_block(&*meta, cno, false) {
            Ok(block) => block,
            Err(FsError::NoEntry) => {
                return Err(self.corrupted(cno, "checkpoint finalization found no block"))
            }
            Err(err) => return Err(err),
        };
        let mut entry = self.read_entry(&block, cno)?;
        if entry.is_invalid() {
            return Err(self.corrupted(cno, "checkpoint finalization found an invalid entry"));
        }
        entry.cp_snapshot_list.ssl_next.set(0);
        entry.cp_snapshot_list.ssl_prev.set(0);
        entry
            .cp_inodes_count
            .set(root.inodes_count.load(Ordering::Relaxed));
        entry
            .cp_blocks_count
            .set(root.blocks_count.load(Ordering::Relaxed));
        entry.cp_nblk_inc.set(blkinc);
        entry.cp_create.set(ctime);
        entry.cp_cno.set(cno);
        if minor {
            entry.set_minor();
        } else {
            entry.clear_minor();
        }
        entry.cp_ifile_inode = root.ifile();
        self.write_entry(&mut block, cno, &entry);
        meta.write_block(&block)?;
        meta.mark_dirty();
        debug!("cpfile: finalized checkpoint {}", cno);
        Ok(())
    }

    /// Load the checkpoint into the root object: publish its counters and
    /// attach its ifile root inode.
    pub fn read_checkpoint(&self, cno: u64, root: &Root) -> Result<()> {
        let meta = self.meta.read().unwrap();
        if cno == 0 || cno >= meta.cno() {
            return Err(FsError::Invalid(format!(
                "checkpoint number {} out of range",
                cno
            )));
        }
        let block = self.get_cp_block(&*meta, cno, false)?;
        let entry = self.read_entry(&block, cno)?;
        if entry.is_invalid() {
            return Err(FsError::Invalid(format!("checkpoint {} is invalid", cno)));
        }
        let inode = entry.cp_ifile_inode;
        // a valid checkpoint must carry a usable ifile inode
        if inode.i_mode.get() == 0 {
            return Err(self.corrupted(cno, "checkpoint carries an unreadable ifile inode"));
        }
        root.inodes_count
            .store(entry.cp_inodes_count.get(), Ordering::Relaxed);
        root.blocks_count
            .store(entry.cp_blocks_count.get(), Ordering::Relaxed);
        root.attach_ifile(inode);
        Ok(())
    }

    /// Delete the plain checkpoints in the half-open range `[start, end)`.
    ///
    /// Snapshots in the range survive and make the call fail with `Busy`,
    /// but only after every plain checkpoint has been removed; callers rely
    /// on that partial progress.
    pub fn delete_checkpoints(&self, start: u64, end: u64) -> Result<()> {
        if start == 0 || start > end {
            return Err(FsError::Invalid(format!(
                "bad checkpoint range [{}, {})",
                start, end
            )));
        }
        let meta = self.meta.write().unwrap();
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        let mut total: u64 = 0;
        let mut snapshots: u64 = 0;
        let mut cno = start;
        while cno < end {
            let ncps = self.cp_in_range(cno, end);
            let blkoff = self.cp_blkoff(cno);
            match self.get_cp_block(&*meta, cno, false) {
                Err(FsError::NoEntry) => {} // hole, skip the whole stride
                Err(err) => return Err(err),
                Ok(mut block) => {
                    let mut nicps: u32 = 0;
                    for c in cno..cno + ncps {
                        let mut entry = self.read_entry(&block, c)?;
                        if entry.is_invalid() {
                            continue;
                        }
                        if entry.is_snapshot() {
                            snapshots += 1;
                            continue;
                        }
                        entry.set_invalid();
                        self.write_entry(&mut block, c, &entry);
                        nicps += 1;
                    }
                    if nicps > 0 {
                        total += nicps as u64;
                        if blkoff != 0 {
                            let count = self.census_sub(&mut block, nicps)?;
                            if count == 0 {
                                self.delete_cp_block(&*meta, blkoff)?;
                            } else {
                                meta.write_block(&block)?;
                            }
                        } else {
                            meta.write_block(&block)?;
                        }
                    }
                }
            }
            cno += ncps;
        }
        if total > 0 {
            let mut header_block = self.get_header_block(&*meta)?;
            let mut header = self.read_header(&header_block)?;
            let ncheckpoints = header.ch_ncheckpoints.get();
            if total > ncheckpoints {
                warn!(
                    "cpfile: deleting {} checkpoints but header counts {}",
                    total, ncheckpoints
                );
            }
            header.ch_ncheckpoints.set(ncheckpoints.saturating_sub(total));
            self.write_header(&mut header_block, &header);
            meta.write_block(&header_block)?;
            meta.mark_dirty();
            debug!("cpfile: deleted {} checkpoints in [{}, {})", total, start, end);
        }
        if snapshots > 0 {
            return Err(FsError::Busy("snapshots in range are protected"));
        }
        Ok(())
    }

    /// Delete one checkpoint; `Busy` if it is a snapshot.
    pub fn delete_checkpoint(&self, cno: u64) -> Result<()> {
        let mut probe = cno;
        let found = self.get_cpinfo(&mut probe, CpMode::Checkpoint, 1)?;
        match found.first() {
            None => Err(FsError::NoEntry),
            Some(ci) if ci.ci_cno != cno => Err(FsError::NoEntry),
            Some(ci) if ci.is_snapshot() => Err(FsError::Busy("checkpoint is a snapshot")),
            Some(_) => self.delete_checkpoints(cno, cno + 1),
        }
    }

    /// Enumerate checkpoint summaries starting at `*cnop`.
    ///
    /// CHECKPOINT mode scans the table in cno order skipping holes and
    /// invalid slots; SNAPSHOT mode follows the snapshot list. On success
    /// `*cnop` is advanced so the next call resumes after the last summary.
    pub fn get_cpinfo(&self, cnop: &mut u64, mode: CpMode, max: usize) -> Result<Vec<Cpinfo>> {
        match mode {
            CpMode::Checkpoint => self.get_cpinfo_checkpoints(cnop, max),
            CpMode::Snapshot => self.get_cpinfo_snapshots(cnop, max),
        }
    }

    fn get_cpinfo_checkpoints(&self, cnop: &mut u64, max: usize) -> Result<Vec<Cpinfo>> {
        if *cnop == 0 {
            return Err(FsError::NoEntry);
        }
        let meta = self.meta.read().unwrap();
        let cur_cno = meta.cno();
        let mut out = Vec::new();
        let mut cno = *cnop;
        'scan: while cno < cur_cno && out.len() < max {
            let (found, block) = match self.find_cp_block(&*meta, cno, cur_cno - 1) {
                Ok(found) => found,
                Err(FsError::NoEntry) => break,
                Err(err) => return Err(err),
            };
            cno = found;
            let ncps = self.cp_in_range(cno, cur_cno);
            for c in cno..cno + ncps {
                let entry = self.read_entry(&block, c)?;
                if entry.is_invalid() {
                    continue;
                }
                out.push(self.entry_to_cpinfo(&entry, c));
                if out.len() == max {
                    break 'scan;
                }
            }
            cno += ncps;
        }
        if let Some(last) = out.last() {
            *cnop = last.ci_cno + 1;
        }
        Ok(out)
    }

    pub(crate) fn entry_to_cpinfo(&self, entry: &CheckpointEntry, cno: u64) -> Cpinfo {
        Cpinfo {
            ci_cno: cno,
            ci_create: entry.cp_create.get(),
            ci_nblk_inc: entry.cp_nblk_inc.get(),
            ci_inodes_count: entry.cp_inodes_count.get(),
            ci_blocks_count: entry.cp_blocks_count.get(),
            ci_flags: entry.cp_flags.get(),
            ci_next: entry.cp_snapshot_list.ssl_next.get(),
        }
    }

    /// Aggregate counters.
    pub fn get_stat(&self) -> Result<CpStat> {
        let meta = self.meta.read().unwrap();
        let header_block = self.get_header_block(&*meta)?;
        let header = self.read_header(&header_block)?;
        Ok(CpStat {
            cs_cno: meta.cno(),
            cs_ncps: header.ch_ncheckpoints.get(),
            cs_nsss: header.ch_nsnapshots.get(),
        })
    }
}
