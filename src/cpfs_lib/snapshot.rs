//! Snapshot list management.
//!
//! Snapshots are threaded through the checkpoint entries as a doubly-linked
//! list keyed by cno, ascending from the header sentinel. Links hold cnos by
//! value, a zero link meaning "the header is the neighbor", so the on-disk
//! graph has no pointers to dangle.

use log::*;

use meta_file::{FsError, MetaFile, Result};

use crate::cpfs_lib::desc::{CpMode, Cpinfo, SnapshotList, CNO_TERMINATOR, CPFILE_INO};
use crate::cpfs_lib::Cpfile;

impl<T: MetaFile> Cpfile<T> {
    /// Switch a checkpoint between plain and snapshot mode.
    pub fn change_cpmode(&self, cno: u64, mode: CpMode) -> Result<()> {
        match mode {
            CpMode::Snapshot => self.set_snapshot(cno),
            CpMode::Checkpoint => {
                if self.is_mounted(cno) {
                    return Err(FsError::Busy("checkpoint is mounted"));
                }
                self.clear_snapshot(cno)
            }
        }
    }

    pub fn is_snapshot(&self, cno: u64) -> Result<bool> {
        let meta = self.meta.read().unwrap();
        if cno == 0 || cno >= meta.cno() {
            return Err(FsError::NoEntry);
        }
        let block = self.get_cp_block(&*meta, cno, false)?;
        let entry = self.read_entry(&block, cno)?;
        if entry.is_invalid() {
            return Err(FsError::NoEntry);
        }
        Ok(entry.is_snapshot())
    }

    /// Promote a checkpoint to a snapshot, splicing it into the list in cno
    /// order. Promoting a snapshot again is a success.
    pub(crate) fn set_snapshot(&self, cno: u64) -> Result<()> {
        if cno == 0 {
            return Err(FsError::NoEntry);
        }
        let meta = self.meta.write().unwrap();
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        {
            let block = self.get_cp_block(&*meta, cno, false)?;
            let entry = self.read_entry(&block, cno)?;
            if entry.is_invalid() {
                return Err(FsError::NoEntry);
            }
            if entry.is_snapshot() {
                return Ok(());
            }
        }

        // Find the insertion point walking backward from the tail; snapshots
        // are usually promoted in ascending cno order, keeping this short.
        // Afterwards prev <= cno < curr, 0 standing for the header on either
        // side.
        let header_block = self.get_header_block(&*meta)?;
        let header = self.read_header(&header_block)?;
        let mut curr: u64 = 0;
        let mut prev = header.ch_snapshot_list.ssl_prev.get();
        drop(header_block);
        let mut walk_block = None;
        while prev > cno {
            let prev_blkoff = self.cp_blkoff(prev);
            let block = match walk_block.take() {
                Some(block) => block,
                None => self.get_cp_block(&*meta, prev, false)?,
            };
            let entry = self.read_entry(&block, prev)?;
            curr = prev;
            prev = entry.cp_snapshot_list.ssl_prev.get();
            // keep the mapping only while the walk stays in this block
            if prev != 0 && self.cp_blkoff(prev) == prev_blkoff {
                walk_block = Some(block);
            }
        }
        drop(walk_block);

        // splice: neighbor, the entry itself, other neighbor, then header
        self.patch_list(&*meta, curr, |list| list.ssl_prev.set(cno))?;
        {
            let mut block = self.get_cp_block(&*meta, cno, false)?;
            let mut entry = self.read_entry(&block, cno)?;
            entry.cp_snapshot_list.ssl_next.set(curr);
            entry.cp_snapshot_list.ssl_prev.set(prev);
            entry.set_snapshot();
            self.write_entry(&mut block, cno, &entry);
            meta.write_block(&block)?;
        }
        self.patch_list(&*meta, prev, |list| list.ssl_next.set(cno))?;

        let mut header_block = self.get_header_block(&*meta)?;
        let mut header = self.read_header(&header_block)?;
        let nsnapshots = header.ch_nsnapshots.get();
        header.ch_nsnapshots.set(nsnapshots + 1);
        self.write_header(&mut header_block, &header);
        meta.write_block(&header_block)?;
        meta.mark_dirty();
        debug!("cpfile: checkpoint {} promoted to snapshot", cno);
        Ok(())
    }

    /// Demote a snapshot back to a plain checkpoint, unlinking it from the
    /// list. Demoting a plain checkpoint is a success.
    pub(crate) fn clear_snapshot(&self, cno: u64) -> Result<()> {
        if cno == 0 {
            return Err(FsError::NoEntry);
        }
        let meta = self.meta.write().unwrap();
        if meta.read_only() {
            return Err(FsError::ReadOnly);
        }
        let (next, prev) = {
            let block = self.get_cp_block(&*meta, cno, false)?;
            let entry = self.read_entry(&block, cno)?;
            if entry.is_invalid() {
                return Err(FsError::NoEntry);
            }
            if !entry.is_snapshot() {
                return Ok(());
            }
            (
                entry.cp_snapshot_list.ssl_next.get(),
                entry.cp_snapshot_list.ssl_prev.get(),
            )
        };

        // unlink: neighbor, other neighbor, the entry itself, then header
        self.patch_list(&*meta, next, |list| list.ssl_prev.set(prev))?;
        self.patch_list(&*meta, prev, |list| list.ssl_next.set(next))?;
        {
            let mut block = self.get_cp_block(&*meta, cno, false)?;
            let mut entry = self.read_entry(&block, cno)?;
            entry.cp_snapshot_list.ssl_next.set(0);
            entry.cp_snapshot_list.ssl_prev.set(0);
            entry.clear_snapshot();
            self.write_entry(&mut block, cno, &entry);
            meta.write_block(&block)?;
        }

        let mut header_block = self.get_header_block(&*meta)?;
        let mut header = self.read_header(&header_block)?;
        let nsnapshots = header.ch_nsnapshots.get();
        if nsnapshots == 0 {
            warn!(
                "cpfile (ino={}): snapshot count underflow clearing cno {}",
                CPFILE_INO, cno
            );
        }
        header.ch_nsnapshots.set(nsnapshots.saturating_sub(1));
        self.write_header(&mut header_block, &header);
        meta.write_block(&header_block)?;
        meta.mark_dirty();
        debug!("cpfile: snapshot {} reverted to plain checkpoint", cno);
        Ok(())
    }

    /// Rewrite the snapshot links of one list position; cno 0 addresses the
    /// header sentinel. Each patch is an independent read-modify-write so
    /// positions sharing a block can never hold two live copies.
    fn patch_list<F>(&self, meta: &T, cno: u64, patch: F) -> Result<()>
    where
        F: FnOnce(&mut SnapshotList),
    {
        if cno == 0 {
            let mut block = self.get_header_block(meta)?;
            let mut header = self.read_header(&block)?;
            patch(&mut header.ch_snapshot_list);
            self.write_header(&mut block, &header);
            meta.write_block(&block)
        } else {
            let mut block = self.get_cp_block(meta, cno, false)?;
            let mut entry = self.read_entry(&block, cno)?;
            patch(&mut entry.cp_snapshot_list);
            self.write_entry(&mut block, cno, &entry);
            meta.write_block(&block)
        }
    }

    /// SNAPSHOT-mode enumeration: follow the list from `*cnop` (0 starts at
    /// the head, the terminator yields nothing), re-fetching only when the
    /// walk crosses a block boundary.
    pub(crate) fn get_cpinfo_snapshots(&self, cnop: &mut u64, max: usize) -> Result<Vec<Cpinfo>> {
        let meta = self.meta.read().unwrap();
        let mut curr = *cnop;
        if curr == 0 {
            let header_block = self.get_header_block(&*meta)?;
            let header = self.read_header(&header_block)?;
            curr = header.ch_snapshot_list.ssl_next.get();
            if curr == 0 {
                return Ok(Vec::new());
            }
        } else if curr == CNO_TERMINATOR {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut curr_blkoff = self.cp_blkoff(curr);
        let mut block = match self.get_cp_block(&*meta, curr, false) {
            Ok(block) => block,
            Err(FsError::NoEntry) => {
                // a hole reached through the list is a bug somewhere, but the
                // walk just ends here
                warn!(
                    "cpfile (ino={}): snapshot list leads into a hole (cno={})",
                    CPFILE_INO, curr
                );
                *cnop = curr;
                return Ok(out);
            }
            Err(err) => return Err(err),
        };
        while out.len() < max {
            let entry = self.read_entry(&block, curr)?;
            if entry.is_invalid() || !entry.is_snapshot() {
                // tolerated as end of list
                break;
            }
            out.push(self.entry_to_cpinfo(&entry, curr));
            let next = entry.cp_snapshot_list.ssl_next.get();
            if next == 0 {
                curr = CNO_TERMINATOR;
                break;
            }
            let next_blkoff = self.cp_blkoff(next);
            if next_blkoff != curr_blkoff {
                block = match self.get_cp_block(&*meta, next, false) {
                    Ok(block) => block,
                    Err(FsError::NoEntry) => {
                        warn!(
                            "cpfile (ino={}): snapshot list leads into a hole (cno={})",
                            CPFILE_INO, next
                        );
                        curr = next;
                        break;
                    }
                    Err(err) => return Err(err),
                };
            }
            curr = next;
            curr_blkoff = next_blkoff;
        }
        *cnop = curr;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpfs_lib::fs::Root;
    use crate::cpfs_lib::desc::RawInode;
    use anyhow::Result as TestResult;
    use meta_file::MemMetaFile;
    use std::sync::Arc;

    fn fixture(last: u64) -> TestResult<(Arc<MemMetaFile>, Cpfile<Arc<MemMetaFile>>)> {
        let store = Arc::new(MemMetaFile::new(1024));
        let cpfile = Cpfile::read(Arc::clone(&store), 256, &RawInode::zeroed())?;
        cpfile.initialize()?;
        let root = Root::new(RawInode::metadata_file(1_700_000_000));
        for cno in 1..=last {
            cpfile.create_checkpoint(cno)?;
            cpfile.finalize_checkpoint(cno, &root, 1, 1_700_000_000 + cno, false)?;
        }
        store.set_cno(last + 1);
        Ok((store, cpfile))
    }

    fn snapshot_cnos(cpfile: &Cpfile<Arc<MemMetaFile>>) -> TestResult<Vec<u64>> {
        let mut cno = 0;
        let mut cnos = Vec::new();
        loop {
            let batch = cpfile.get_cpinfo(&mut cno, CpMode::Snapshot, 3)?;
            if batch.is_empty() {
                break;
            }
            cnos.extend(batch.iter().map(|ci| ci.ci_cno));
        }
        Ok(cnos)
    }

    #[test]
    fn first_snapshot_links_to_header() -> TestResult<()> {
        let (store, cpfile) = fixture(3)?;
        cpfile.set_snapshot(2)?;
        let block = store.get_block(0, false, None)?;
        let header = cpfile.read_header(&block)?;
        assert_eq!(header.ch_snapshot_list.ssl_next.get(), 2);
        assert_eq!(header.ch_snapshot_list.ssl_prev.get(), 2);
        assert_eq!(header.ch_nsnapshots.get(), 1);
        let entry = cpfile.read_entry(&block, 2)?;
        assert!(entry.is_snapshot());
        assert_eq!(entry.cp_snapshot_list.ssl_next.get(), 0);
        assert_eq!(entry.cp_snapshot_list.ssl_prev.get(), 0);
        Ok(())
    }

    #[test]
    fn insertion_keeps_cno_order() -> TestResult<()> {
        let (store, cpfile) = fixture(30)?;
        cpfile.set_snapshot(10)?;
        cpfile.set_snapshot(30)?;
        // inserted between existing neighbors
        cpfile.set_snapshot(20)?;

        assert_eq!(snapshot_cnos(&cpfile)?, vec![10, 20, 30]);
        assert_eq!(cpfile.get_stat()?.cs_nsss, 3);

        // walk backward over the raw links: header.prev = 30 -> 20 -> 10 -> header
        let header_block = store.get_block(0, false, None)?;
        let header = cpfile.read_header(&header_block)?;
        assert_eq!(header.ch_snapshot_list.ssl_prev.get(), 30);
        let meta = Arc::clone(&store);
        let read_links = |cno: u64| -> TestResult<(u64, u64)> {
            let block = meta.get_block(cpfile.cp_blkoff(cno), false, None)?;
            let entry = cpfile.read_entry(&block, cno)?;
            Ok((
                entry.cp_snapshot_list.ssl_next.get(),
                entry.cp_snapshot_list.ssl_prev.get(),
            ))
        };
        assert_eq!(read_links(30)?, (0, 20));
        assert_eq!(read_links(20)?, (30, 10));
        assert_eq!(read_links(10)?, (20, 0));

        let report = cpfile.verify()?;
        assert!(report.ok(), "{:?}", report.errors);
        Ok(())
    }

    #[test]
    fn set_snapshot_is_idempotent() -> TestResult<()> {
        let (_, cpfile) = fixture(5)?;
        cpfile.set_snapshot(3)?;
        cpfile.set_snapshot(3)?;
        assert_eq!(cpfile.get_stat()?.cs_nsss, 1);
        assert_eq!(snapshot_cnos(&cpfile)?, vec![3]);
        Ok(())
    }

    #[test]
    fn clear_snapshot_relinks_neighbors() -> TestResult<()> {
        let (_, cpfile) = fixture(9)?;
        for cno in [2u64, 5, 8] {
            cpfile.set_snapshot(cno)?;
        }
        cpfile.clear_snapshot(5)?;
        assert_eq!(snapshot_cnos(&cpfile)?, vec![2, 8]);
        assert_eq!(cpfile.get_stat()?.cs_nsss, 2);
        // clearing a plain checkpoint is a no-op success
        cpfile.clear_snapshot(5)?;
        assert_eq!(cpfile.get_stat()?.cs_nsss, 2);
        let report = cpfile.verify()?;
        assert!(report.ok(), "{:?}", report.errors);
        Ok(())
    }

    #[test]
    fn set_then_clear_restores_entry() -> TestResult<()> {
        let (store, cpfile) = fixture(4)?;
        let before = {
            let block = store.get_block(cpfile.cp_blkoff(4), false, None)?;
            cpfile.read_entry(&block, 4)?
        };
        cpfile.set_snapshot(4)?;
        cpfile.clear_snapshot(4)?;
        let after = {
            let block = store.get_block(cpfile.cp_blkoff(4), false, None)?;
            cpfile.read_entry(&block, 4)?
        };
        assert_eq!(before.cp_flags.get(), after.cp_flags.get());
        assert_eq!(after.cp_snapshot_list.ssl_next.get(), 0);
        assert_eq!(after.cp_snapshot_list.ssl_prev.get(), 0);
        assert_eq!(cpfile.get_stat()?.cs_nsss, 0);
        Ok(())
    }

    #[test]
    fn missing_checkpoints_cannot_be_snapshots() -> TestResult<()> {
        let (_, cpfile) = fixture(3)?;
        assert!(matches!(cpfile.set_snapshot(0), Err(FsError::NoEntry)));
        // a hole
        assert!(matches!(cpfile.set_snapshot(20), Err(FsError::NoEntry)));
        // deleted entry
        cpfile.delete_checkpoint(2)?;
        assert!(matches!(cpfile.set_snapshot(2), Err(FsError::NoEntry)));
        Ok(())
    }

    #[test]
    fn is_snapshot_classifies() -> TestResult<()> {
        let (_, cpfile) = fixture(3)?;
        cpfile.set_snapshot(2)?;
        assert!(cpfile.is_snapshot(2)?);
        assert!(!cpfile.is_snapshot(1)?);
        assert!(matches!(cpfile.is_snapshot(0), Err(FsError::NoEntry)));
        // at or past the next checkpoint number
        assert!(matches!(cpfile.is_snapshot(4), Err(FsError::NoEntry)));
        assert!(matches!(cpfile.is_snapshot(99), Err(FsError::NoEntry)));
        Ok(())
    }

    #[test]
    fn mounted_snapshot_stays_snapshot() -> TestResult<()> {
        let (_, cpfile) = fixture(3)?;
        cpfile.change_cpmode(2, CpMode::Snapshot)?;
        cpfile.set_mounted(2);
        let err = cpfile.change_cpmode(2, CpMode::Checkpoint).unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
        cpfile.clear_mounted(2);
        cpfile.change_cpmode(2, CpMode::Checkpoint)?;
        assert!(!cpfile.is_snapshot(2)?);
        Ok(())
    }

    #[test]
    fn change_cpmode_is_idempotent() -> TestResult<()> {
        let (_, cpfile) = fixture(3)?;
        cpfile.change_cpmode(2, CpMode::Snapshot)?;
        cpfile.change_cpmode(2, CpMode::Snapshot)?;
        assert_eq!(cpfile.get_stat()?.cs_nsss, 1);
        cpfile.change_cpmode(2, CpMode::Checkpoint)?;
        cpfile.change_cpmode(2, CpMode::Checkpoint)?;
        assert_eq!(cpfile.get_stat()?.cs_nsss, 0);
        Ok(())
    }

    #[test]
    fn snapshot_walk_crosses_blocks_and_resumes() -> TestResult<()> {
        let (_, cpfile) = fixture(20)?;
        for cno in [1u64, 4, 9, 13, 17] {
            cpfile.set_snapshot(cno)?;
        }
        // batches of one force a resume at every node
        let mut cno = 0;
        let mut seen = Vec::new();
        loop {
            let batch = cpfile.get_cpinfo(&mut cno, CpMode::Snapshot, 1)?;
            if batch.is_empty() {
                break;
            }
            seen.push(batch[0].ci_cno);
        }
        assert_eq!(seen, vec![1, 4, 9, 13, 17]);
        assert_eq!(cno, CNO_TERMINATOR);
        Ok(())
    }

    #[test]
    fn empty_list_enumerates_nothing() -> TestResult<()> {
        let (_, cpfile) = fixture(3)?;
        let mut cno = 0;
        assert!(cpfile.get_cpinfo(&mut cno, CpMode::Snapshot, 8)?.is_empty());
        assert_eq!(cno, 0);
        Ok(())
    }

    #[test]
    fn concurrent_toggles_keep_list_well_formed() -> TestResult<()> {
        use std::thread;

        let (_, cpfile) = fixture(64)?;
        let cpfile = Arc::new(cpfile);

        let mut workers = Vec::new();
        for worker in 0..4u64 {
            let cpfile = Arc::clone(&cpfile);
            workers.push(thread::spawn(move || {
                for round in 0..8u64 {
                    let cno = 1 + worker * 16 + round;
                    cpfile.set_snapshot(cno).unwrap();
                    if round % 2 == 0 {
                        cpfile.clear_snapshot(cno).unwrap();
                    }
                }
            }));
        }
        for reader in 0..2 {
            let cpfile = Arc::clone(&cpfile);
            workers.push(thread::spawn(move || {
                for _ in 0..16 {
                    let mut cno = 0;
                    // the walk itself must never trip over a half-spliced list
                    let mut last = 0;
                    loop {
                        let batch = cpfile.get_cpinfo(&mut cno, CpMode::Snapshot, 4).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        for ci in &batch {
                            assert!(ci.ci_cno > last, "reader {} saw disorder", reader);
                            last = ci.ci_cno;
                        }
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        let report = cpfile.verify()?;
        assert!(report.ok(), "{:?}", report.errors);
        assert_eq!(cpfile.get_stat()?.cs_nsss, 16);
        Ok(())
    }
}
