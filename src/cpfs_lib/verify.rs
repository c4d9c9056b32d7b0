//! Structure verification.
//!
//! Walks the whole checkpoint file and cross-checks the per-block censuses,
//! the header aggregates and the snapshot list. Nothing is repaired; the
//! report is for fsck-style tooling and for tests.

use log::*;

use meta_file::{FsError, MetaFile, Result};

use crate::cpfs_lib::Cpfile;

#[derive(Debug, Default)]
pub struct VerifyReport {
    /// allocated blocks, the header block included
    pub nblocks: u64,
    /// valid checkpoint entries found
    pub ncheckpoints: u64,
    /// snapshot entries found
    pub nsnapshots: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<T: MetaFile> Cpfile<T> {
    /// Check every invariant the on-disk structure promises.
    pub fn verify(&self) -> Result<VerifyReport> {
        let meta = self.meta.read().unwrap();
        let cur_cno = meta.cno();
        let mut report = VerifyReport::default();

        let header_block = self.get_header_block(&*meta)?;
        let header = self.read_header(&header_block)?;
        drop(header_block);

        // pass 1: the packed array, block by block
        let entries_per_block = self.entries_per_block as u64;
        let mut ncheckpoints = 0u64;
        let mut nsnapshots = 0u64;
        let mut blkoff = 0u64;
        loop {
            let (b, block) = match meta.find_block(blkoff, u64::MAX) {
                Ok(found) => found,
                Err(FsError::NoEntry) => break,
                Err(err) => return Err(err),
            };
            report.nblocks += 1;
            let first_slot = if b == 0 { self.first_entry_offset } else { 0 };
            let mut valid = 0u32;
            for slot in first_slot..entries_per_block {
                let cno = entries_per_block * b + slot + 1 - self.first_entry_offset;
                let entry = self.read_entry(&block, cno)?;
                if entry.is_invalid() {
                    if entry.is_snapshot() {
                        report
                            .errors
                            .push(format!("cno {}: invalid entry carries the snapshot flag", cno));
                    }
                    continue;
                }
                valid += 1;
                // the header aggregates only cover cnos below the next
                // checkpoint number; anything valid past it is stray
                if cno >= cur_cno {
                    report.errors.push(format!(
                        "cno {}: valid entry at or past the next checkpoint number {}",
                        cno, cur_cno
                    ));
                    continue;
                }
                ncheckpoints += 1;
                if entry.is_snapshot() {
                    nsnapshots += 1;
                }
            }
            if b != 0 {
                let census = self.census(&block)?;
                if census != valid {
                    report.errors.push(format!(
                        "block {}: census says {} but {} entries are valid",
                        b, census, valid
                    ));
                }
                if valid == 0 {
                    report
                        .errors
                        .push(format!("block {}: exists with no valid entries", b));
                }
            }
            blkoff = b + 1;
        }

        if header.ch_ncheckpoints.get() != ncheckpoints {
            report.errors.push(format!(
                "header counts {} checkpoints, table holds {}",
                header.ch_ncheckpoints.get(),
                ncheckpoints
            ));
        }
        if header.ch_nsnapshots.get() != nsnapshots {
            report.errors.push(format!(
                "header counts {} snapshots, table holds {}",
                header.ch_nsnapshots.get(),
                nsnapshots
            ));
        }

        // pass 2: the snapshot list, head to tail
        let mut walked = 0u64;
        let mut prev_cno = 0u64;
        let mut curr = header.ch_snapshot_list.ssl_next.get();
        while curr != 0 {
            if walked >= nsnapshots {
                report.errors.push(format!(
                    "snapshot list does not terminate after {} nodes",
                    walked
                ));
                break;
            }
            let block = match self.get_cp_block(&*meta, curr, false) {
                Ok(block) => block,
                Err(FsError::NoEntry) => {
                    report
                        .errors
                        .push(format!("snapshot list leads into a hole at cno {}", curr));
                    break;
                }
                Err(err) => return Err(err),
            };
            let entry = self.read_entry(&block, curr)?;
            if entry.is_invalid() || !entry.is_snapshot() {
                report
                    .errors
                    .push(format!("snapshot list node {} is not a snapshot", curr));
                break;
            }
            if curr <= prev_cno {
                report.errors.push(format!(
                    "snapshot list is not ascending at cno {} after {}",
                    curr, prev_cno
                ));
                break;
            }
            if entry.cp_snapshot_list.ssl_prev.get() != prev_cno {
                report.errors.push(format!(
                    "cno {}: back link says {} instead of {}",
                    curr,
                    entry.cp_snapshot_list.ssl_prev.get(),
                    prev_cno
                ));
            }
            prev_cno = curr;
            walked += 1;
            curr = entry.cp_snapshot_list.ssl_next.get();
        }
        if header.ch_snapshot_list.ssl_prev.get() != prev_cno {
            report.errors.push(format!(
                "header tail link says {} instead of {}",
                header.ch_snapshot_list.ssl_prev.get(),
                prev_cno
            ));
        }
        if walked != nsnapshots && report.ok() {
            report.errors.push(format!(
                "snapshot list threads {} of {} snapshots",
                walked, nsnapshots
            ));
        }

        report.ncheckpoints = ncheckpoints;
        report.nsnapshots = nsnapshots;
        for error in &report.errors {
            warn!("cpfile verify: {}", error);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpfs_lib::desc::{CpMode, RawInode};
    use crate::cpfs_lib::fs::Root;
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

    #[test]
    fn clean_file_passes() -> TestResult<()> {
        let (_, cpfile) = fixture(10)?;
        cpfile.change_cpmode(3, CpMode::Snapshot)?;
        cpfile.change_cpmode(7, CpMode::Snapshot)?;
        cpfile.delete_checkpoints(5, 7)?;
        let report = cpfile.verify()?;
        assert!(report.ok(), "{:?}", report.errors);
        assert_eq!(report.ncheckpoints, 8);
        assert_eq!(report.nsnapshots, 2);
        assert_eq!(report.nblocks, 3);
        Ok(())
    }

    #[test]
    fn detects_census_drift() -> TestResult<()> {
        let (store, cpfile) = fixture(6)?;
        let mut block = store.get_block(1, false, None)?;
        cpfile.census_add(&mut block, 1)?;
        store.write_block(&block)?;
        let report = cpfile.verify()?;
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("census")));
        Ok(())
    }

    #[test]
    fn detects_broken_back_link() -> TestResult<()> {
        let (store, cpfile) = fixture(6)?;
        cpfile.change_cpmode(2, CpMode::Snapshot)?;
        cpfile.change_cpmode(5, CpMode::Snapshot)?;
        // clobber 5's back link behind the manager's back
        let mut block = store.get_block(cpfile.cp_blkoff(5), false, None)?;
        let mut entry = cpfile.read_entry(&block, 5)?;
        entry.cp_snapshot_list.ssl_prev.set(4);
        cpfile.write_entry(&mut block, 5, &entry);
        store.write_block(&block)?;
        let report = cpfile.verify()?;
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("back link")));
        Ok(())
    }

    #[test]
    fn detects_entries_past_next_cno() -> TestResult<()> {
        let (store, cpfile) = fixture(3)?;
        // hand-craft a valid entry in a block beyond the next checkpoint
        // number, the way a stray or corrupted image would carry one
        let mut block = cpfile.get_cp_block(&store, 5, true)?;
        let mut entry = cpfile.read_entry(&block, 5)?;
        entry.clear_invalid();
        cpfile.write_entry(&mut block, 5, &entry);
        cpfile.census_add(&mut block, 1)?;
        store.write_block(&block)?;

        let report = cpfile.verify()?;
        assert!(!report.ok());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("next checkpoint number")));
        // the stray entry is not folded into the header aggregates
        assert_eq!(report.ncheckpoints, 3);
        assert_eq!(report.nsnapshots, 0);
        Ok(())
    }

    #[test]
    fn detects_header_drift() -> TestResult<()> {
        let (store, cpfile) = fixture(4)?;
        let mut block = store.get_block(0, false, None)?;
        let mut header = cpfile.read_header(&block)?;
        header.ch_ncheckpoints.set(99);
        cpfile.write_header(&mut block, &header);
        store.write_block(&block)?;
        let report = cpfile.verify()?;
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("checkpoints")));
        Ok(())
    }
}
