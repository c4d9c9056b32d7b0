use std::env::set_var;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{arg, command, ArgAction, ArgMatches};
use log::*;

use cpfs::desc::{CpMode, Cpinfo, RawInode};
use cpfs::utils::{create_uuid, format_time, init_logs};
use cpfs::{prv, Cpfile, Root};
use meta_file::{FileMetaFile, FsError, MetaFile};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([image] "Checkpoint file image").default_value("cpfile.img"))
        .arg(arg!(--format "Create a fresh image").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--block_size <BYTES> "Block size used by --format")
            .required(false)
            .default_value("1024"))
        .arg(arg!(--cpsize <BYTES> "Checkpoint entry size used on first layout")
            .required(false)
            .default_value("256"))
        .arg(arg!(-c --create <N> "Create and finalize N checkpoints")
            .required(false))
        .arg(arg!(--chcp <SPEC> "Change mode, CNO:MODE with 0=checkpoint 1=snapshot")
            .required(false))
        .arg(arg!(--delete <CNO> "Delete one checkpoint")
            .required(false))
        .arg(arg!(--delete_range <RANGE> "Delete the checkpoints in [START:END)")
            .required(false))
        .arg(arg!(-l --list "List checkpoints").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-s --snapshots "List snapshots").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--stat "Print aggregate counters").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--check "Verify on-disk invariants").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-r --read_only "Open the image read only").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    if let Err(err) = run(&matches) {
        error!("cpfs: {} (errno {})", err, err.errno());
        std::process::exit(err.errno());
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), FsError> {
    let image = matches.get_one::<String>("image").unwrap();
    let read_only = matches.get_flag("read_only");
    info!("Image: {}", image);

    if matches.get_flag("format") || !Path::new(image).exists() {
        if read_only {
            return Err(FsError::ReadOnly);
        }
        let block_size =
            parse_u64(matches.get_one::<String>("block_size").unwrap(), "bad block size")? as usize;
        FileMetaFile::format(image, block_size, create_uuid())?;
        info!("formatted {} with {} byte blocks", image, block_size);
    }

    let store = Arc::new(FileMetaFile::open(image, read_only)?);
    let cpsize = match store.entry_size() {
        0 => parse_u64(matches.get_one::<String>("cpsize").unwrap(), "bad checkpoint size")?
            as usize,
        recorded => recorded,
    };
    prv!(cpsize, store.cno());
    let cpfile = Cpfile::read(Arc::clone(&store), cpsize, &RawInode::metadata_file(now_secs()))?;
    match cpfile.initialize() {
        Ok(()) => info!("cpfile laid out in {}", image),
        Err(FsError::Already) => {}
        Err(FsError::ReadOnly) => warn!("{} carries no cpfile and is read only", image),
        Err(err) => return Err(err),
    }

    // a range delete may make partial progress before reporting busy; keep
    // the error until the progress has been flushed
    let mut deferred = None;

    if let Some(n) = matches.get_one::<String>("create") {
        let n = parse_u64(n, "bad checkpoint count")?;
        let root = Root::new(RawInode::metadata_file(now_secs()));
        root.inodes_count.store(1, Ordering::Relaxed);
        for _ in 0..n {
            let cno = store.cno();
            cpfile.create_checkpoint(cno)?;
            cpfile.finalize_checkpoint(cno, &root, 1, now_secs(), false)?;
            store.set_cno(cno + 1);
            println!("checkpoint {} created", cno);
        }
    }

    if let Some(change) = matches.get_one::<String>("chcp") {
        let (cno, mode) = parse_pair(change, "bad mode change, want CNO:MODE")?;
        let mode = CpMode::try_from(mode as u32)
            .map_err(|_| FsError::Invalid(format!("unknown checkpoint mode {}", mode)))?;
        if cpfile.is_snapshot(cno)? == (mode == CpMode::Snapshot) {
            return Err(FsError::Already);
        }
        cpfile.change_cpmode(cno, mode)?;
        match mode {
            CpMode::Snapshot => println!("checkpoint {} is now a snapshot", cno),
            CpMode::Checkpoint => println!("snapshot {} is now a plain checkpoint", cno),
        }
    }

    if let Some(cno) = matches.get_one::<String>("delete") {
        let cno = parse_u64(cno, "bad checkpoint number")?;
        cpfile.delete_checkpoint(cno)?;
        println!("checkpoint {} deleted", cno);
    }

    if let Some(range) = matches.get_one::<String>("delete_range") {
        let (start, end) = parse_pair(range, "bad range, want START:END")?;
        match cpfile.delete_checkpoints(start, end) {
            Ok(()) => println!("checkpoints [{}, {}) deleted", start, end),
            Err(FsError::Busy(reason)) => {
                warn!("snapshots in [{}, {}) were left in place", start, end);
                deferred = Some(FsError::Busy(reason));
            }
            Err(err) => return Err(err),
        }
    }

    if matches.get_flag("list") {
        let mut cno = 1;
        loop {
            let batch = cpfile.get_cpinfo(&mut cno, CpMode::Checkpoint, 64)?;
            if batch.is_empty() {
                break;
            }
            for ci in &batch {
                print_cpinfo(ci);
            }
        }
    }

    if matches.get_flag("snapshots") {
        let mut cno = 0;
        loop {
            let batch = cpfile.get_cpinfo(&mut cno, CpMode::Snapshot, 64)?;
            if batch.is_empty() {
                break;
            }
            for ci in &batch {
                print_cpinfo(ci);
            }
        }
    }

    if matches.get_flag("stat") {
        let stat = cpfile.get_stat()?;
        println!(
            "next cno {}, {} checkpoints, {} snapshots",
            stat.cs_cno, stat.cs_ncps, stat.cs_nsss
        );
    }

    if matches.get_flag("check") {
        let report = cpfile.verify()?;
        println!(
            "{} blocks, {} checkpoints, {} snapshots",
            report.nblocks, report.ncheckpoints, report.nsnapshots
        );
        if !report.ok() {
            for error in &report.errors {
                error!("{}", error);
            }
            return Err(FsError::Corrupted(format!(
                "{} invariant violations",
                report.errors.len()
            )));
        }
        println!("clean");
    }

    store.flush()?;
    match deferred {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn print_cpinfo(ci: &Cpinfo) {
    println!(
        "{:>8}  {}  inodes {:>6}  blocks {:>6}  +{:<5} {}{}",
        ci.ci_cno,
        format_time(ci.ci_create),
        ci.ci_inodes_count,
        ci.ci_blocks_count,
        ci.ci_nblk_inc,
        if ci.is_snapshot() { "ss" } else { "cp" },
        if ci.is_minor() { " minor" } else { "" },
    );
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn parse_u64(s: &str, what: &str) -> Result<u64, FsError> {
    s.parse()
        .map_err(|_| FsError::Invalid(format!("{}: {}", what, s)))
}

fn parse_pair(s: &str, what: &str) -> Result<(u64, u64), FsError> {
    match s.split_once(':') {
        Some((a, b)) => Ok((parse_u64(a, what)?, parse_u64(b, what)?)),
        None => Err(FsError::Invalid(format!("{}: {}", what, s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parsing() {
        assert_eq!(parse_pair("4:8", "range").unwrap(), (4, 8));
        assert!(parse_pair("4-8", "range").is_err());
        assert!(parse_pair("4:x", "range").is_err());
    }
}
