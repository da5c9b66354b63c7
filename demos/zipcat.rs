use std::cell::RefCell;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::*;
use camino::Utf8PathBuf;
use log::*;
use structopt::*;

use zipread::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "zipcat",
    about = "Writes entries of a .zip file to stdout, or lists them"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Lists the entries in the archive instead of printing them.
    #[structopt(short, long)]
    list: bool,

    /// Don't check entries' CRC-32s.
    #[structopt(long)]
    no_verify: bool,

    /// Number of worker threads to read with (default: one per core)
    #[structopt(short, long)]
    jobs: Option<NonZeroUsize>,

    #[structopt(name("ZIP file"))]
    zip_path: Utf8PathBuf,

    /// Entries to print, in order
    #[structopt(name("ENTRY"))]
    entries: Vec<String>,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if args.zip_path.as_str().is_empty() {
        bail!("The ZIP file path can't be empty");
    }
    if let Some(pos) = args.entries.iter().position(String::is_empty) {
        bail!("Entry name #{} is empty", pos + 1);
    }

    info!("zipread {}", zipread::VERSION);
    let archive = Arc::new(ArchiveHandle::open(&args.zip_path).context("Couldn't load archive")?);

    if args.list || args.entries.is_empty() {
        list(&archive)
    } else {
        cat(&archive, &args)
    }
}

fn list(archive: &ArchiveHandle) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in archive.entries() {
        writeln!(
            out,
            "{:>10} {:>10} {:?} {}",
            entry.uncompressed_size, entry.compressed_size, entry.compression_method, entry.name
        )?;
    }
    writeln!(out, "{} entries", archive.entry_count())?;
    Ok(())
}

fn cat(archive: &Arc<ArchiveHandle>, args: &Opt) -> Result<()> {
    let mut options = SchedulerOptions::default();
    if let Some(jobs) = args.jobs {
        options.workers = jobs;
    }
    let scheduler = TaskScheduler::with_options(&options).context("Couldn't start workers")?;
    let read_options = ReadOptions {
        verify_checksum: !args.no_verify,
    };

    // Reads finish in whatever order; print them in the order asked.
    let results: Rc<RefCell<Vec<Option<ReadResult>>>> =
        Rc::new(RefCell::new(args.entries.iter().map(|_| None).collect()));
    for (i, name) in args.entries.iter().enumerate() {
        let results = results.clone();
        scheduler.submit_read_with(archive, name, read_options.clone(), move |result| {
            results.borrow_mut()[i] = Some(result);
        });
    }
    scheduler.run_until_idle();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for result in results.borrow_mut().drain(..) {
        let bytes = result.ok_or_else(|| anyhow!("Read never completed"))??;
        out.write_all(&bytes)?;
    }
    out.flush()?;
    Ok(())
}
