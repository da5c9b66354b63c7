//! zipread is a self-contained Zip archive reader.
//! Open an archive, list what's inside, and read entries out,
//! either right away or in the background:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use zipread::*;
//! let archive = Arc::new(ArchiveHandle::open("foo.zip")?);
//!
//! // The central directory is parsed once, up front.
//! println!("{} entries", archive.entry_count());
//! for name in archive.entry_names() {
//!     println!("{name}");
//! }
//!
//! // Read an entry, blocking until it's fully decompressed...
//! let readme = archive.read("README.txt")?;
//!
//! // ...or hand reads to a pool of workers.
//! // Callbacks run back on this thread when we ask for them.
//! let scheduler = TaskScheduler::new()?;
//! for name in archive.entry_names() {
//!     let owned_name = name.to_owned();
//!     archive.read_async(&scheduler, name, move |result| match result {
//!         Ok(bytes) => println!("{owned_name}: {} bytes", bytes.len()),
//!         Err(e) => eprintln!("{e}"),
//!     });
//! }
//! scheduler.run_until_idle();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Zip is an interesting archive format: unlike compressed tarballs often seen
//! in Linux land (`*.tar.gz`, `*.tar.zst`, ...),
//! each file in a Zip archive is compressed independently,
//! with a central directory telling us where to find each file.
//! This allows us to extract multiple files simultaneously so long as we can
//! read from multiple places at once.
//! Every read opens its own session on the archive's storage
//! (a fresh file handle, or a fresh cursor over in-memory bytes),
//! so concurrent reads never share a file position or decoder.
//!
//! Stored and Deflated entries are supported, as are Zip64 archives and
//! archives with data prepended to them (like self-extracting executables).
//! Encrypted entries, multi-disk archives, and writing are not.

pub mod catalog;
pub mod handle;
pub mod read;
pub mod result;
pub mod scheduler;
pub mod source;

pub use catalog::{ArchiveCatalog, CompressionMethod, EntryRecord, OpenOptions};
pub use handle::ArchiveHandle;
pub use read::ReadOptions;
pub use result::{OpenError, ReadError, ReadErrorKind, ReadResult, ZipError, ZipResult};
pub use scheduler::{SchedulerOptions, TaskScheduler, Ticket};

/// This crate's version, for anybody reporting what they're built with
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod arch;
mod crc_reader;
mod spec;
