//! Where archive bytes come from.
//!
//! Reads never share a cursor or decoder: every one of them asks the
//! [`ArchiveSource`] for a fresh [`Session`], so any number of threads can
//! read from the same archive at once without stepping on each other.

use std::fs::File;
use std::io::{self, prelude::*, BufReader, Cursor, SeekFrom};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use log::*;

/// The storage backing an open archive
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// An archive on disk, reopened for every session.
    File(Utf8PathBuf),
    /// An archive already in memory. Sessions share the bytes.
    Memory { name: Utf8PathBuf, bytes: Arc<[u8]> },
}

impl ArchiveSource {
    /// The path (or, for in-memory archives, the name) used in messages.
    pub fn path(&self) -> &Utf8Path {
        match self {
            ArchiveSource::File(path) => path,
            ArchiveSource::Memory { name, .. } => name,
        }
    }

    /// Acquires an independent view of the archive's bytes.
    pub fn open_session(&self) -> io::Result<Session> {
        match self {
            ArchiveSource::File(path) => {
                trace!("Opening session on {}", path);
                let file = File::open(path)?;
                Ok(Session::File(BufReader::new(file)))
            }
            ArchiveSource::Memory { bytes, .. } => Ok(Session::Memory(Cursor::new(bytes.clone()))),
        }
    }
}

/// One reader's private view of an archive.
///
/// Dropping it closes whatever it opened.
#[derive(Debug)]
pub enum Session {
    File(BufReader<File>),
    Memory(Cursor<Arc<[u8]>>),
}

impl Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Session::File(f) => f.read(buf),
            Session::Memory(m) => m.read(buf),
        }
    }
}

impl Seek for Session {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Session::File(f) => f.seek(pos),
            Session::Memory(m) => m.seek(pos),
        }
    }
}
