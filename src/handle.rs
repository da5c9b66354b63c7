//! Open archives

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use log::*;

use crate::catalog::{ArchiveCatalog, EntryRecord, OpenOptions};
use crate::read::{self, ReadOptions};
use crate::result::*;
use crate::scheduler::{TaskScheduler, Ticket};
use crate::source::ArchiveSource;

/// A ZIP archive to be read
///
/// The catalog is parsed once, when the archive is opened,
/// and never changes afterwards. Reads don't share any state with each other
/// (each gets its own session over the archive's storage),
/// so a handle can be shared between threads with an `Arc`
/// and read from all of them at once.
#[derive(Debug)]
pub struct ArchiveHandle {
    source: ArchiveSource,
    catalog: ArchiveCatalog,
}

impl ArchiveHandle {
    /// Opens the archive at the given path and reads its central directory.
    ///
    /// ```no_run
    /// # use zipread::*;
    /// let archive = ArchiveHandle::open("foo.zip")?;
    /// for name in archive.entry_names() {
    ///     println!("{name}");
    /// }
    /// let bytes = archive.read("some/specific/file")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open<P: AsRef<Utf8Path>>(path: P) -> Result<Self, OpenError> {
        Self::open_with(path, &OpenOptions::default())
    }

    pub fn open_with<P: AsRef<Utf8Path>>(path: P, options: &OpenOptions) -> Result<Self, OpenError> {
        Self::from_source(ArchiveSource::File(path.as_ref().to_owned()), options)
    }

    /// Reads an archive that's already in memory.
    /// `name` is only used to identify the archive in errors and logs.
    pub fn from_bytes<N, B>(name: N, bytes: B) -> Result<Self, OpenError>
    where
        N: Into<Utf8PathBuf>,
        B: Into<Arc<[u8]>>,
    {
        Self::from_bytes_with(name, bytes, &OpenOptions::default())
    }

    pub fn from_bytes_with<N, B>(name: N, bytes: B, options: &OpenOptions) -> Result<Self, OpenError>
    where
        N: Into<Utf8PathBuf>,
        B: Into<Arc<[u8]>>,
    {
        let source = ArchiveSource::Memory {
            name: name.into(),
            bytes: bytes.into(),
        };
        Self::from_source(source, options)
    }

    fn from_source(source: ArchiveSource, options: &OpenOptions) -> Result<Self, OpenError> {
        info!("Opening {}", source.path());
        // The session used to parse the catalog is dropped (and closed)
        // before we return, success or not.
        let catalog = source
            .open_session()
            .map_err(ZipError::Io)
            .and_then(|mut session| ArchiveCatalog::load(source.path(), &mut session, options))
            .map_err(|e| OpenError::new(source.path(), e))?;
        debug!("{} has {} entries", source.path(), catalog.len());

        Ok(Self { source, catalog })
    }

    /// The path the archive was opened from
    pub fn path(&self) -> &Utf8Path {
        self.source.path()
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    /// Returns the entries found in the ZIP archive's central directory.
    ///
    /// No effort is made to deduplicate or otherwise validate these entries.
    pub fn entries(&self) -> &[EntryRecord] {
        self.catalog.entries()
    }

    pub fn entry_count(&self) -> usize {
        self.catalog.len()
    }

    /// Entry names, in central directory order
    pub fn entry_names(&self) -> Vec<&str> {
        self.catalog.names().collect()
    }

    /// Looks up an entry's metadata by its exact name.
    pub fn lookup(&self, name: &str) -> Option<&EntryRecord> {
        self.catalog
            .lookup(name)
            .and_then(|index| self.catalog.entry(index))
    }

    /// Reads the named entry out of the archive, fully decompressed.
    pub fn read(&self, name: &str) -> ReadResult {
        self.read_with(name, &ReadOptions::default())
    }

    pub fn read_with(&self, name: &str, options: &ReadOptions) -> ReadResult {
        let index = self
            .catalog
            .lookup(name)
            .ok_or_else(|| ReadError::NotFound {
                archive: self.path().to_owned(),
                name: name.to_owned(),
            })?;
        self.read_index_with(index, options)
    }

    /// Reads the entry at the given position in the central directory.
    pub fn read_index(&self, index: usize) -> ReadResult {
        self.read_index_with(index, &ReadOptions::default())
    }

    pub fn read_index_with(&self, index: usize, options: &ReadOptions) -> ReadResult {
        let mut session = self.source.open_session().map_err(|source| {
            let name = self
                .catalog
                .entry(index)
                .map(|entry| entry.name.clone())
                .unwrap_or_else(|| format!("entry #{index}"));
            ReadError::IoFailure {
                archive: self.path().to_owned(),
                name,
                source,
            }
        })?;
        read::read_entry(&self.catalog, &mut session, index, options)
    }

    /// Reads the named entry on `scheduler`'s worker pool.
    ///
    /// `on_complete` runs later, on the thread that owns the scheduler,
    /// when it next polls for completions.
    /// The handle stays alive until then.
    pub fn read_async<F>(self: &Arc<Self>, scheduler: &TaskScheduler, name: &str, on_complete: F) -> Ticket
    where
        F: FnOnce(ReadResult) + 'static,
    {
        scheduler.submit_read(self, name, on_complete)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn handles_are_shareable() {
        assert_send_sync::<ArchiveHandle>();
        assert_send_sync::<Arc<ArchiveHandle>>();
    }

    #[test]
    fn garbage_isnt_an_archive() {
        let err = ArchiveHandle::from_bytes("garbage.zip", &b"this is not a zip file"[..]).unwrap_err();
        assert_eq!(err.path, "garbage.zip");
        assert!(matches!(err.source, ZipError::InvalidArchive(_)));
        assert!(err.to_string().contains("garbage.zip"));
    }

    #[test]
    fn empty_archive() {
        // Nothing but an End Of Central Directory Record
        let mut bytes = vec![b'P', b'K', 5, 6];
        bytes.resize(22, 0);
        let archive = ArchiveHandle::from_bytes("empty.zip", bytes).unwrap();
        assert_eq!(archive.entry_count(), 0);
        assert!(archive.entry_names().is_empty());
        assert!(matches!(
            archive.read("anything"),
            Err(ReadError::NotFound { .. })
        ));
        assert!(matches!(
            archive.read_index(0),
            Err(ReadError::NotFound { .. })
        ));
    }
}
