//! The archive's table of contents, parsed from its central directory.

use std::collections::HashSet;
use std::io::{prelude::*, SeekFrom};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use log::*;

use crate::arch::usize;
use crate::result::*;
use crate::spec;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    Stored,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// Metadata for a file or directory in the archive,
/// retrieved from its central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    /// The name of the entry, exactly as stored (no path cleanup).
    pub name: String,

    /// Position of the entry in the central directory
    pub index: usize,

    /// Compressed size of the file in bytes
    pub compressed_size: u64,

    /// Uncompressed size of the file in bytes
    pub uncompressed_size: u64,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// The offset to the local file header in the archive,
    /// relative to the start of the archive proper.
    pub local_header_offset: u64,

    /// True if the file is encrypted (decryption is unsupported)
    pub encrypted: bool,

    /// When the file was last modified, if the archive recorded a sane date
    pub last_modified: Option<NaiveDateTime>,

    /// Unix mode bits, if the file was archived in a Unix OS.
    ///
    /// This library does _not_ try to convert DOS permission bits into
    /// roughly-equivalent Unix mode bits.
    pub unix_mode: Option<u32>,

    /// The entry's comment, decoded like its name
    pub comment: String,

    /// General purpose bit flags
    pub(crate) flags: u16,
}

impl EntryRecord {
    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        self.uncompressed_size == 0 && self.name.ends_with('/')
    }

    /// Returns true if the given entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }
}

/// Knobs for opening an archive
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Since a ZIP archive's metadata sits at the back of the file,
    /// many formats consist of ZIP archives prepended with some other data.
    /// For example, a self-extracting archive is one with an executable in the front.
    ///
    /// If false, such archives fail to open with
    /// [`ZipError::PrependedWithUnknownBytes`].
    pub allow_prepended_data: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            allow_prepended_data: true,
        }
    }
}

/// The parsed central directory of one archive
///
/// Immutable once loaded, so it can be shared freely between readers.
#[derive(Debug)]
pub struct ArchiveCatalog {
    source_path: Utf8PathBuf,
    /// How many bytes of junk precede the archive proper
    archive_offset: u64,
    comment: Vec<u8>,
    entries: Vec<EntryRecord>,
}

/// Reads up to `len` bytes at `offset`, failing if there aren't that many.
///
/// Reading through `take()` instead of into a preallocated buffer keeps a
/// bogus length from allocating more than the source actually holds.
fn read_at<R: Read + Seek>(
    session: &mut R,
    offset: u64,
    len: u64,
    what: &'static str,
) -> ZipResult<Vec<u8>> {
    session.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    session.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(ZipError::Truncated(what));
    }
    Ok(buf)
}

impl ArchiveCatalog {
    /// Parses the central directory of the archive readable through `session`.
    pub fn load<R: Read + Seek>(
        source_path: &Utf8Path,
        session: &mut R,
        options: &OpenOptions,
    ) -> ZipResult<Self> {
        let archive_len = session.seek(SeekFrom::End(0))?;

        let tail_len = archive_len.min(
            (spec::EndOfCentralDirectory::max_distance_from_end()
                + spec::Zip64EndOfCentralDirectoryLocator::size_in_file()) as u64,
        );
        let tail_start = archive_len - tail_len;
        let tail = read_at(
            session,
            tail_start,
            tail_len,
            "End Of Central Directory Record",
        )?;

        let eocdr_posit_in_tail = spec::find_eocdr(&tail)?;
        let eocdr = spec::EndOfCentralDirectory::parse(&tail[eocdr_posit_in_tail..])?;
        trace!("{:?}", eocdr);
        let eocdr_posit = tail_start + eocdr_posit_in_tail as u64;

        if eocdr.disk_number != eocdr.disk_with_central_directory {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
                eocdr.disk_number, eocdr.disk_with_central_directory
            )));
        }
        if eocdr.entries != eocdr.entries_on_this_disk {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                eocdr.entries, eocdr.entries_on_this_disk
            )));
        }

        let zip64_eocdr_locator = eocdr_posit_in_tail
            .checked_sub(spec::Zip64EndOfCentralDirectoryLocator::size_in_file())
            .and_then(|posit| spec::Zip64EndOfCentralDirectoryLocator::parse(&tail[posit..]));

        let nominal_central_directory_offset: u64;
        let central_directory_size: u64;
        let entry_count: u64;

        // Zip files can be prepended by arbitrary junk,
        // so all the given positions might be off.
        // Calculate the offset.
        let archive_offset: u64;

        if let Some(zip64_eocdr_locator) = zip64_eocdr_locator {
            trace!("{:?}", zip64_eocdr_locator);

            if eocdr.disk_number as u32 != zip64_eocdr_locator.disk_with_central_directory {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                    eocdr.disk_number, zip64_eocdr_locator.disk_with_central_directory
                )));
            }
            if zip64_eocdr_locator.disks != 1 {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                    zip64_eocdr_locator.disks
                )));
            }

            // Search for the zip64 EOCDR, from its nominal starting position
            // to the end of where it could be.
            let search_start = zip64_eocdr_locator.zip64_eocdr_offset;
            let search_end =
                eocdr_posit - spec::Zip64EndOfCentralDirectoryLocator::size_in_file() as u64;
            let search_len = search_end.checked_sub(search_start).ok_or(
                ZipError::InvalidArchive("Invalid Zip64 End Of Central Directory offset"),
            )?;
            let search_space = read_at(
                session,
                search_start,
                search_len,
                "Zip64 End Of Central Directory Record",
            )?;

            let zip64_eocdr_posit = spec::find_zip64_eocdr(&search_space)?;
            // Since we're searching starting at the provided offset,
            // the returned position is the archive offset.
            archive_offset = zip64_eocdr_posit as u64;
            let zip64_eocdr =
                spec::Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_posit..])?;
            trace!("{:?}", zip64_eocdr);

            if zip64_eocdr.disk_number != zip64_eocdr.disk_with_central_directory {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: Zip64 disk ({}) != disk with central directory ({})",
                    zip64_eocdr.disk_number, zip64_eocdr.disk_with_central_directory
                )));
            }
            if zip64_eocdr.entries != zip64_eocdr.entries_on_this_disk {
                return Err(ZipError::UnsupportedArchive(format!(
                    "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                    zip64_eocdr.entries, zip64_eocdr.entries_on_this_disk
                )));
            }

            nominal_central_directory_offset = zip64_eocdr.central_directory_offset;
            central_directory_size = zip64_eocdr.central_directory_size;
            entry_count = zip64_eocdr.entries;
        } else {
            // The offset is the actual position versus the stored one.
            let actual_cdr_posit = eocdr_posit.checked_sub(eocdr.central_directory_size as u64);
            let nominal_offset = eocdr.central_directory_offset as u64;
            archive_offset = actual_cdr_posit
                .and_then(|off| off.checked_sub(nominal_offset))
                .ok_or(ZipError::InvalidArchive(
                    "Invalid central directory size or offset",
                ))?;
            nominal_central_directory_offset = nominal_offset;
            central_directory_size = eocdr.central_directory_size as u64;
            entry_count = eocdr.entries as u64;
        }

        if archive_offset != 0 {
            if !options.allow_prepended_data {
                return Err(ZipError::PrependedWithUnknownBytes(archive_offset));
            }
            warn!(
                "{} is prepended with {} bytes of unknown data",
                source_path, archive_offset
            );
        }

        trace!(
            "{} entries at nominal offset {}",
            entry_count,
            nominal_central_directory_offset
        );

        let central_directory = read_at(
            session,
            archive_offset + nominal_central_directory_offset,
            central_directory_size,
            "Central directory",
        )?;
        let mut central_directory = &central_directory[..];

        // Don't trust the count for an allocation size;
        // each entry takes at least 46 bytes.
        let mut entries = Vec::with_capacity(usize(entry_count.min(central_directory_size / 46))?);
        let mut seen = HashSet::new();

        for index in 0..usize(entry_count)? {
            let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
            trace!("{:?}", dir_entry);

            let record = EntryRecord::from_cde(&dir_entry, index)?;
            debug!("{:?}", record);
            if !seen.insert(record.name.clone()) {
                warn!(
                    "Duplicate entry for {} in {}; lookups will find the first one",
                    record.name, source_path
                );
            }
            entries.push(record);
        }

        Ok(Self {
            source_path: source_path.to_owned(),
            archive_offset,
            comment: eocdr.file_comment.to_vec(),
            entries,
        })
    }

    /// Finds the first entry with exactly the given name.
    ///
    /// ZIP allows duplicate names; the first in directory order wins.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == name)
    }

    pub fn entry(&self, index: usize) -> Option<&EntryRecord> {
        self.entries.get(index)
    }

    /// Returns the entries found in the ZIP archive's central directory,
    /// in the order they were found.
    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    /// Entry names in central directory order
    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_path(&self) -> &Utf8Path {
        &self.source_path
    }

    /// The number of bytes prepended to the archive
    pub fn archive_offset(&self) -> u64 {
        self.archive_offset
    }

    /// The archive's comment, as raw bytes.
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::read::{read_entry, ReadOptions};

    /// One stored entry whose header offset only lives in a Zip64 extra field,
    /// with Zip64 end-of-directory records in front of the regular one.
    fn zip64_archive(prefix: &[u8], zip64_disk_number: u32) -> Vec<u8> {
        let name = b"big.txt";
        let data = b"hello";
        let crc = crc32fast::hash(data);

        let mut zip = prefix.to_vec();
        let local_start = zip.len();
        zip.extend_from_slice(&[b'P', b'K', 3, 4]);
        zip.extend_from_slice(&45u16.to_le_bytes()); // version needed
        zip.extend_from_slice(&0x0800u16.to_le_bytes()); // UTF-8 names
        zip.extend_from_slice(&0u16.to_le_bytes()); // stored
        zip.extend_from_slice(&[0; 4]); // time & date
        zip.extend_from_slice(&crc.to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(name);
        zip.extend_from_slice(data);

        let cd_start = zip.len();
        zip.extend_from_slice(&[b'P', b'K', 1, 2]);
        zip.extend_from_slice(&0x031eu16.to_le_bytes()); // made on Unix
        zip.extend_from_slice(&45u16.to_le_bytes());
        zip.extend_from_slice(&0x0800u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&[0; 4]);
        zip.extend_from_slice(&crc.to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&12u16.to_le_bytes()); // extra field length
        zip.extend_from_slice(&0u16.to_le_bytes()); // comment length
        zip.extend_from_slice(&0u16.to_le_bytes()); // disk
        zip.extend_from_slice(&0u16.to_le_bytes()); // internal attributes
        zip.extend_from_slice(&(0o100644u32 << 16).to_le_bytes());
        zip.extend_from_slice(&u32::MAX.to_le_bytes()); // see the extra field
        zip.extend_from_slice(name);
        zip.extend_from_slice(&1u16.to_le_bytes());
        zip.extend_from_slice(&8u16.to_le_bytes());
        zip.extend_from_slice(&((local_start - prefix.len()) as u64).to_le_bytes());
        let cd_size = zip.len() - cd_start;

        let zip64_eocdr_start = zip.len();
        zip.extend_from_slice(&[b'P', b'K', 6, 6]);
        zip.extend_from_slice(&44u64.to_le_bytes());
        zip.extend_from_slice(&45u16.to_le_bytes());
        zip.extend_from_slice(&45u16.to_le_bytes());
        zip.extend_from_slice(&zip64_disk_number.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes()); // disk with the central directory
        zip.extend_from_slice(&1u64.to_le_bytes());
        zip.extend_from_slice(&1u64.to_le_bytes());
        zip.extend_from_slice(&(cd_size as u64).to_le_bytes());
        zip.extend_from_slice(&((cd_start - prefix.len()) as u64).to_le_bytes());

        zip.extend_from_slice(&[b'P', b'K', 6, 7]);
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&((zip64_eocdr_start - prefix.len()) as u64).to_le_bytes());
        zip.extend_from_slice(&1u32.to_le_bytes());

        zip.extend_from_slice(&[b'P', b'K', 5, 6]);
        zip.extend_from_slice(&[0; 4]); // disks
        zip.extend_from_slice(&u16::MAX.to_le_bytes());
        zip.extend_from_slice(&u16::MAX.to_le_bytes());
        zip.extend_from_slice(&u32::MAX.to_le_bytes());
        zip.extend_from_slice(&u32::MAX.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip
    }

    #[test]
    fn zip64_records() -> ZipResult<()> {
        let mut session = Cursor::new(zip64_archive(b"", 0));
        let catalog = ArchiveCatalog::load(
            Utf8Path::new("zip64.zip"),
            &mut session,
            &OpenOptions::default(),
        )?;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.archive_offset(), 0);

        let entry = catalog.entry(0).unwrap();
        assert_eq!(entry.name, "big.txt");
        assert_eq!(entry.local_header_offset, 0);
        assert_eq!(entry.unix_mode, Some(0o100644));

        let bytes = read_entry(&catalog, &mut session, 0, &ReadOptions::default()).unwrap();
        assert_eq!(bytes, b"hello");
        Ok(())
    }

    #[test]
    fn zip64_with_prepended_data() -> ZipResult<()> {
        let mut session = Cursor::new(zip64_archive(b"some junk up front", 0));
        let catalog = ArchiveCatalog::load(
            Utf8Path::new("zip64.zip"),
            &mut session,
            &OpenOptions::default(),
        )?;
        assert_eq!(catalog.archive_offset(), 18);
        let bytes = read_entry(&catalog, &mut session, 0, &ReadOptions::default()).unwrap();
        assert_eq!(bytes, b"hello");

        let strict = OpenOptions {
            allow_prepended_data: false,
        };
        let err = ArchiveCatalog::load(Utf8Path::new("zip64.zip"), &mut session, &strict);
        assert!(matches!(err, Err(ZipError::PrependedWithUnknownBytes(18))));
        Ok(())
    }

    #[test]
    fn zip64_multi_disk() {
        let mut session = Cursor::new(zip64_archive(b"", 3));
        let err = ArchiveCatalog::load(
            Utf8Path::new("spanned.zip"),
            &mut session,
            &OpenOptions::default(),
        );
        assert!(matches!(err, Err(ZipError::UnsupportedArchive(_))));
    }
}
