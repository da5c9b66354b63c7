//! Tools for reading entries out of a ZIP archive.
//!
//! Each entry is read through its own [`Session`](crate::source::Session):
//! we find the entry's local header, check it against the central directory,
//! then decompress the whole entry into memory.
//! Callers get either all of an entry's bytes or an error, never a prefix.

use std::io::{self, prelude::*, SeekFrom};

use camino::Utf8Path;
use flate2::read::DeflateDecoder;
use log::*;

use crate::arch::usize;
use crate::catalog::{ArchiveCatalog, CompressionMethod, EntryRecord};
use crate::crc_reader::{as_checksum_mismatch, Crc32Reader};
use crate::result::*;
use crate::spec;

/// Don't reserve more than this up front, whatever size the archive claims.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Knobs for reading an entry
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Check the decompressed data against the CRC-32 in the central directory.
    /// A mismatch fails the read with [`ReadError::CorruptData`].
    pub verify_checksum: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
        }
    }
}

/// Reads the entry at `index` in `catalog` from `session`, decompressing it fully.
pub fn read_entry<R: Read + Seek>(
    catalog: &ArchiveCatalog,
    session: &mut R,
    index: usize,
    options: &ReadOptions,
) -> ReadResult {
    let entry = catalog.entry(index).ok_or_else(|| ReadError::NotFound {
        archive: catalog.source_path().to_owned(),
        name: format!("entry #{index}"),
    })?;
    EntryReader {
        archive: catalog.source_path(),
        archive_offset: catalog.archive_offset(),
        entry,
    }
    .read(session, options)
}

/// Reads one entry, attaching the archive and entry name to anything that goes wrong.
struct EntryReader<'a> {
    archive: &'a Utf8Path,
    archive_offset: u64,
    entry: &'a EntryRecord,
}

impl EntryReader<'_> {
    fn read<R: Read + Seek>(&self, session: &mut R, options: &ReadOptions) -> ReadResult {
        let entry = self.entry;

        if entry.encrypted {
            return Err(self.unsupported(String::from("encryption")));
        }
        if let CompressionMethod::Unsupported(code) = entry.compression_method {
            return Err(self.unsupported(format!("compression method {code}")));
        }

        let header_posit = self
            .archive_offset
            .checked_add(entry.local_header_offset)
            .ok_or_else(|| self.corrupt("Local header offset out of range"))?;
        session
            .seek(SeekFrom::Start(header_posit))
            .map_err(|e| self.io(e))?;

        // The header's length depends on its name and extra field,
        // so read the fixed part first to find out how much follows.
        let mut header = vec![0; spec::LocalFileHeader::fixed_size_in_file()];
        self.read_exact(session, &mut header, "local file header")?;
        let variable_size = spec::LocalFileHeader::variable_size(&header).map_err(|e| self.zip(e))?;
        header.resize(header.len() + variable_size, 0);
        self.read_exact(
            session,
            &mut header[spec::LocalFileHeader::fixed_size_in_file()..],
            "local file header",
        )?;

        let local_header =
            spec::LocalFileHeader::parse_and_consume(&mut &header[..]).map_err(|e| self.zip(e))?;
        trace!("{:?}", local_header);
        let local_record =
            EntryRecord::from_local_header(&local_header, entry).map_err(|e| self.zip(e))?;
        debug!("Reading {:?}", local_record);
        self.check_local_metadata(&local_record)?;

        let mut compressed = Vec::new();
        session
            .by_ref()
            .take(entry.compressed_size)
            .read_to_end(&mut compressed)
            .map_err(|e| self.io(e))?;
        if (compressed.len() as u64) < entry.compressed_size {
            return Err(self.truncated("compressed data"));
        }

        self.decompress(&compressed, options)
    }

    /// The local header is redundant with the central directory,
    /// so any disagreement means somebody's lying.
    fn check_local_metadata(&self, local: &EntryRecord) -> Result<(), ReadError> {
        let central = self.entry;
        if local.name != central.name {
            return Err(self.corrupt(format!(
                "Local file header names {:?} instead",
                local.name
            )));
        }
        if !cfg!(feature = "check-local-metadata") {
            return Ok(());
        }
        if local.compression_method != central.compression_method {
            return Err(self.corrupt(
                "Central directory entry doesn't match local file header compression method",
            ));
        }
        // With a data descriptor, the local sizes and CRC are zeroed
        // and the real ones trail the data. The central directory has them too.
        if !spec::has_data_descriptor(local.flags)
            && (local.crc32 != central.crc32
                || local.compressed_size != central.compressed_size
                || local.uncompressed_size != central.uncompressed_size)
        {
            return Err(self.corrupt(
                "Central directory entry doesn't match local file header",
            ));
        }
        Ok(())
    }

    fn decompress(&self, compressed: &[u8], options: &ReadOptions) -> ReadResult {
        let entry = self.entry;

        if entry.compression_method == CompressionMethod::Stored
            && compressed.len() as u64 != entry.uncompressed_size
        {
            return Err(self.corrupt(format!(
                "Stored entry is {} bytes but claims to be {}",
                compressed.len(),
                entry.uncompressed_size
            )));
        }

        let mut reader = make_reader(
            entry.compression_method,
            entry.uncompressed_size,
            options.verify_checksum.then_some(entry.crc32),
            compressed,
        )
        .ok_or_else(|| self.unsupported(format!("{:?}", entry.compression_method)))?;

        let capacity = usize(entry.uncompressed_size.min(MAX_PREALLOCATION)).map_err(|e| self.zip(e))?;
        let mut output = Vec::with_capacity(capacity);
        // Everything's already in memory, so any error here came from
        // decoding bad data rather than from the storage.
        reader.read_to_end(&mut output).map_err(|e| {
            if let Some(mismatch) = as_checksum_mismatch(&e) {
                self.corrupt(mismatch.to_string())
            } else {
                self.corrupt(format!("Couldn't inflate: {e}"))
            }
        })?;

        if output.len() as u64 != entry.uncompressed_size {
            return Err(self.corrupt(format!(
                "Decompressed to {} bytes but expected {}",
                output.len(),
                entry.uncompressed_size
            )));
        }
        debug!("Read {} bytes of {}", output.len(), entry.name);
        Ok(output)
    }

    fn read_exact<R: Read>(
        &self,
        session: &mut R,
        buf: &mut [u8],
        what: &'static str,
    ) -> Result<(), ReadError> {
        session.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => self.truncated(what),
            _ => self.io(e),
        })
    }

    fn unsupported(&self, detail: String) -> ReadError {
        ReadError::UnsupportedMethod {
            archive: self.archive.to_owned(),
            name: self.entry.name.clone(),
            detail,
        }
    }

    fn corrupt<S: Into<String>>(&self, reason: S) -> ReadError {
        ReadError::CorruptData {
            archive: self.archive.to_owned(),
            name: self.entry.name.clone(),
            reason: reason.into(),
        }
    }

    fn truncated(&self, what: &'static str) -> ReadError {
        ReadError::Truncated {
            archive: self.archive.to_owned(),
            name: self.entry.name.clone(),
            what,
        }
    }

    fn io(&self, source: io::Error) -> ReadError {
        ReadError::IoFailure {
            archive: self.archive.to_owned(),
            name: self.entry.name.clone(),
            source,
        }
    }

    /// Maps format errors from parsing the local header.
    fn zip(&self, e: ZipError) -> ReadError {
        match e {
            ZipError::Io(source) => self.io(source),
            ZipError::Truncated(what) => self.truncated(what),
            other => self.corrupt(other.to_string()),
        }
    }
}

/// Returns a boxed read trait for a compressed file,
/// given its compression method and (if we're checking) expected CRC.
///
/// Output is capped at `size` bytes so a malicious stream can't balloon.
fn make_reader<'a, R: Read + 'a>(
    compression_method: CompressionMethod,
    size: u64,
    crc32: Option<u32>,
    reader: R,
) -> Option<Box<dyn Read + 'a>> {
    let decoded: Box<dyn Read + 'a> = match compression_method {
        CompressionMethod::Stored => Box::new(reader.take(size)),
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(reader).take(size)),
        CompressionMethod::Unsupported(_) => return None,
    };
    Some(match crc32 {
        Some(crc32) => Box::new(Crc32Reader::new(decoded, crc32)),
        None => decoded,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn read_all(mut reader: Box<dyn Read + '_>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn stored_passes_through() {
        let crc = crc32fast::hash(b"hello");
        let reader = make_reader(CompressionMethod::Stored, 5, Some(crc), &b"hello"[..]).unwrap();
        assert_eq!(read_all(reader).unwrap(), b"hello");
    }

    #[test]
    fn deflate_inflates() {
        let original = vec![0u8; 10000];
        let compressed = deflate(&original);
        assert!(compressed.len() < original.len());

        let crc = crc32fast::hash(&original);
        let reader =
            make_reader(CompressionMethod::Deflate, 10000, Some(crc), &compressed[..]).unwrap();
        assert_eq!(read_all(reader).unwrap(), original);
    }

    #[test]
    fn output_is_capped() {
        let compressed = deflate(&[7u8; 500]);
        let reader = make_reader(CompressionMethod::Deflate, 100, None, &compressed[..]).unwrap();
        assert_eq!(read_all(reader).unwrap().len(), 100);
    }

    #[test]
    fn bad_checksum() {
        let reader = make_reader(CompressionMethod::Stored, 5, Some(1234), &b"hello"[..]).unwrap();
        let err = read_all(reader).unwrap_err();
        assert!(as_checksum_mismatch(&err).is_some());

        // ...unless we don't care.
        let reader = make_reader(CompressionMethod::Stored, 5, None, &b"hello"[..]).unwrap();
        assert_eq!(read_all(reader).unwrap(), b"hello");
    }

    #[test]
    fn unsupported_method() {
        assert!(make_reader(CompressionMethod::Unsupported(12), 5, None, &b"hello"[..]).is_none());
    }
}
