//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`catalog`] and [`read`] modules.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! Unlike a reader working from a memory map, we're handed bytes from
//! files that may be cut short or crafted, so every field read is checked
//! against the space that's actually left.
//!
//! [`catalog`]: ../catalog/index.html
//! [`read`]: ../read/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;

use chrono::{NaiveDate, NaiveDateTime};
use codepage_437::*;
use memchr::memmem;

use crate::catalog::{CompressionMethod, EntryRecord};
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

/// Zip64 extended information extra field
const ZIP64_EXTRA_FIELD: u16 = 0x0001;

/// Fixed-size fields stored as 0xFFFFFFFF mean "look in the Zip64 extra field".
const ZIP64_SENTINEL: u32 = u32::MAX;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information. [...]
        //
        // 4.4.2.2 The current mappings are:
        //
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  3 - UNIX
        //  (and a long tail we don't care about)
        match source_version >> 8 {
            0 => System::Dos,
            3 => System::Unix,
            _ => System::Unknown,
        }
    }
}

/// Splits `n` bytes off the front of the provided slice, shrinking it.
fn take<'a>(input: &mut &'a [u8], n: usize) -> ZipResult<&'a [u8]> {
    if input.len() < n {
        return Err(ZipError::Truncated("Record ends before its declared length"));
    }
    let (taken, rest) = input.split_at(n);
    *input = rest;
    Ok(taken)
}

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> ZipResult<u64> {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(take(input, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> ZipResult<u32> {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(take(input, 4)?);
    Ok(u32::from_le_bytes(bytes))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> ZipResult<u16> {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(take(input, 2)?);
    Ok(u16::from_le_bytes(bytes))
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        if take(&mut eocdr, 4)? != EOCDR_MAGIC {
            return Err(ZipError::InvalidArchive(
                "Invalid End Of Central Directory Record",
            ));
        }
        let disk_number = read_u16(&mut eocdr)?;
        let disk_with_central_directory = read_u16(&mut eocdr)?;
        let entries_on_this_disk = read_u16(&mut eocdr)?;
        let entries = read_u16(&mut eocdr)?;
        let central_directory_size = read_u32(&mut eocdr)?;
        let central_directory_offset = read_u32(&mut eocdr)?;
        let comment_length = read_u16(&mut eocdr)?;
        let file_comment = take(&mut eocdr, comment_length as usize)?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    /// The size of the record, sans comment
    pub const fn size_in_file() -> usize {
        22
    }

    /// How far from the end of the archive the record could possibly start
    pub const fn max_distance_from_end() -> usize {
        Self::size_in_file() + u16::MAX as usize
    }
}

/// Searches backward through `tail` to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable size means we can't jump to a known offset.
pub fn find_eocdr(tail: &[u8]) -> ZipResult<usize> {
    memmem::rfind(tail, &EOCDR_MAGIC).ok_or(ZipError::InvalidArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    /// Returns `None` if there's no locator here, i.e., this isn't a Zip64 archive.
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if take(&mut mapping, 4).ok()? != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        let disk_with_central_directory = read_u32(&mut mapping).ok()?;
        let zip64_eocdr_offset = read_u64(&mut mapping).ok()?;
        let disks = read_u32(&mut mapping).ok()?;

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub const fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
///
/// Takes the place of the 16 and 32-bit fields in the
/// End of central directory record when an archive outgrows them.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn parse(mut eocdr: &[u8]) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        if take(&mut eocdr, 4)? != ZIP64_EOCDR_MAGIC {
            return Err(ZipError::InvalidArchive(
                "Invalid Zip64 End Of Central Directory Record",
            ));
        }
        let eocdr_size = read_u64(&mut eocdr)?;
        let _source_version = read_u16(&mut eocdr)?;
        let _minimum_extract_version = read_u16(&mut eocdr)?;
        let disk_number = read_u32(&mut eocdr)?;
        let disk_with_central_directory = read_u32(&mut eocdr)?;
        let entries_on_this_disk = read_u64(&mut eocdr)?;
        let entries = read_u64(&mut eocdr)?;
        let central_directory_size = read_u64(&mut eocdr)?;
        let central_directory_offset = read_u64(&mut eocdr)?;

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        //
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        if eocdr_size.saturating_add(12) < Self::fixed_size_in_file() as u64 {
            return Err(ZipError::InvalidArchive(
                "Invalid extensible data length in Zip64 End Of Central Directory Record",
            ));
        }

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }

    pub const fn fixed_size_in_file() -> usize {
        56
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the Zip64 EOCDR's nominal location,
/// but we might have to do some searching since ZIP archives can have
/// arbitrary junk up front.
pub fn find_zip64_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    memmem::find(mapping, &ZIP64_EOCDR_MAGIC).ok_or(ZipError::InvalidArchive(
        "Couldn't find zip64 End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        if take(entry, 4)? != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::InvalidArchive("Invalid central directory entry"));
        }
        let source_version = read_u16(entry)?;
        // We check the compression method itself instead.
        let _minimum_extract_version = read_u16(entry)?;
        let flags = read_u16(entry)?;
        let compression_method = read_u16(entry)?;
        let last_modified_time = read_u16(entry)?;
        let last_modified_date = read_u16(entry)?;
        let crc32 = read_u32(entry)?;
        let compressed_size = read_u32(entry)?;
        let uncompressed_size = read_u32(entry)?;
        let path_length = read_u16(entry)? as usize;
        let extra_field_length = read_u16(entry)? as usize;
        let file_comment_length = read_u16(entry)? as usize;
        let disk_number = read_u16(entry)?;
        let _internal_file_attributes = read_u16(entry)?;
        let external_file_attributes = read_u32(entry)?;
        let header_offset = read_u32(entry)?;
        let path = take(entry, path_length)?;
        let extra_field = take(entry, extra_field_length)?;
        let file_comment = take(entry, file_comment_length)?;

        Ok(Self {
            source_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers alllow for "streaming" decompression without
/// the use of the central directory,
/// but we only use them to double-check the central directory.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    pub fn parse_and_consume(header: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        if take(header, 4)? != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::InvalidArchive("Invalid local file header"));
        }
        let _minimum_extract_version = read_u16(header)?;
        let flags = read_u16(header)?;
        let compression_method = read_u16(header)?;
        let last_modified_time = read_u16(header)?;
        let last_modified_date = read_u16(header)?;
        let crc32 = read_u32(header)?;
        let compressed_size = read_u32(header)?;
        let uncompressed_size = read_u32(header)?;
        let path_length = read_u16(header)? as usize;
        let extra_field_length = read_u16(header)? as usize;
        let path = take(header, path_length)?;
        let extra_field = take(header, extra_field_length)?;

        Ok(Self {
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    /// The size of the header, sans name and extra field
    pub const fn fixed_size_in_file() -> usize {
        30
    }

    /// Given the fixed-size part of a local header,
    /// returns how many bytes of name and extra field follow it.
    pub fn variable_size(fixed: &[u8]) -> ZipResult<usize> {
        let mut lengths = fixed
            .get(26..Self::fixed_size_in_file())
            .ok_or(ZipError::Truncated("Local file header"))?;
        let path_length = read_u16(&mut lengths)? as usize;
        let extra_field_length = read_u16(&mut lengths)? as usize;
        Ok(path_length + extra_field_length)
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Extracts the "sizes and CRC follow the data" bit from the 16-bit flags field.
pub fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header.  The correct values are put in the
    //        data descriptor immediately following the compressed data.
    flags & (1 << 3) != 0
}

/// Decodes a name or comment, which share an encoding.
fn decode_name(raw: &[u8], flags: u16) -> ZipResult<String> {
    if is_utf8(flags) {
        Ok(std::str::from_utf8(raw)?.to_owned())
    } else {
        let name: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        Ok(name.into_owned())
    }
}

impl EntryRecord {
    /// Extracts an `EntryRecord` from a central directory entry
    pub(crate) fn from_cde(cde: &CentralDirectoryEntry, index: usize) -> ZipResult<Self> {
        let name = decode_name(cde.path, cde.flags)?;
        let comment = decode_name(cde.file_comment, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                name, cde.disk_number,
            )));
        }

        // Don't bomb on encrypted files here;
        // the rest of the archive can still be read.
        let encrypted = is_encrypted(cde.flags);

        let unix_mode = match System::from_source_version(cde.source_version) {
            System::Unix => Some(cde.external_file_attributes >> 16),
            System::Dos | System::Unknown => None,
        };

        let mut record = Self {
            name,
            index,
            compressed_size: cde.compressed_size as u64,
            uncompressed_size: cde.uncompressed_size as u64,
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            local_header_offset: cde.header_offset as u64,
            flags: cde.flags,
            encrypted,
            last_modified: parse_msdos(cde.last_modified_time, cde.last_modified_date),
            unix_mode,
            comment,
        };

        parse_extra_field(&mut record, cde.extra_field)?;

        Ok(record)
    }

    /// Extract metadata from a local file header.
    ///
    /// Since the local header doesn't contain its own offset or ordinal
    /// (we're at it already if we're reading the thing),
    /// take those from the central directory's record.
    pub(crate) fn from_local_header(
        local: &LocalFileHeader,
        central: &EntryRecord,
    ) -> ZipResult<Self> {
        let mut record = Self {
            name: decode_name(local.path, local.flags)?,
            index: central.index,
            compressed_size: local.compressed_size as u64,
            uncompressed_size: local.uncompressed_size as u64,
            compression_method: CompressionMethod::from_u16(local.compression_method),
            crc32: local.crc32,
            local_header_offset: central.local_header_offset,
            flags: local.flags,
            encrypted: is_encrypted(local.flags),
            last_modified: parse_msdos(local.last_modified_time, local.last_modified_date),
            unix_mode: central.unix_mode,
            comment: central.comment.clone(),
        };

        parse_extra_field(&mut record, local.extra_field)?;

        Ok(record)
    }
}

/// Decodes an MS-DOS time and date pair, or `None` if it's nonsense
/// (zeroed fields are common in archives written by sloppy tools).
pub fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Parses the "extra fields" found in central directory entries
/// and local file headers.
///
/// Currently we just look for Zip64 info (64-bit values for files > 2^32 in size)
fn parse_extra_field(record: &mut EntryRecord, mut extra_field: &[u8]) -> ZipResult<()> {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:
    //
    //     header1+data1 + header2+data2 . . .
    //
    // Each header MUST consist of:
    //
    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    while !extra_field.is_empty() {
        let kind = read_u16(&mut extra_field)?;
        let field_len = read_u16(&mut extra_field)? as usize;
        let mut data = take(&mut extra_field, field_len)?;

        if kind != ZIP64_EXTRA_FIELD {
            continue;
        }

        // 4.5.3 [...] The order of the fields in the zip64 extended
        // information record is fixed, but the fields MUST
        // only appear if the corresponding Local or Central
        // directory record field is set to 0xFFFF or 0xFFFFFFFF.
        if record.uncompressed_size == ZIP64_SENTINEL as u64 {
            record.uncompressed_size = read_u64(&mut data)?;
        }
        if record.compressed_size == ZIP64_SENTINEL as u64 {
            record.compressed_size = read_u64(&mut data)?;
        }
        if record.local_header_offset == ZIP64_SENTINEL as u64 {
            record.local_header_offset = read_u64(&mut data)?;
        }
        if !data.is_empty() {
            // All that could be left is the disk number.
            // We already checked many times that this isn't a multi-disk archive.
            let disk = read_u32(&mut data)?;
            if disk != 0 || !data.is_empty() {
                return Err(ZipError::InvalidArchive(
                    "Zip64 extra field contains unexpected data",
                ));
            }
        }
    }
    Ok(())
}
