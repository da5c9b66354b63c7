//! Builds small Zip archives for tests, byte by byte.
//!
//! Real tools won't write broken archives on request, so this lets each test
//! lie about exactly the field it cares about.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const STORED: u16 = 0;
pub const DEFLATE: u16 = 8;

// 2021-03-04 05:06:08
const DOS_DATE: u16 = (41 << 9) | (3 << 5) | 4;
const DOS_TIME: u16 = (5 << 11) | (6 << 5) | 4;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[derive(Debug, Clone)]
pub struct FixtureEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub method: u16,
    /// Bytes to store instead of compressing `data`
    pub compressed_override: Option<Vec<u8>>,
    pub crc_override: Option<u32>,
    /// Claimed for both the compressed and uncompressed size
    pub size_override: Option<u32>,
    /// Claimed for just the uncompressed size
    pub uncompressed_size_override: Option<u32>,
    pub local_name_override: Option<String>,
    pub local_method_override: Option<u16>,
    pub local_crc_override: Option<u32>,
    /// Claimed for both sizes, in the local header only
    pub local_size_override: Option<u32>,
    /// Zero the local CRC and sizes and put the real ones after the data
    pub data_descriptor: bool,
    pub encrypted: bool,
    /// Disk the central directory says the entry starts on
    pub disk_number: u16,
    pub comment: String,
}

impl FixtureEntry {
    pub fn new(name: &str, data: &[u8], method: u16) -> Self {
        Self {
            name: name.to_owned(),
            data: data.to_vec(),
            method,
            compressed_override: None,
            crc_override: None,
            size_override: None,
            uncompressed_size_override: None,
            local_name_override: None,
            local_method_override: None,
            local_crc_override: None,
            local_size_override: None,
            data_descriptor: false,
            encrypted: false,
            disk_number: 0,
            comment: String::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ZipBuilder {
    prefix: Vec<u8>,
    disk_number: u16,
    entries: Vec<FixtureEntry>,
    comment: Vec<u8>,
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.entry(FixtureEntry::new(name, data, STORED))
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.entry(FixtureEntry::new(name, data, DEFLATE))
    }

    pub fn entry(mut self, entry: FixtureEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Junk in front of the archive, like a self-extractor's executable.
    /// Offsets inside the archive don't account for it.
    pub fn prefix(mut self, junk: &[u8]) -> Self {
        self.prefix = junk.to_vec();
        self
    }

    /// Claims the end record is on another disk than the central directory.
    pub fn disk_number(mut self, disk: u16) -> Self {
        self.disk_number = disk;
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut archive = Vec::new();
        let mut central_directory = Vec::new();

        for entry in &self.entries {
            let compressed = match (&entry.compressed_override, entry.method) {
                (Some(raw), _) => raw.clone(),
                (None, DEFLATE) => deflate(&entry.data),
                (None, _) => entry.data.clone(),
            };
            let crc = entry
                .crc_override
                .unwrap_or_else(|| crc32fast::hash(&entry.data));
            let compressed_size = entry.size_override.unwrap_or(compressed.len() as u32);
            let uncompressed_size = entry
                .uncompressed_size_override
                .or(entry.size_override)
                .unwrap_or(entry.data.len() as u32);
            let mut flags = 1 << 11; // UTF-8 names
            if entry.encrypted {
                flags |= 1;
            }
            if entry.data_descriptor {
                flags |= 1 << 3;
            }
            let (local_crc, local_compressed_size, local_uncompressed_size) =
                if entry.data_descriptor {
                    (0, 0, 0)
                } else {
                    (
                        entry.local_crc_override.unwrap_or(crc),
                        entry.local_size_override.unwrap_or(compressed_size),
                        entry.local_size_override.unwrap_or(uncompressed_size),
                    )
                };
            let local_name = entry.local_name_override.as_ref().unwrap_or(&entry.name);
            let offset = archive.len() as u32;

            // An extended timestamp field, like Info-ZIP writes,
            // so the data doesn't start at a fixed distance from the header.
            let mut extra = Vec::new();
            put_u16(&mut extra, 0x5455);
            put_u16(&mut extra, 5);
            extra.push(1);
            put_u32(&mut extra, 1_614_834_368);

            put_u32(&mut archive, 0x04034b50);
            put_u16(&mut archive, 20);
            put_u16(&mut archive, flags);
            put_u16(&mut archive, entry.local_method_override.unwrap_or(entry.method));
            put_u16(&mut archive, DOS_TIME);
            put_u16(&mut archive, DOS_DATE);
            put_u32(&mut archive, local_crc);
            put_u32(&mut archive, local_compressed_size);
            put_u32(&mut archive, local_uncompressed_size);
            put_u16(&mut archive, local_name.len() as u16);
            put_u16(&mut archive, extra.len() as u16);
            archive.extend_from_slice(local_name.as_bytes());
            archive.extend_from_slice(&extra);
            archive.extend_from_slice(&compressed);
            if entry.data_descriptor {
                put_u32(&mut archive, 0x08074b50);
                put_u32(&mut archive, crc);
                put_u32(&mut archive, compressed_size);
                put_u32(&mut archive, uncompressed_size);
            }

            put_u32(&mut central_directory, 0x02014b50);
            put_u16(&mut central_directory, (3 << 8) | 20); // Made on Unix
            put_u16(&mut central_directory, 20);
            put_u16(&mut central_directory, flags);
            put_u16(&mut central_directory, entry.method);
            put_u16(&mut central_directory, DOS_TIME);
            put_u16(&mut central_directory, DOS_DATE);
            put_u32(&mut central_directory, crc);
            put_u32(&mut central_directory, compressed_size);
            put_u32(&mut central_directory, uncompressed_size);
            put_u16(&mut central_directory, entry.name.len() as u16);
            put_u16(&mut central_directory, 0);
            put_u16(&mut central_directory, entry.comment.len() as u16);
            put_u16(&mut central_directory, entry.disk_number);
            put_u16(&mut central_directory, 0);
            let mode: u32 = if entry.name.ends_with('/') {
                0o040755
            } else {
                0o100644
            };
            put_u32(&mut central_directory, mode << 16);
            put_u32(&mut central_directory, offset);
            central_directory.extend_from_slice(entry.name.as_bytes());
            central_directory.extend_from_slice(entry.comment.as_bytes());
        }

        let central_directory_offset = archive.len() as u32;
        archive.extend_from_slice(&central_directory);

        put_u32(&mut archive, 0x06054b50);
        put_u16(&mut archive, self.disk_number);
        put_u16(&mut archive, 0);
        put_u16(&mut archive, self.entries.len() as u16);
        put_u16(&mut archive, self.entries.len() as u16);
        put_u32(&mut archive, central_directory.len() as u32);
        put_u32(&mut archive, central_directory_offset);
        put_u16(&mut archive, self.comment.len() as u16);
        archive.extend_from_slice(&self.comment);

        let mut with_prefix = self.prefix.clone();
        with_prefix.extend(archive);
        with_prefix
    }

    /// Writes the archive into `dir` and returns its path.
    pub fn write_to(&self, dir: &Path, file_name: &str) -> Utf8PathBuf {
        let path = Utf8Path::from_path(dir)
            .expect("temp dir isn't UTF-8")
            .join(file_name);
        fs::write(&path, self.build()).expect("Couldn't write test archive");
        path
    }
}

/// The archive from the canonical example:
/// a stored "hello" and ten thousand deflated zeroes.
pub fn hello_archive() -> ZipBuilder {
    ZipBuilder::new()
        .stored("a.txt", b"hello")
        .deflated("b.txt", &[0; 10000])
}
