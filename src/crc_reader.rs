//! Helper module to compute a CRC32 checksum
//!
//! Borrowed from zip-rs:
//! <https://github.com/mvdnes/zip-rs/commit/b3c836d9c32efa120cdd5366280f940d3c3b985c>

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;
use thiserror::Error;

/// Carried inside the `io::Error` a [`Crc32Reader`] returns on a bad checksum,
/// so callers can tell it apart from other I/O trouble.
#[derive(Debug, Error)]
#[error("Invalid checksum: expected {expected:08x}, computed {actual:08x}")]
pub struct ChecksumMismatch {
    pub expected: u32,
    pub actual: u32,
}

/// Reader that validates the CRC32 when it reaches the EOF.
pub struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    provided_checksum: u32,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, provided_checksum: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            provided_checksum,
        }
    }

    /// Returns an error if the final checksum doesn't match the one provided by `new()`
    fn check_matches(&self) -> io::Result<()> {
        let actual = self.hasher.clone().finalize();
        if actual == self.provided_checksum {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ChecksumMismatch {
                    expected: self.provided_checksum,
                    actual,
                },
            ))
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = match self.inner.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.check_matches()?;
                0
            }
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        self.hasher.update(&buf[0..count]);
        Ok(count)
    }
}

/// Digs a [`ChecksumMismatch`] back out of an I/O error, if that's what it was.
pub fn as_checksum_mismatch(e: &io::Error) -> Option<&ChecksumMismatch> {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<ChecksumMismatch>())
}
