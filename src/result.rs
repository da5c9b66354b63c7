//! Error types and the related `Result<T>`

use camino::Utf8PathBuf;
use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

/// Problems with the archive's bytes themselves,
/// independent of which archive or entry we were looking at.
#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// The ZIP archive contained invalid data per the spec.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// A record ran past the end of the available data.
    #[error("Truncated Zip archive: {0}")]
    Truncated(&'static str),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIP archive uses an unsupported feature
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// The ZIP archive is prepended some unknown bytes.
    /// (Set [`OpenOptions::allow_prepended_data`] if this is okay.)
    ///
    /// [`OpenOptions::allow_prepended_data`]: crate::catalog::OpenOptions::allow_prepended_data
    #[error("Archive prepended with {0} unknown bytes")]
    PrependedWithUnknownBytes(u64),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Zip archive too large for address space")]
    InsufficientAddressSpace,
}

/// Opening an archive failed.
#[derive(Debug, Error)]
#[error("Couldn't open archive {path}: {source}")]
pub struct OpenError {
    pub path: Utf8PathBuf,
    #[source]
    pub source: ZipError,
}

impl OpenError {
    pub(crate) fn new<P: Into<Utf8PathBuf>>(path: P, source: ZipError) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Reading a single entry out of an open archive failed.
///
/// Each variant carries the archive path and the entry name so messages
/// make sense on their own once they've left the call site.
#[derive(Debug, Error)]
pub enum ReadError {
    /// No entry with the given name (or index) exists.
    #[error("No file found by the name of {name} in {archive}")]
    NotFound { archive: Utf8PathBuf, name: String },

    /// The entry is compressed (or encrypted) in a way we can't decode.
    #[error("Can't read {name} in {archive}: unsupported {detail}")]
    UnsupportedMethod {
        archive: Utf8PathBuf,
        name: String,
        detail: String,
    },

    /// The entry's bytes don't agree with its metadata.
    #[error("Corrupt data for {name} in {archive}: {reason}")]
    CorruptData {
        archive: Utf8PathBuf,
        name: String,
        reason: String,
    },

    /// Fewer bytes were available than the archive claimed.
    #[error("Truncated data for {name} in {archive}: {what}")]
    Truncated {
        archive: Utf8PathBuf,
        name: String,
        what: &'static str,
    },

    /// The underlying storage failed.
    #[error("I/O error reading {name} in {archive}: {source}")]
    IoFailure {
        archive: Utf8PathBuf,
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked while reading the entry.
    #[error("Worker panicked reading {name} in {archive}: {message}")]
    WorkerPanicked {
        archive: Utf8PathBuf,
        name: String,
        message: String,
    },
}

/// The broad category of a [`ReadError`], for callers that only need to branch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadErrorKind {
    NotFound,
    UnsupportedMethod,
    CorruptData,
    Truncated,
    IoFailure,
    WorkerPanicked,
}

impl ReadError {
    pub fn kind(&self) -> ReadErrorKind {
        match self {
            ReadError::NotFound { .. } => ReadErrorKind::NotFound,
            ReadError::UnsupportedMethod { .. } => ReadErrorKind::UnsupportedMethod,
            ReadError::CorruptData { .. } => ReadErrorKind::CorruptData,
            ReadError::Truncated { .. } => ReadErrorKind::Truncated,
            ReadError::IoFailure { .. } => ReadErrorKind::IoFailure,
            ReadError::WorkerPanicked { .. } => ReadErrorKind::WorkerPanicked,
        }
    }

    /// The entry name the failed read was for.
    pub fn entry_name(&self) -> &str {
        match self {
            ReadError::NotFound { name, .. }
            | ReadError::UnsupportedMethod { name, .. }
            | ReadError::CorruptData { name, .. }
            | ReadError::Truncated { name, .. }
            | ReadError::IoFailure { name, .. }
            | ReadError::WorkerPanicked { name, .. } => name,
        }
    }
}

pub type ReadResult = Result<Vec<u8>, ReadError>;
