//! Error taxonomy surfaced at every library boundary.
//!
//! Every operation that touches disk returns a [`Result`]; the library
//! propagates errors verbatim without mutating its own state beyond what
//! the disk has already accepted.  The engines translate per-file errors
//! into log entries and continue; write-path errors are fatal for the
//! current snapshot (chunks already written survive via the
//! cancelled-volume mechanism).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Existence check failed.  Recoverable by creating the file or by
    /// asking the media-change callback for a replacement path.
    #[error("No such file: {0}")]
    NoSuchFile(String),

    /// End-of-stream during a read with no length expectation.  Used as
    /// the natural terminator when consuming file bodies during backup.
    #[error("Short read: {0}")]
    ShortRead(String),

    /// Structural violation: wrong magic, wrong header type, payload whose
    /// decoded size or digest does not match, descriptor offsets beyond
    /// EOF, or an unresolvable snapshot reference.
    #[error("Corrupt backup: {0}")]
    CorruptBackup(String),

    /// A volume expected to carry a descriptor 2 had none.
    #[error("Not the last volume: {0}")]
    NotLastVolume(String),

    #[error("Generic error: {0}")]
    GenericError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NoSuchFile(e.to_string()),
            io::ErrorKind::UnexpectedEof => Error::ShortRead(e.to_string()),
            _ => Error::GenericError(e.to_string()),
        }
    }
}

impl Error {
    /// True if this is the short-read terminator rather than a hard fault.
    pub fn is_short_read(&self) -> bool {
        matches!(self, Error::ShortRead(_))
    }

    pub fn is_no_such_file(&self) -> bool {
        matches!(self, Error::NoSuchFile(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
